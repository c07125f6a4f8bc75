use vek::Vec2;

use crate::{
    body::Body,
    math::{clamp_magnitude, perp, perp_dot},
};

use super::{
    solver::{apply_impulses, bias_coef, k_tensor, relative_velocity, Mat2x2},
    ConstraintKind, Limits,
};

/// Pins an anchor of the second body onto a groove segment of the first.
pub struct GrooveJoint {
    /// Start of the groove on the first body, in body-local coordinates.
    pub groove_a: Vec2<f64>,
    /// End of the groove on the first body, in body-local coordinates.
    pub groove_b: Vec2<f64>,
    /// Anchor on the second body, in body-local coordinates.
    pub anchor_b: Vec2<f64>,

    /// Groove normal in body-local coordinates.
    groove_n: Vec2<f64>,
    /// Groove normal in world coordinates.
    groove_tn: Vec2<f64>,
    /// Which groove end the anchor is clamped against, zero in between.
    clamp: f64,
    /// World offset of the constrained point from the first body center.
    r1: Vec2<f64>,
    /// World offset of the anchor from the second body center.
    r2: Vec2<f64>,
    /// Inverted effective mass tensor.
    k: Mat2x2,
    /// Accumulated impulse.
    j_acc: Vec2<f64>,
    /// Correction velocity for the anchor separation.
    bias: Vec2<f64>,
}

impl GrooveJoint {
    /// Constrain the second body's anchor onto the groove of the first body.
    pub fn new(groove_a: Vec2<f64>, groove_b: Vec2<f64>, anchor_b: Vec2<f64>) -> Self {
        let groove_n = perp((groove_b - groove_a).try_normalized().unwrap_or_default());

        Self {
            groove_a,
            groove_b,
            anchor_b,
            groove_n,
            groove_tn: Vec2::zero(),
            clamp: 0.0,
            r1: Vec2::zero(),
            r2: Vec2::zero(),
            k: Mat2x2::default(),
            j_acc: Vec2::zero(),
            bias: Vec2::zero(),
        }
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        let ta = a.transform.point(self.groove_a);
        let tb = a.transform.point(self.groove_b);

        let n = a.transform.vect(self.groove_n);
        let d = ta.dot(n);

        self.groove_tn = n;
        self.r2 = b.transform.vect(self.anchor_b - b.cog);

        // Project the anchor onto the groove and clamp it to the endpoints.
        let td = perp_dot(b.p + self.r2, n);
        if td <= perp_dot(ta, n) {
            self.clamp = 1.0;
            self.r1 = ta - a.p;
        } else if td >= perp_dot(tb, n) {
            self.clamp = -1.0;
            self.r1 = tb - a.p;
        } else {
            self.clamp = 0.0;
            self.r1 = perp(n) * -td + n * d - a.p;
        }

        self.k = k_tensor(a, b, self.r1, self.r2);

        let delta = (b.p + self.r2) - (a.p + self.r1);
        self.bias = clamp_magnitude(
            delta * (-bias_coef(limits.error_bias, dt) / dt),
            limits.max_bias,
        );
    }

    /// Clamp an impulse so the joint never pulls the anchor along the groove
    /// past an endpoint it is resting against.
    fn constrain(&self, j: Vec2<f64>, max: f64) -> Vec2<f64> {
        let n = self.groove_tn;

        let j_clamp = if self.clamp * perp_dot(j, n) > 0.0 {
            j
        } else {
            // Project out the along-groove part.
            n * (j.dot(n) / n.dot(n))
        };

        clamp_magnitude(j_clamp, max)
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        apply_impulses(a, b, self.r1, self.r2, self.j_acc * dt_coef);
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        let vr = relative_velocity(a, b, self.r1, self.r2);

        let j = self.k.transform(self.bias - vr);
        let j_old = self.j_acc;
        self.j_acc = self.constrain(j_old + j, limits.max_force * dt);

        apply_impulses(a, b, self.r1, self.r2, self.j_acc - j_old);
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.magnitude()
    }
}

impl From<GrooveJoint> for ConstraintKind {
    fn from(joint: GrooveJoint) -> Self {
        ConstraintKind::Groove(joint)
    }
}
