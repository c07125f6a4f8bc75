use vek::Vec2;

use crate::{body::Body, math::clamp_magnitude};

use super::{
    solver::{apply_impulses, bias_coef, k_tensor, relative_velocity, Mat2x2},
    ConstraintKind, Limits,
};

/// Holds two anchor points together while allowing rotation around them.
pub struct PivotJoint {
    /// Anchor on the first body, in body-local coordinates.
    pub anchor_a: Vec2<f64>,
    /// Anchor on the second body, in body-local coordinates.
    pub anchor_b: Vec2<f64>,

    /// World offset of the first anchor from its body center.
    r1: Vec2<f64>,
    /// World offset of the second anchor from its body center.
    r2: Vec2<f64>,
    /// Inverted effective mass tensor.
    k: Mat2x2,
    /// Accumulated impulse.
    j_acc: Vec2<f64>,
    /// Correction velocity for the anchor separation.
    bias: Vec2<f64>,
}

impl PivotJoint {
    /// Pivot two bodies around a pair of body-local anchors.
    ///
    /// [`crate::Space::add_pivot_joint`] is the convenient way to construct
    /// this from a single world point.
    pub fn new(anchor_a: Vec2<f64>, anchor_b: Vec2<f64>) -> Self {
        Self {
            anchor_a,
            anchor_b,
            r1: Vec2::zero(),
            r2: Vec2::zero(),
            k: Mat2x2::default(),
            j_acc: Vec2::zero(),
            bias: Vec2::zero(),
        }
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        self.r1 = a.transform.vect(self.anchor_a - a.cog);
        self.r2 = b.transform.vect(self.anchor_b - b.cog);

        self.k = k_tensor(a, b, self.r1, self.r2);

        let delta = (b.p + self.r2) - (a.p + self.r1);
        self.bias = clamp_magnitude(
            delta * (-bias_coef(limits.error_bias, dt) / dt),
            limits.max_bias,
        );
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        apply_impulses(a, b, self.r1, self.r2, self.j_acc * dt_coef);
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        let vr = relative_velocity(a, b, self.r1, self.r2);

        let j = self.k.transform(self.bias - vr);
        let j_old = self.j_acc;
        self.j_acc = clamp_magnitude(j_old + j, limits.max_force * dt);

        apply_impulses(a, b, self.r1, self.r2, self.j_acc - j_old);
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.magnitude()
    }
}

impl From<PivotJoint> for ConstraintKind {
    fn from(joint: PivotJoint) -> Self {
        ConstraintKind::Pivot(joint)
    }
}
