use vek::Vec2;

use crate::body::Body;

use super::{
    solver::{apply_impulses, bias_coef, k_scalar, normal_relative_velocity},
    ConstraintKind, Limits,
};

/// Keeps two anchor points at a fixed distance.
pub struct PinJoint {
    /// Anchor on the first body, in body-local coordinates.
    pub anchor_a: Vec2<f64>,
    /// Anchor on the second body, in body-local coordinates.
    pub anchor_b: Vec2<f64>,
    /// Distance to maintain, measured at creation when left unset.
    pub dist: Option<f64>,

    /// World offset of the first anchor from its body center.
    r1: Vec2<f64>,
    /// World offset of the second anchor from its body center.
    r2: Vec2<f64>,
    /// Direction between the anchors.
    n: Vec2<f64>,
    /// Effective mass along the direction.
    n_mass: f64,
    /// Accumulated impulse.
    jn_acc: f64,
    /// Correction velocity for the distance error.
    bias: f64,
}

impl PinJoint {
    /// Pin two bodies at the distance their anchors have when the constraint
    /// is added to the space.
    pub fn new(anchor_a: Vec2<f64>, anchor_b: Vec2<f64>) -> Self {
        Self {
            anchor_a,
            anchor_b,
            dist: None,
            r1: Vec2::zero(),
            r2: Vec2::zero(),
            n: Vec2::zero(),
            n_mass: 0.0,
            jn_acc: 0.0,
            bias: 0.0,
        }
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        self.r1 = a.transform.vect(self.anchor_a - a.cog);
        self.r2 = b.transform.vect(self.anchor_b - b.cog);

        let delta = (b.p + self.r2) - (a.p + self.r1);
        let dist = delta.magnitude();
        self.n = delta * (if dist != 0.0 { dist } else { f64::INFINITY }).recip();

        self.n_mass = k_scalar(a, b, self.r1, self.r2, self.n).recip();

        let error = dist - self.dist.unwrap_or(0.0);
        self.bias = (-bias_coef(limits.error_bias, dt) * error / dt)
            .clamp(-limits.max_bias, limits.max_bias);
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        apply_impulses(a, b, self.r1, self.r2, self.n * (self.jn_acc * dt_coef));
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        let jn_max = limits.max_force * dt;

        let vrn = normal_relative_velocity(a, b, self.r1, self.r2, self.n);
        let jn = (self.bias - vrn) * self.n_mass;
        let jn_old = self.jn_acc;
        self.jn_acc = (jn_old + jn).clamp(-jn_max, jn_max);

        apply_impulses(a, b, self.r1, self.r2, self.n * (self.jn_acc - jn_old));
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.jn_acc.abs()
    }
}

impl From<PinJoint> for ConstraintKind {
    fn from(joint: PinJoint) -> Self {
        ConstraintKind::Pin(joint)
    }
}
