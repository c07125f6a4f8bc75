use vek::Vec2;

use crate::body::Body;

use super::{
    solver::{apply_impulses, bias_coef, k_scalar, normal_relative_velocity},
    ConstraintKind, Limits,
};

/// Keeps the distance between two anchor points inside a range.
pub struct SlideJoint {
    /// Anchor on the first body, in body-local coordinates.
    pub anchor_a: Vec2<f64>,
    /// Anchor on the second body, in body-local coordinates.
    pub anchor_b: Vec2<f64>,
    /// Smallest allowed distance.
    pub min: f64,
    /// Largest allowed distance.
    pub max: f64,

    /// World offset of the first anchor from its body center.
    r1: Vec2<f64>,
    /// World offset of the second anchor from its body center.
    r2: Vec2<f64>,
    /// Push direction, zero while the distance is inside the range.
    n: Vec2<f64>,
    /// Effective mass along the direction.
    n_mass: f64,
    /// Accumulated impulse.
    jn_acc: f64,
    /// Correction velocity for the distance error.
    bias: f64,
}

impl SlideJoint {
    /// Constrain the anchor distance to the `min..=max` range.
    pub fn new(anchor_a: Vec2<f64>, anchor_b: Vec2<f64>, min: f64, max: f64) -> Self {
        Self {
            anchor_a,
            anchor_b,
            min,
            max,
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

        let mut pdist = 0.0;
        if dist > self.max {
            pdist = dist - self.max;
            self.n = delta.try_normalized().unwrap_or_default();
        } else if dist < self.min {
            pdist = self.min - dist;
            self.n = -delta.try_normalized().unwrap_or_default();
        } else {
            // Inside the range the joint stays passive this step.
            self.n = Vec2::zero();
            self.jn_acc = 0.0;
        }

        self.n_mass = k_scalar(a, b, self.r1, self.r2, self.n).recip();

        self.bias =
            (-bias_coef(limits.error_bias, dt) * pdist / dt).clamp(-limits.max_bias, limits.max_bias);
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        apply_impulses(a, b, self.r1, self.r2, self.n * (self.jn_acc * dt_coef));
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        if self.n == Vec2::zero() {
            return;
        }

        let n = self.n;
        let vrn = normal_relative_velocity(a, b, self.r1, self.r2, n);

        // The joint only ever pulls the distance back into the range.
        let jn = (self.bias - vrn) * self.n_mass;
        let jn_old = self.jn_acc;
        self.jn_acc = (jn_old + jn).clamp(-limits.max_force * dt, 0.0);

        apply_impulses(a, b, self.r1, self.r2, n * (self.jn_acc - jn_old));
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.jn_acc.abs()
    }
}

impl From<SlideJoint> for ConstraintKind {
    fn from(joint: SlideJoint) -> Self {
        ConstraintKind::Slide(joint)
    }
}
