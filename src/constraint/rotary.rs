//! Constraints acting only on the angular degrees of freedom.

use crate::body::Body;

use super::{solver::bias_coef, ConstraintKind, Limits};

/// Limits the relative angle between two bodies to a range.
pub struct RotaryLimitJoint {
    /// Smallest allowed relative angle in radians.
    pub min: f64,
    /// Largest allowed relative angle in radians.
    pub max: f64,

    /// Effective angular mass.
    i_sum: f64,
    /// Correction velocity for the angle error.
    bias: f64,
    /// Accumulated impulse.
    j_acc: f64,
}

impl RotaryLimitJoint {
    /// Constrain the relative angle to the `min..=max` range.
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            i_sum: 0.0,
            bias: 0.0,
            j_acc: 0.0,
        }
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        let dist = b.a - a.a;

        let mut pdist = 0.0;
        if dist > self.max {
            pdist = self.max - dist;
        } else if dist < self.min {
            pdist = self.min - dist;
        }

        self.i_sum = (a.i_inv + b.i_inv).recip();

        self.bias =
            (-bias_coef(limits.error_bias, dt) * pdist / dt).clamp(-limits.max_bias, limits.max_bias);

        // Inside the range the accumulated impulse doesn't carry over.
        if self.bias == 0.0 {
            self.j_acc = 0.0;
        }
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        let j = self.j_acc * dt_coef;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        if self.bias == 0.0 {
            return;
        }

        let wr = b.w - a.w;
        let j_max = limits.max_force * dt;

        let j = -(self.bias + wr) * self.i_sum;
        let j_old = self.j_acc;
        self.j_acc = if self.bias < 0.0 {
            (j_old + j).clamp(0.0, j_max)
        } else {
            (j_old + j).clamp(-j_max, 0.0)
        };
        let j = self.j_acc - j_old;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.abs()
    }
}

impl From<RotaryLimitJoint> for ConstraintKind {
    fn from(joint: RotaryLimitJoint) -> Self {
        ConstraintKind::RotaryLimit(joint)
    }
}

/// Allows rotation in one direction with a click of backlash in the other.
pub struct RatchetJoint {
    /// Angle offset of the ratchet clicks.
    pub phase: f64,
    /// Click distance, the sign picks the free direction.
    pub ratchet: f64,
    /// Angle the ratchet currently rests at, measured at creation when unset.
    pub angle: Option<f64>,

    /// Effective angular mass.
    i_sum: f64,
    /// Correction velocity for the angle error.
    bias: f64,
    /// Accumulated impulse.
    j_acc: f64,
}

impl RatchetJoint {
    /// Ratchet the relative angle of two bodies.
    pub fn new(phase: f64, ratchet: f64) -> Self {
        Self {
            phase,
            ratchet,
            angle: None,
            i_sum: 0.0,
            bias: 0.0,
            j_acc: 0.0,
        }
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        let angle = self.angle.unwrap_or(0.0);
        let delta = b.a - a.a;
        let diff = angle - delta;

        let mut pdist = 0.0;
        if diff * self.ratchet > 0.0 {
            pdist = diff;
        } else {
            // Click over to the next resting angle.
            self.angle =
                Some(((delta - self.phase) / self.ratchet).floor() * self.ratchet + self.phase);
        }

        self.i_sum = (a.i_inv + b.i_inv).recip();

        self.bias =
            (-bias_coef(limits.error_bias, dt) * pdist / dt).clamp(-limits.max_bias, limits.max_bias);

        if self.bias == 0.0 {
            self.j_acc = 0.0;
        }
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        let j = self.j_acc * dt_coef;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        if self.bias == 0.0 {
            return;
        }

        let wr = b.w - a.w;
        let j_max = limits.max_force * dt;

        let j = -(self.bias + wr) * self.i_sum;
        let j_old = self.j_acc;
        self.j_acc = ((j_old + j) * self.ratchet).clamp(0.0, j_max) / self.ratchet;
        let j = self.j_acc - j_old;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.abs()
    }
}

impl From<RatchetJoint> for ConstraintKind {
    fn from(joint: RatchetJoint) -> Self {
        ConstraintKind::Ratchet(joint)
    }
}

/// Keeps the angular velocity ratio of two bodies constant.
pub struct GearJoint {
    /// Angular offset between the bodies.
    pub phase: f64,
    /// Ratio between the angular velocities.
    ratio: f64,
    /// Cached inverse of the ratio.
    ratio_inv: f64,

    /// Effective angular mass.
    i_sum: f64,
    /// Correction velocity for the phase error.
    bias: f64,
    /// Accumulated impulse.
    j_acc: f64,
}

impl GearJoint {
    /// Gear the rotation of two bodies together.
    pub fn new(phase: f64, ratio: f64) -> Self {
        debug_assert!(ratio != 0.0, "Gear ratio is invalid");

        Self {
            phase,
            ratio,
            ratio_inv: ratio.recip(),
            i_sum: 0.0,
            bias: 0.0,
            j_acc: 0.0,
        }
    }

    /// Ratio between the angular velocities.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Set the gear ratio.
    pub fn set_ratio(&mut self, ratio: f64) {
        debug_assert!(ratio != 0.0, "Gear ratio is invalid");

        self.ratio = ratio;
        self.ratio_inv = ratio.recip();
    }

    pub(crate) fn prestep(&mut self, limits: &Limits, a: &Body, b: &Body, dt: f64) {
        self.i_sum = (a.i_inv * self.ratio_inv + self.ratio * b.i_inv).recip();

        let error = b.a * self.ratio - a.a - self.phase;
        self.bias =
            (-bias_coef(limits.error_bias, dt) * error / dt).clamp(-limits.max_bias, limits.max_bias);
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        let j = self.j_acc * dt_coef;

        a.w -= j * a.i_inv * self.ratio_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        let wr = b.w * self.ratio - a.w;
        let j_max = limits.max_force * dt;

        let j = (self.bias - wr) * self.i_sum;
        let j_old = self.j_acc;
        self.j_acc = (j_old + j).clamp(-j_max, j_max);
        let j = self.j_acc - j_old;

        a.w -= j * a.i_inv * self.ratio_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.abs()
    }
}

impl From<GearJoint> for ConstraintKind {
    fn from(joint: GearJoint) -> Self {
        ConstraintKind::Gear(joint)
    }
}

/// Drives the relative angular velocity towards a constant rate.
pub struct SimpleMotor {
    /// Desired relative angular velocity.
    pub rate: f64,

    /// Effective angular mass.
    i_sum: f64,
    /// Accumulated impulse.
    j_acc: f64,
}

impl SimpleMotor {
    /// Spin two bodies relative to each other.
    ///
    /// Usually combined with a limited maximum force on the constraint.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            i_sum: 0.0,
            j_acc: 0.0,
        }
    }

    pub(crate) fn prestep(&mut self, a: &Body, b: &Body) {
        self.i_sum = (a.i_inv + b.i_inv).recip();
    }

    pub(crate) fn apply_cached_impulse(&mut self, a: &mut Body, b: &mut Body, dt_coef: f64) {
        let j = self.j_acc * dt_coef;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn apply_impulse(&mut self, limits: &Limits, a: &mut Body, b: &mut Body, dt: f64) {
        let wr = b.w - a.w + self.rate;
        let j_max = limits.max_force * dt;

        let j = -wr * self.i_sum;
        let j_old = self.j_acc;
        self.j_acc = (j_old + j).clamp(-j_max, j_max);
        let j = self.j_acc - j_old;

        a.w -= j * a.i_inv;
        b.w += j * b.i_inv;
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc.abs()
    }
}

impl From<SimpleMotor> for ConstraintKind {
    fn from(motor: SimpleMotor) -> Self {
        ConstraintKind::SimpleMotor(motor)
    }
}
