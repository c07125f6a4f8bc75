//! Joint, spring and motor constraints between body pairs.
//!
//! Every variant exposes the same solver interface: a prestep computing the
//! effective masses and bias velocities, a cached-impulse pass warm starting
//! the iteration and an impulse pass run every solver iteration.

pub(crate) mod solver;

mod groove;
mod pin;
mod pivot;
mod rotary;
mod slide;
mod spring;

pub use groove::GrooveJoint;
pub use pin::PinJoint;
pub use pivot::PivotJoint;
pub use rotary::{GearJoint, RatchetJoint, RotaryLimitJoint, SimpleMotor};
pub use slide::SlideJoint;
pub use spring::{DampedRotarySpring, DampedSpring};

use slotmap::new_key_type;

use crate::{
    body::{Body, BodyId},
    space::Space,
};

new_key_type! {
    /// Handle of a constraint inside a space.
    pub struct ConstraintId;
}

/// Callback fired around the solver for a single constraint.
pub type ConstraintCallback = Box<dyn FnMut(&mut Space, ConstraintId)>;

/// Force and correction limits shared by every constraint kind.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Most force the constraint can apply.
    pub(crate) max_force: f64,
    /// Per-second decay of the positional error.
    pub(crate) error_bias: f64,
    /// Most correction velocity the constraint can apply.
    pub(crate) max_bias: f64,
}

/// The per-variant state of a constraint.
pub enum ConstraintKind {
    /// Fixed distance between two anchor points.
    Pin(PinJoint),
    /// Distance range between two anchor points.
    Slide(SlideJoint),
    /// Two anchor points held together.
    Pivot(PivotJoint),
    /// Anchor point sliding along a groove segment.
    Groove(GrooveJoint),
    /// Damped linear spring between two anchor points.
    DampedSpring(DampedSpring),
    /// Damped angular spring between two bodies.
    DampedRotarySpring(DampedRotarySpring),
    /// Limits the relative angle between two bodies.
    RotaryLimit(RotaryLimitJoint),
    /// One-directional rotation with backlash.
    Ratchet(RatchetJoint),
    /// Keeps the angular velocity ratio of two bodies constant.
    Gear(GearJoint),
    /// Drives the relative angular velocity towards a constant rate.
    SimpleMotor(SimpleMotor),
}

/// A constraint between two bodies with uniform solver and limit handling.
pub struct Constraint {
    /// First constrained body.
    pub(crate) a: BodyId,
    /// Second constrained body, may be the space's static body.
    pub(crate) b: BodyId,
    /// Variant state.
    pub(crate) kind: ConstraintKind,
    /// Most force the constraint can apply.
    max_force: f64,
    /// Per-second decay of the positional error.
    error_bias: f64,
    /// Most correction velocity the constraint can apply.
    max_bias: f64,
    /// Whether the constrained bodies still collide with each other.
    pub(crate) collide_bodies: bool,
    /// Fired right before the constraint is prestepped.
    pub(crate) pre_solve: Option<ConstraintCallback>,
    /// Fired after the last solver iteration.
    pub(crate) post_solve: Option<ConstraintCallback>,
    /// Opaque user value.
    pub user_data: u64,
}

impl Constraint {
    /// Constrain two bodies.
    pub fn new(a: BodyId, b: BodyId, kind: impl Into<ConstraintKind>) -> Self {
        assert!(a != b, "A body can't be constrained to itself");

        Self {
            a,
            b,
            kind: kind.into(),
            max_force: f64::INFINITY,
            // Correct about 90% of the error every second by default.
            error_bias: (1.0f64 - 0.1).powf(60.0),
            max_bias: f64::INFINITY,
            collide_bodies: true,
            pre_solve: None,
            post_solve: None,
            user_data: 0,
        }
    }

    /// The constrained body pair.
    pub fn bodies(&self) -> (BodyId, BodyId) {
        (self.a, self.b)
    }

    /// Variant state.
    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    /// Mutable variant state.
    pub fn kind_mut(&mut self) -> &mut ConstraintKind {
        &mut self.kind
    }

    /// Most force the constraint can apply.
    pub fn max_force(&self) -> f64 {
        self.max_force
    }

    /// Limit the force the constraint can apply.
    pub fn set_max_force(&mut self, max_force: f64) {
        debug_assert!(max_force >= 0.0, "Maximum force is invalid");

        self.max_force = max_force;
    }

    /// Per-second decay of the positional error.
    pub fn error_bias(&self) -> f64 {
        self.error_bias
    }

    /// Set the per-second decay of the positional error.
    pub fn set_error_bias(&mut self, error_bias: f64) {
        self.error_bias = error_bias;
    }

    /// Most correction velocity the constraint can apply.
    pub fn max_bias(&self) -> f64 {
        self.max_bias
    }

    /// Limit the correction velocity the constraint can apply.
    pub fn set_max_bias(&mut self, max_bias: f64) {
        self.max_bias = max_bias;
    }

    /// Whether the constrained bodies still collide with each other.
    pub fn collide_bodies(&self) -> bool {
        self.collide_bodies
    }

    /// Choose whether the constrained bodies collide with each other.
    pub fn set_collide_bodies(&mut self, collide_bodies: bool) {
        self.collide_bodies = collide_bodies;
    }

    /// Set the callback fired right before the constraint is prestepped.
    pub fn set_pre_solve(&mut self, callback: ConstraintCallback) {
        self.pre_solve = Some(callback);
    }

    /// Set the callback fired after the last solver iteration.
    pub fn set_post_solve(&mut self, callback: ConstraintCallback) {
        self.post_solve = Some(callback);
    }

    /// Magnitude of the impulse applied during the last step.
    pub fn impulse(&self) -> f64 {
        match &self.kind {
            ConstraintKind::Pin(joint) => joint.impulse(),
            ConstraintKind::Slide(joint) => joint.impulse(),
            ConstraintKind::Pivot(joint) => joint.impulse(),
            ConstraintKind::Groove(joint) => joint.impulse(),
            ConstraintKind::DampedSpring(spring) => spring.impulse(),
            ConstraintKind::DampedRotarySpring(spring) => spring.impulse(),
            ConstraintKind::RotaryLimit(joint) => joint.impulse(),
            ConstraintKind::Ratchet(joint) => joint.impulse(),
            ConstraintKind::Gear(joint) => joint.impulse(),
            ConstraintKind::SimpleMotor(motor) => motor.impulse(),
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            max_force: self.max_force,
            error_bias: self.error_bias,
            max_bias: self.max_bias,
        }
    }

    /// Prepare the constraint for this step's solver iterations.
    pub(crate) fn prestep(&mut self, body_a: &mut Body, body_b: &mut Body, dt: f64) {
        let limits = self.limits();

        match &mut self.kind {
            ConstraintKind::Pin(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::Slide(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::Pivot(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::Groove(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::DampedSpring(spring) => spring.prestep(body_a, body_b, dt),
            ConstraintKind::DampedRotarySpring(spring) => spring.prestep(body_a, body_b, dt),
            ConstraintKind::RotaryLimit(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::Ratchet(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::Gear(joint) => joint.prestep(&limits, body_a, body_b, dt),
            ConstraintKind::SimpleMotor(motor) => motor.prestep(body_a, body_b),
        }
    }

    /// Warm start the solver with the impulses of the previous step.
    pub(crate) fn apply_cached_impulse(&mut self, body_a: &mut Body, body_b: &mut Body, dt_coef: f64) {
        match &mut self.kind {
            ConstraintKind::Pin(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::Slide(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::Pivot(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::Groove(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            // Springs recompute their impulse from scratch every step.
            ConstraintKind::DampedSpring(_) | ConstraintKind::DampedRotarySpring(_) => {}
            ConstraintKind::RotaryLimit(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::Ratchet(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::Gear(joint) => joint.apply_cached_impulse(body_a, body_b, dt_coef),
            ConstraintKind::SimpleMotor(motor) => motor.apply_cached_impulse(body_a, body_b, dt_coef),
        }
    }

    /// Run one solver iteration.
    pub(crate) fn apply_impulse(&mut self, body_a: &mut Body, body_b: &mut Body, dt: f64) {
        let limits = self.limits();

        match &mut self.kind {
            ConstraintKind::Pin(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::Slide(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::Pivot(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::Groove(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::DampedSpring(spring) => spring.apply_impulse(body_a, body_b),
            ConstraintKind::DampedRotarySpring(spring) => spring.apply_impulse(body_a, body_b),
            ConstraintKind::RotaryLimit(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::Ratchet(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::Gear(joint) => joint.apply_impulse(&limits, body_a, body_b, dt),
            ConstraintKind::SimpleMotor(motor) => motor.apply_impulse(&limits, body_a, body_b, dt),
        }
    }
}
