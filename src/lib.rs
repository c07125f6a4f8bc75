//! 2D rigid-body physics engine with persistent contacts and an iterative
//! impulse solver.
//!
//! A [`Space`] owns bodies, shapes and constraints and advances them in
//! fixed time steps: positions integrate, the broadphase proposes shape
//! pairs, the narrow phase turns them into per-pair contacts that persist
//! across frames, and a sequential impulse solver with warm starting
//! resolves the contact and constraint impulses.
//!
//! Based on: https://box2d.org/files/ErinCatto_SequentialImpulses_GDC2006.pdf

pub mod arbiter;
pub mod body;
mod broadphase;
mod buffer;
pub mod collision;
pub mod constraint;
pub mod handler;
pub mod math;
pub mod shape;
pub mod space;

/// Step counter of a space.
pub type Timestamp = u32;

pub use arbiter::{Arbiter, ArbiterId, ArbiterState, Contact};
pub use body::{Body, BodyId, BodyType, Impact, Transform};
pub use collision::{ContactPoint, ContactPointSet};
pub use constraint::{
    Constraint, ConstraintId, ConstraintKind, DampedRotarySpring, DampedSpring, GearJoint,
    GrooveJoint, PinJoint, PivotJoint, RatchetJoint, RotaryLimitJoint, SimpleMotor, SlideJoint,
};
pub use handler::{CollisionHandler, CollisionType, WILDCARD_COLLISION_TYPE};
pub use math::{Iso, Rotation};
pub use shape::{
    MassInfo, PointQueryInfo, SegmentQueryInfo, Shape, ShapeFilter, ShapeGeometry, ShapeId,
};
pub use space::{QueryScope, Space, SpaceSettings};
