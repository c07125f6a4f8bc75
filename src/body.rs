use slotmap::{new_key_type, Key as _};
use vek::{Aabr, Vec2};

use crate::{
    arbiter::ArbiterId,
    constraint::ConstraintId,
    math::{perp, perp_dot, wrap_angle, Iso},
    shape::ShapeId,
    Timestamp,
};

new_key_type! {
    /// Handle of a body inside a space.
    pub struct BodyId;
}

/// How a body participates in the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// Simulated mass, moved by forces and impulses.
    Dynamic,
    /// Infinite mass, moved only by setting its velocity.
    Kinematic,
    /// Infinite mass that never moves.
    Static,
}

/// Cached body transform, a rigid isometry with a separate scale.
///
/// The isometry already accounts for the center of gravity so applying it to a
/// scaled body-local point yields the world position of that point.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    /// Rigid part.
    pub iso: Iso,
    /// Scale applied to local points before the rigid part.
    pub scale: Vec2<f64>,
}

impl Transform {
    /// Construct from an origin position, angle and scale, ignoring any center of gravity.
    pub fn new(position: Vec2<f64>, angle: f64, scale: Vec2<f64>) -> Self {
        let iso = Iso::new(position, angle);

        Self { iso, scale }
    }

    /// Map a body-local point to world coordinates.
    pub fn point(&self, local: Vec2<f64>) -> Vec2<f64> {
        self.iso.translate(local * self.scale)
    }

    /// Map a body-local point to world coordinates, ignoring the scale.
    pub fn point_unscaled(&self, local: Vec2<f64>) -> Vec2<f64> {
        self.iso.translate(local)
    }

    /// Map a world point back to body-local coordinates.
    pub fn point_inv(&self, world: Vec2<f64>) -> Vec2<f64> {
        self.iso.translate_inv(world) / self.scale
    }

    /// Map a world point back to body-local coordinates, ignoring the scale.
    pub fn point_inv_unscaled(&self, world: Vec2<f64>) -> Vec2<f64> {
        self.iso.translate_inv(world)
    }

    /// Rotate and scale a body-local direction into world coordinates.
    pub fn vect(&self, local: Vec2<f64>) -> Vec2<f64> {
        self.iso.rotate(local * self.scale)
    }

    /// Rotate a body-local direction into world coordinates, ignoring the scale.
    pub fn vect_unscaled(&self, local: Vec2<f64>) -> Vec2<f64> {
        self.iso.rotate(local)
    }
}

/// Sleeping bookkeeping of a body.
///
/// A body is asleep when it has a component root.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sleeping {
    /// Root body of the sleeping component, null while awake.
    pub(crate) root: BodyId,
    /// Next body in the same component.
    pub(crate) next: BodyId,
    /// Seconds this body has been below the idle speed threshold.
    pub(crate) idle_time: f64,
}

impl Default for Sleeping {
    fn default() -> Self {
        Self {
            root: BodyId::null(),
            next: BodyId::null(),
            idle_time: 0.0,
        }
    }
}

/// Aggregated collision summary of a body for a single step.
///
/// Filled by the solver after the last iteration and handed to the space's
/// impact handler during the next velocity integration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Impact {
    /// Mean contact position.
    pub p: Vec2<f64>,
    /// Combined contact normal, pointing towards this body's partner.
    pub n: Vec2<f64>,
    /// Kinetic energy proxy of the resolved impulses.
    pub ke: f64,
    /// Summed bounce velocity.
    pub bounce: f64,
    /// Summed absolute bounce velocity without restitution applied.
    pub bounce_rigid: f64,
    /// Number of contact points that contributed.
    pub count: u32,
    /// Step the impact was recorded at.
    pub stamp: Timestamp,
    /// Material of this body's shape.
    pub material_a: u8,
    /// Material of the partner shape.
    pub material_b: u8,
    /// Body type of this body.
    pub body_type_a: Option<BodyType>,
    /// Body type of the partner body.
    pub body_type_b: Option<BodyType>,
    /// Whether the record holds unreported data.
    pub dirty: bool,
}

/// A rigid body with a pose, velocities and mass properties.
///
/// Mutating a body through [`crate::Space::body_mut`] automatically wakes it.
pub struct Body {
    /// How the body participates in the simulation.
    pub(crate) body_type: BodyType,
    /// World position of the center of gravity.
    pub(crate) p: Vec2<f64>,
    /// Orientation in radians, wrapped to a full turn.
    pub(crate) a: f64,
    /// Scale applied to attached shapes.
    pub(crate) s: Vec2<f64>,
    /// Linear velocity.
    pub(crate) v: Vec2<f64>,
    /// Angular velocity.
    pub(crate) w: f64,
    /// Accumulated force, cleared every velocity integration.
    pub(crate) f: Vec2<f64>,
    /// Accumulated torque, cleared every velocity integration.
    pub(crate) t: f64,
    /// Positional correction velocity, cleared every position integration.
    pub(crate) v_bias: Vec2<f64>,
    /// Positional correction angular velocity.
    pub(crate) w_bias: f64,
    /// Mass, infinite for non-dynamic bodies.
    pub(crate) m: f64,
    /// Inverse mass.
    pub(crate) m_inv: f64,
    /// Moment of inertia.
    pub(crate) i: f64,
    /// Inverse moment of inertia.
    pub(crate) i_inv: f64,
    /// Center of gravity in body-local coordinates.
    pub(crate) cog: Vec2<f64>,
    /// Multiplier for the space gravity.
    pub(crate) gravity_scale: f64,
    /// Buoyancy coefficient, reserved for fluid coupling.
    pub(crate) buoyancy: f64,
    /// Cached transform, rebuilt whenever the pose changes.
    pub(crate) transform: Transform,
    /// Merged bounds of the attached shapes, relative to the position.
    pub(crate) bb: Aabr<f64>,
    /// Sleeping bookkeeping.
    pub(crate) sleeping: Sleeping,
    /// Attached shapes.
    pub(crate) shapes: Vec<ShapeId>,
    /// Arbiters this body is currently an endpoint of.
    pub(crate) arbiters: Vec<ArbiterId>,
    /// Constraints this body is an endpoint of.
    pub(crate) constraints: Vec<ConstraintId>,
    /// Aggregated collision scratch.
    pub(crate) impact: Impact,
    /// Opaque user value.
    pub user_data: u64,
    /// Entity group, shapes of bodies sharing a non-zero group don't collide.
    pub parent: u64,
}

impl Body {
    /// Construct a dynamic body at the origin with zero velocities.
    pub fn new(mass: f64, moment: f64) -> Self {
        let mut body = Self {
            body_type: BodyType::Dynamic,
            p: Vec2::zero(),
            a: 0.0,
            s: Vec2::one(),
            v: Vec2::zero(),
            w: 0.0,
            f: Vec2::zero(),
            t: 0.0,
            v_bias: Vec2::zero(),
            w_bias: 0.0,
            m: 0.0,
            m_inv: 0.0,
            i: 0.0,
            i_inv: 0.0,
            cog: Vec2::zero(),
            gravity_scale: 1.0,
            buoyancy: 0.5,
            transform: Transform::new(Vec2::zero(), 0.0, Vec2::one()),
            bb: Aabr {
                min: Vec2::zero(),
                max: Vec2::zero(),
            },
            sleeping: Sleeping::default(),
            shapes: Vec::new(),
            arbiters: Vec::new(),
            constraints: Vec::new(),
            impact: Impact::default(),
            user_data: 0,
            parent: 0,
        };

        // The setters also establish the inverses.
        body.set_mass(mass);
        body.set_moment(moment);
        body.rebuild_transform();

        body
    }

    /// Construct a kinematic body.
    pub fn new_kinematic() -> Self {
        let mut body = Self::new(0.0, 0.0);
        body.set_type_fields(BodyType::Kinematic);

        body
    }

    /// Construct a static body.
    pub fn new_static() -> Self {
        let mut body = Self::new(0.0, 0.0);
        body.set_type_fields(BodyType::Static);

        body
    }

    /// Establish the mass and sleeping invariants of a body type.
    ///
    /// Moving the body between the space's partitions is handled by
    /// [`crate::Space::set_body_type`].
    pub(crate) fn set_type_fields(&mut self, body_type: BodyType) {
        self.body_type = body_type;

        // Static bodies idle forever, other types start fresh.
        self.sleeping.idle_time = if body_type == BodyType::Static {
            f64::INFINITY
        } else {
            0.0
        };

        if body_type == BodyType::Dynamic {
            self.m = 0.0;
            self.i = 0.0;
            self.m_inv = f64::INFINITY;
            self.i_inv = f64::INFINITY;
        } else {
            self.m = f64::INFINITY;
            self.i = f64::INFINITY;
            self.m_inv = 0.0;
            self.i_inv = 0.0;

            self.v = Vec2::zero();
            self.w = 0.0;
        }
    }

    /// How the body participates in the simulation.
    pub fn body_type(&self) -> BodyType {
        self.body_type
    }

    /// Whether the body is part of a sleeping component.
    pub fn is_sleeping(&self) -> bool {
        !self.sleeping.root.is_null()
    }

    /// Seconds this body has been below the idle speed threshold.
    pub fn idle_time(&self) -> f64 {
        self.sleeping.idle_time
    }

    /// Mass of the body.
    pub fn mass(&self) -> f64 {
        self.m
    }

    /// Set the mass.
    pub fn set_mass(&mut self, mass: f64) {
        assert!(
            self.body_type == BodyType::Dynamic,
            "Only dynamic bodies can have their mass set"
        );
        debug_assert!(mass >= 0.0 && mass.is_finite(), "Mass is invalid");

        self.m = mass;
        self.m_inv = if mass == 0.0 { f64::INFINITY } else { mass.recip() };
    }

    /// Moment of inertia of the body.
    pub fn moment(&self) -> f64 {
        self.i
    }

    /// Set the moment of inertia.
    pub fn set_moment(&mut self, moment: f64) {
        debug_assert!(moment >= 0.0, "Moment of inertia is invalid");

        self.i = moment;
        self.i_inv = if moment == 0.0 {
            f64::INFINITY
        } else {
            moment.recip()
        };
    }

    /// World position of the body origin.
    pub fn position(&self) -> Vec2<f64> {
        self.transform.iso.pos
    }

    /// Set the world position of the body origin.
    pub fn set_position(&mut self, position: Vec2<f64>) {
        debug_assert!(position.x.is_finite() && position.y.is_finite(), "Position is invalid");

        self.p = position + self.transform.vect(self.cog);
        self.rebuild_transform();
    }

    /// Orientation in radians.
    pub fn angle(&self) -> f64 {
        self.a
    }

    /// Set the orientation in radians.
    pub fn set_angle(&mut self, angle: f64) {
        debug_assert!(angle.is_finite(), "Angle is invalid");

        self.a = wrap_angle(angle);
        self.rebuild_transform();
    }

    /// Scale applied to attached shapes.
    pub fn scale(&self) -> Vec2<f64> {
        self.s
    }

    /// Set the scale.
    ///
    /// Round shapes only support uniform scaling and use the horizontal part.
    pub fn set_scale(&mut self, scale: Vec2<f64>) {
        self.s = scale;
        self.rebuild_transform();
    }

    /// Set position, angle and scale in one go.
    pub fn set_transform(&mut self, position: Vec2<f64>, angle: f64, scale: Vec2<f64>) {
        self.p = position + self.transform.vect(self.cog);
        self.a = wrap_angle(angle);
        self.s = scale;
        self.rebuild_transform();
    }

    /// Center of gravity in body-local coordinates.
    pub fn center_of_gravity(&self) -> Vec2<f64> {
        self.cog
    }

    /// Set the center of gravity.
    pub fn set_center_of_gravity(&mut self, cog: Vec2<f64>) {
        self.cog = cog;
        self.rebuild_transform();
    }

    /// Linear velocity.
    pub fn velocity(&self) -> Vec2<f64> {
        self.v
    }

    /// Set the linear velocity.
    pub fn set_velocity(&mut self, velocity: Vec2<f64>) {
        debug_assert!(velocity.x.is_finite() && velocity.y.is_finite(), "Velocity is invalid");

        self.v = velocity;
    }

    /// Angular velocity in radians per second.
    pub fn angular_velocity(&self) -> f64 {
        self.w
    }

    /// Set the angular velocity.
    pub fn set_angular_velocity(&mut self, angular_velocity: f64) {
        debug_assert!(angular_velocity.is_finite(), "Angular velocity is invalid");

        self.w = angular_velocity;
    }

    /// Accumulated force.
    pub fn force(&self) -> Vec2<f64> {
        self.f
    }

    /// Set the accumulated force.
    pub fn set_force(&mut self, force: Vec2<f64>) {
        debug_assert!(force.x.is_finite() && force.y.is_finite(), "Force is invalid");

        self.f = force;
    }

    /// Accumulated torque.
    pub fn torque(&self) -> f64 {
        self.t
    }

    /// Set the accumulated torque.
    pub fn set_torque(&mut self, torque: f64) {
        debug_assert!(torque.is_finite(), "Torque is invalid");

        self.t = torque;
    }

    /// Multiplier for the space gravity.
    pub fn gravity_scale(&self) -> f64 {
        self.gravity_scale
    }

    /// Set the gravity multiplier.
    pub fn set_gravity_scale(&mut self, gravity_scale: f64) {
        self.gravity_scale = gravity_scale;
    }

    /// Buoyancy coefficient, reserved for fluid coupling.
    pub fn buoyancy(&self) -> f64 {
        self.buoyancy
    }

    /// Set the buoyancy coefficient.
    pub fn set_buoyancy(&mut self, buoyancy: f64) {
        self.buoyancy = buoyancy;
    }

    /// Cached transform.
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Merged bounds of the attached shapes, relative to the position.
    pub fn bounds(&self) -> Aabr<f64> {
        self.bb
    }

    /// Attached shapes.
    pub fn shapes(&self) -> &[ShapeId] {
        &self.shapes
    }

    /// Constraints this body is an endpoint of.
    pub fn constraints(&self) -> &[ConstraintId] {
        &self.constraints
    }

    /// Arbiters this body is currently an endpoint of.
    pub fn arbiters(&self) -> &[ArbiterId] {
        &self.arbiters
    }

    /// Aggregated collision summary of the current step.
    pub fn impact(&self) -> &Impact {
        &self.impact
    }

    /// Map a body-local point to world coordinates.
    pub fn local_to_world(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.transform.point(point)
    }

    /// Map a world point to body-local coordinates.
    pub fn world_to_local(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.transform.point_inv(point)
    }

    /// Map a body-local point to world coordinates, ignoring the scale.
    pub fn local_to_world_unscaled(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.transform.point_unscaled(point)
    }

    /// Map a world point to body-local coordinates, ignoring the scale.
    pub fn world_to_local_unscaled(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.transform.point_inv_unscaled(point)
    }

    /// Add a force at a world point, accumulating torque around the center of gravity.
    pub fn apply_force_at_world_point(&mut self, force: Vec2<f64>, point: Vec2<f64>) {
        self.f += force;

        let r = point - self.transform.point(self.cog);
        self.t += perp_dot(r, force);
    }

    /// Add a force at a body-local point.
    pub fn apply_force_at_local_point(&mut self, force: Vec2<f64>, point: Vec2<f64>) {
        self.apply_force_at_world_point(self.transform.vect(force), self.transform.point(point));
    }

    /// Apply an impulse at a world point, changing the velocities immediately.
    pub fn apply_impulse_at_world_point(&mut self, impulse: Vec2<f64>, point: Vec2<f64>) {
        let r = point - self.transform.point(self.cog);
        self.apply_impulse(impulse, r);
    }

    /// Apply an impulse at a body-local point.
    pub fn apply_impulse_at_local_point(&mut self, impulse: Vec2<f64>, point: Vec2<f64>) {
        self.apply_impulse_at_world_point(self.transform.vect(impulse), self.transform.point(point));
    }

    /// Apply an impulse at an offset from the center of gravity.
    #[inline]
    pub(crate) fn apply_impulse(&mut self, impulse: Vec2<f64>, r: Vec2<f64>) {
        self.v += impulse * self.m_inv;
        self.w += self.i_inv * perp_dot(r, impulse);
    }

    /// Apply a positional correction impulse at an offset from the center of gravity.
    #[inline]
    pub(crate) fn apply_bias_impulse(&mut self, impulse: Vec2<f64>, r: Vec2<f64>) {
        self.v_bias += impulse * self.m_inv;
        self.w_bias += self.i_inv * perp_dot(r, impulse);
    }

    /// Velocity of a world point on the body.
    pub fn velocity_at_world_point(&self, point: Vec2<f64>) -> Vec2<f64> {
        let r = point - self.transform.point(self.cog);

        self.v + perp(r) * self.w
    }

    /// Velocity of a body-local point.
    pub fn velocity_at_local_point(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.velocity_at_world_point(self.transform.point(point))
    }

    /// Kinetic energy of the body, with guards against infinite masses.
    pub fn kinetic_energy(&self) -> f64 {
        let vsq = self.v.dot(self.v);
        let wsq = self.w * self.w;

        (if vsq > 0.0 { vsq * self.m } else { 0.0 })
            + (if wsq > 0.0 { wsq * self.i } else { 0.0 })
    }

    /// Integrate forces and gravity into the velocities.
    ///
    /// The damping values are already raised to the timestep.
    pub(crate) fn integrate_velocity(
        &mut self,
        gravity: Vec2<f64>,
        damping_v: f64,
        damping_w: f64,
        dt: f64,
    ) {
        // Kinematic bodies keep the velocity they were given.
        if self.body_type == BodyType::Kinematic {
            return;
        }

        debug_assert!(
            self.m > 0.0 && self.i > 0.0,
            "Body mass and moment must be positive to simulate"
        );

        self.v = self.v * damping_v + (gravity * self.gravity_scale + self.f * self.m_inv) * dt;
        self.w = self.w * damping_w + self.t * self.i_inv * dt;

        self.f = Vec2::zero();
        self.t = 0.0;
    }

    /// Integrate the velocities and correction bias into the pose.
    pub(crate) fn integrate_position(&mut self, dt: f64) {
        self.p += (self.v + self.v_bias) * dt;
        self.a = wrap_angle(self.a + (self.w + self.w_bias) * dt);
        self.rebuild_transform();

        self.v_bias = Vec2::zero();
        self.w_bias = 0.0;
    }

    /// Rebuild the cached transform from the pose.
    pub(crate) fn rebuild_transform(&mut self) {
        let rot = crate::math::Rotation::from_radians(self.a);
        let origin = self.p - rot.rotate(self.cog * self.s);

        self.transform = Transform {
            iso: Iso::new(origin, rot),
            scale: self.s,
        };
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::Vec2;

    use super::{Body, BodyType};

    /// A fresh dynamic body must have its invariants established.
    #[test]
    fn test_new_invariants() {
        let body = Body::new(2.0, 8.0);

        assert_eq!(body.body_type(), BodyType::Dynamic);
        assert_relative_eq!(body.mass(), 2.0);
        assert_relative_eq!(body.m_inv, 0.5);
        assert_relative_eq!(body.moment(), 8.0);
        assert_relative_eq!(body.i_inv, 0.125);
        assert!(body.velocity() == Vec2::zero() && body.angular_velocity() == 0.0);

        let fixed = Body::new_static();
        assert!(fixed.m.is_infinite() && fixed.i.is_infinite());
        assert_relative_eq!(fixed.m_inv, 0.0);
        assert_relative_eq!(fixed.i_inv, 0.0);
        assert!(fixed.idle_time().is_infinite());
    }

    /// Mapping a point to world coordinates and back must round-trip.
    #[test]
    fn test_local_world_roundtrip() {
        let mut body = Body::new(1.0, 1.0);
        body.set_center_of_gravity(Vec2::new(0.3, -0.1));
        body.set_transform(Vec2::new(4.0, 2.0), 0.8, Vec2::new(2.0, 0.5));

        let point = Vec2::new(-1.5, 2.5);

        let world = body.local_to_world(point);
        let local = body.world_to_local(world);
        assert_relative_eq!(local.x, point.x, epsilon = 1e-9);
        assert_relative_eq!(local.y, point.y, epsilon = 1e-9);

        let world = body.local_to_world_unscaled(point);
        let local = body.world_to_local_unscaled(world);
        assert_relative_eq!(local.x, point.x, epsilon = 1e-9);
        assert_relative_eq!(local.y, point.y, epsilon = 1e-9);
    }

    /// Equal and opposite impulses at the same point must cancel out.
    #[test]
    fn test_impulse_cancellation() {
        let mut body = Body::new(2.0, 3.0);
        body.set_position(Vec2::new(1.0, 1.0));

        let point = Vec2::new(2.0, 3.0);
        let impulse = Vec2::new(0.7, -0.4);

        body.apply_impulse_at_world_point(impulse, point);
        assert!(body.velocity() != Vec2::zero());

        body.apply_impulse_at_world_point(-impulse, point);
        assert_relative_eq!(body.velocity().x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(body.velocity().y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(body.angular_velocity(), 0.0, epsilon = 1e-12);
    }

    /// Kinematic bodies must not be affected by velocity integration.
    #[test]
    fn test_kinematic_integration() {
        let mut body = Body::new_kinematic();
        body.set_velocity(Vec2::new(1.0, 2.0));
        body.set_angular_velocity(0.5);

        body.integrate_velocity(Vec2::new(0.0, -10.0), 1.0, 1.0, 1.0 / 60.0);
        assert_relative_eq!(body.velocity().x, 1.0);
        assert_relative_eq!(body.velocity().y, 2.0);
        assert_relative_eq!(body.angular_velocity(), 0.5);

        // Position integration still applies the velocity.
        body.integrate_position(1.0);
        assert_relative_eq!(body.position().x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(body.position().y, 2.0, epsilon = 1e-9);
    }

    /// Force application at a point accumulates torque around the center of gravity.
    #[test]
    fn test_force_at_point() {
        let mut body = Body::new(1.0, 1.0);

        body.apply_force_at_world_point(Vec2::new(0.0, 1.0), Vec2::new(1.0, 0.0));
        assert_relative_eq!(body.force().y, 1.0);
        assert_relative_eq!(body.torque(), 1.0);
    }
}
