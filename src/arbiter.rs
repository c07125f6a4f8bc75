use arrayvec::ArrayVec;
use slotmap::new_key_type;
use vek::Vec2;

use crate::{
    body::{Body, BodyId},
    buffer::{ContactSlice, MAX_CONTACTS_PER_PAIR},
    collision::CollisionResult,
    constraint::solver::{
        apply_bias_impulses, apply_impulses, k_scalar, normal_relative_velocity,
        relative_velocity,
    },
    handler::{HandlerRegistry, HandlerSet},
    math::perp,
    shape::{Shape, ShapeId},
    Timestamp,
};

new_key_type! {
    /// Handle of an arbiter inside a space.
    pub struct ArbiterId;
}

/// A single persistent contact point between two shapes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Contact {
    /// Offset from the first body's center of gravity.
    ///
    /// Holds the absolute witness point between detection and the arbiter
    /// update.
    pub(crate) r1: Vec2<f64>,
    /// Offset from the second body's center of gravity.
    pub(crate) r2: Vec2<f64>,
    /// Effective mass along the normal.
    pub(crate) n_mass: f64,
    /// Effective mass along the tangent.
    pub(crate) t_mass: f64,
    /// Restitution target velocity.
    pub(crate) bounce: f64,
    /// Approach velocity without restitution applied.
    pub(crate) bounce_rigid: f64,
    /// Accumulated normal impulse.
    pub(crate) jn_acc: f64,
    /// Accumulated tangent impulse.
    pub(crate) jt_acc: f64,
    /// Accumulated positional correction impulse.
    pub(crate) j_bias: f64,
    /// Positional correction target velocity.
    pub(crate) bias: f64,
    /// Feature hash matching this contact across frames.
    pub(crate) hash: u64,
}

impl Contact {
    /// Accumulated normal impulse.
    pub fn normal_impulse(&self) -> f64 {
        self.jn_acc
    }

    /// Accumulated tangent impulse.
    pub fn tangent_impulse(&self) -> f64 {
        self.jt_acc
    }

    /// Offset from the first body's center of gravity.
    pub fn offset_a(&self) -> Vec2<f64> {
        self.r1
    }

    /// Offset from the second body's center of gravity.
    pub fn offset_b(&self) -> Vec2<f64> {
        self.r2
    }
}

/// Lifecycle state of an arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    /// Active, and this is the first step the pair collides.
    FirstCollision,
    /// Active on a later step.
    Normal,
    /// Rejected by a begin or pre-solve callback until separation.
    Ignore,
    /// No longer colliding, cached until the persistence window closes.
    Cached,
    /// One of the shapes was removed.
    Invalidated,
}

/// Where an arbiter's contacts currently live.
#[derive(Debug, Clone)]
pub(crate) enum ContactStore {
    /// No contacts claimed.
    Empty,
    /// Slice inside the space's contact block ring.
    Buffered(ContactSlice),
    /// Private copy held while the arbiter's component sleeps.
    Owned(ArrayVec<Contact, MAX_CONTACTS_PER_PAIR>),
}

/// Persistent contact state of a single shape pair.
///
/// Arbiters are created when two shapes start touching and are cached for
/// `collision_persistence` steps after they separate, carrying the
/// accumulated impulses that warm start the solver.
pub struct Arbiter {
    /// Combined restitution of both shapes.
    pub(crate) e: f64,
    /// Combined friction of both shapes.
    pub(crate) u: f64,
    /// Relative surface velocity projected on the contact tangent.
    pub(crate) surface_vr: Vec2<f64>,
    /// First shape, the one with the smaller id.
    pub(crate) a: ShapeId,
    /// Second shape.
    pub(crate) b: ShapeId,
    /// Body of the first shape.
    pub(crate) body_a: BodyId,
    /// Body of the second shape.
    pub(crate) body_b: BodyId,
    /// Contact storage.
    pub(crate) contacts: ContactStore,
    /// Collision normal, pointing from the first towards the second shape.
    pub(crate) n: Vec2<f64>,
    /// Handlers resolved for this pair.
    pub(crate) handlers: HandlerSet,
    /// Whether callbacks see the shapes in the opposite order.
    pub(crate) swapped: bool,
    /// Whether the solver produced impulses that still need aggregation.
    pub(crate) dirty: bool,
    /// Step this arbiter last saw contacts.
    pub(crate) stamp: Timestamp,
    /// Lifecycle state.
    pub(crate) state: ArbiterState,
    /// Opaque user value.
    pub user_data: u64,
}

impl Arbiter {
    /// Fresh arbiter for a shape pair that just started colliding.
    pub(crate) fn new(a: ShapeId, b: ShapeId, body_a: BodyId, body_b: BodyId) -> Self {
        Self {
            e: 0.0,
            u: 0.0,
            surface_vr: Vec2::zero(),
            a,
            b,
            body_a,
            body_b,
            contacts: ContactStore::Empty,
            n: Vec2::zero(),
            handlers: HandlerSet::default(),
            swapped: false,
            dirty: false,
            stamp: 0,
            state: ArbiterState::FirstCollision,
            user_data: 0,
        }
    }

    /// Fold fresh collision data into the arbiter.
    ///
    /// Converts the absolute witness points into offsets from the body
    /// centers and carries the accumulated impulses of matching contacts
    /// over from the previous step.
    pub(crate) fn update(
        &mut self,
        info: &mut CollisionResult,
        old_contacts: &[Contact],
        shape_a: &Shape,
        shape_b: &Shape,
        body_a: &Body,
        body_b: &Body,
        registry: &HandlerRegistry,
    ) {
        for contact in info.contacts.iter_mut() {
            contact.r1 -= body_a.p;
            contact.r2 -= body_b.p;

            // Carry the persistent impulses over from matching contacts. A
            // hash collision is possible but neither likely nor serious.
            contact.jn_acc = 0.0;
            contact.jt_acc = 0.0;
            for old in old_contacts {
                if contact.hash == old.hash {
                    contact.jn_acc = old.jn_acc;
                    contact.jt_acc = old.jt_acc;
                }
            }
        }

        self.n = info.n;
        self.e = shape_a.elasticity() * shape_b.elasticity();
        self.u = shape_a.friction() * shape_b.friction();

        let surface_vr = shape_b.surface_velocity() - shape_a.surface_velocity();
        self.surface_vr = surface_vr - info.n * surface_vr.dot(info.n);

        let (handlers, swapped) =
            registry.lookup(shape_a.collision_type(), shape_b.collision_type());
        self.handlers = handlers;
        self.swapped = swapped;

        // A cached pair colliding again counts as a new collision.
        if self.state == ArbiterState::Cached {
            self.state = ArbiterState::FirstCollision;
        }

        self.dirty = true;
    }

    /// Compute the effective masses and target velocities for this step.
    pub(crate) fn prestep(
        &self,
        contacts: &mut [Contact],
        body_a: &Body,
        body_b: &Body,
        dt: f64,
        slop: f64,
        bias_coef: f64,
    ) {
        let n = self.n;
        let body_delta = body_b.p - body_a.p;

        for contact in contacts {
            contact.n_mass = k_scalar(body_a, body_b, contact.r1, contact.r2, n).recip();
            contact.t_mass = k_scalar(body_a, body_b, contact.r1, contact.r2, perp(n)).recip();

            // Penetration depth recomputed from the witness offsets.
            let dist = (contact.r2 - contact.r1 + body_delta).dot(n);
            contact.bias = -bias_coef * (dist + slop).min(0.0) / dt;
            contact.j_bias = 0.0;

            let vrn = normal_relative_velocity(body_a, body_b, contact.r1, contact.r2, n);
            contact.bounce = vrn * self.e;
            contact.bounce_rigid = vrn;
        }
    }

    /// Reapply the impulses accumulated during the previous step.
    pub(crate) fn apply_cached_impulse(
        &self,
        contacts: &[Contact],
        body_a: &mut Body,
        body_b: &mut Body,
        dt_coef: f64,
    ) {
        // There is nothing to warm start with on a fresh collision.
        if self.is_first_contact() {
            return;
        }

        for contact in contacts {
            let j = (self.n * contact.jn_acc + perp(self.n) * contact.jt_acc) * dt_coef;
            apply_impulses(body_a, body_b, contact.r1, contact.r2, j);
        }
    }

    /// Run one solver iteration over all contacts.
    pub(crate) fn apply_impulse(
        &self,
        contacts: &mut [Contact],
        body_a: &mut Body,
        body_b: &mut Body,
    ) {
        let n = self.n;

        for contact in contacts {
            let r1 = contact.r1;
            let r2 = contact.r2;

            // Correct the positional error through the bias velocities so it
            // adds no real kinetic energy.
            let vb1 = body_a.v_bias + perp(r1) * body_a.w_bias;
            let vb2 = body_b.v_bias + perp(r2) * body_b.w_bias;
            let vbn = (vb2 - vb1).dot(n);

            let jbn = (contact.bias - vbn) * contact.n_mass;
            let jbn_old = contact.j_bias;
            contact.j_bias = (jbn_old + jbn).max(0.0);

            apply_bias_impulses(body_a, body_b, r1, r2, n * (contact.j_bias - jbn_old));

            let vr = relative_velocity(body_a, body_b, r1, r2);
            let vrn = vr.dot(n);
            let vrt = (vr + self.surface_vr).dot(perp(n));

            // Clamp the accumulated normal impulse to keep the contact pushing.
            let jn = -(contact.bounce + vrn) * contact.n_mass;
            let jn_old = contact.jn_acc;
            contact.jn_acc = (jn_old + jn).max(0.0);

            // Friction is clamped to the cone of the accumulated normal impulse.
            let jt_max = self.u * contact.jn_acc;
            let jt = -vrt * contact.t_mass;
            let jt_old = contact.jt_acc;
            contact.jt_acc = (jt_old + jt).clamp(-jt_max, jt_max);

            apply_impulses(
                body_a,
                body_b,
                r1,
                r2,
                n * (contact.jn_acc - jn_old) + perp(n) * (contact.jt_acc - jt_old),
            );
        }
    }

    /// Whether this is the first step the pair collides.
    pub fn is_first_contact(&self) -> bool {
        self.state == ArbiterState::FirstCollision
    }

    /// Lifecycle state.
    pub fn state(&self) -> ArbiterState {
        self.state
    }

    /// Permanently reject this collision until the shapes separate.
    pub fn ignore(&mut self) {
        self.state = ArbiterState::Ignore;
    }

    /// The shapes of this pair, in callback order.
    pub fn shapes(&self) -> (ShapeId, ShapeId) {
        if self.swapped {
            (self.b, self.a)
        } else {
            (self.a, self.b)
        }
    }

    /// The bodies of this pair, in callback order.
    pub fn bodies(&self) -> (BodyId, BodyId) {
        if self.swapped {
            (self.body_b, self.body_a)
        } else {
            (self.body_a, self.body_b)
        }
    }

    /// Collision normal in callback order, pointing from the first towards
    /// the second shape.
    pub fn normal(&self) -> Vec2<f64> {
        if self.swapped {
            -self.n
        } else {
            self.n
        }
    }

    /// Combined restitution used by the solver.
    pub fn elasticity(&self) -> f64 {
        self.e
    }

    /// Override the combined restitution, allowed from a pre-solve callback.
    pub fn set_elasticity(&mut self, e: f64) {
        self.e = e;
    }

    /// Combined friction used by the solver.
    pub fn friction(&self) -> f64 {
        self.u
    }

    /// Override the combined friction, allowed from a pre-solve callback.
    pub fn set_friction(&mut self, u: f64) {
        self.u = u;
    }

    /// Override the surface velocity, allowed from a pre-solve callback.
    pub fn set_surface_velocity(&mut self, velocity: Vec2<f64>) {
        self.surface_vr = velocity - self.n * velocity.dot(self.n);
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::Vec2;

    use crate::{
        body::Body,
        collision::CollisionResult,
        handler::HandlerRegistry,
        shape::Shape,
    };

    use super::{Arbiter, ArbiterState, Contact};

    fn test_arbiter() -> Arbiter {
        Arbiter::new(
            Default::default(),
            Default::default(),
            Default::default(),
            Default::default(),
        )
    }

    /// Matching feature hashes carry the accumulated impulses across frames.
    #[test]
    fn test_warm_start_matching() {
        let mut arbiter = test_arbiter();
        let body_a = Body::new(1.0, 1.0);
        let body_b = Body::new(1.0, 1.0);
        let shape_a = Shape::circle(1.0, Vec2::zero());
        let shape_b = Shape::circle(1.0, Vec2::zero());
        let registry = HandlerRegistry::default();

        let old = [Contact {
            hash: 42,
            jn_acc: 1.25,
            jt_acc: -0.5,
            ..Contact::default()
        }];

        let mut info = CollisionResult {
            n: Vec2::unit_x(),
            contacts: [
                Contact {
                    hash: 42,
                    ..Contact::default()
                },
                Contact {
                    hash: 7,
                    ..Contact::default()
                },
            ]
            .into_iter()
            .collect(),
        };

        arbiter.update(
            &mut info, &old, &shape_a, &shape_b, &body_a, &body_b, &registry,
        );

        assert_relative_eq!(info.contacts[0].jn_acc, 1.25);
        assert_relative_eq!(info.contacts[0].jt_acc, -0.5);
        assert_relative_eq!(info.contacts[1].jn_acc, 0.0);
        assert_relative_eq!(info.contacts[1].jt_acc, 0.0);
    }

    /// A cached arbiter that collides again counts as a fresh collision.
    #[test]
    fn test_cached_to_first() {
        let mut arbiter = test_arbiter();
        arbiter.state = ArbiterState::Cached;

        let body = Body::new(1.0, 1.0);
        let shape = Shape::circle(1.0, Vec2::zero());
        let mut info = CollisionResult::default();

        arbiter.update(
            &mut info,
            &[],
            &shape,
            &shape,
            &body,
            &body,
            &HandlerRegistry::default(),
        );

        assert!(arbiter.is_first_contact());
        assert!(arbiter.dirty);
    }

    /// The normal impulse never pulls and friction stays inside the cone.
    #[test]
    fn test_impulse_clamps() {
        let mut arbiter = test_arbiter();
        arbiter.n = Vec2::unit_y();
        arbiter.u = 0.5;
        arbiter.state = ArbiterState::Normal;

        let mut body_a = Body::new_static();
        let mut body_b = Body::new(1.0, 1.0);
        body_b.set_position(Vec2::new(0.0, 1.0));
        // Moving apart fast, the contact must not pull the bodies together.
        body_b.set_velocity(Vec2::new(3.0, 5.0));

        let mut contacts = [Contact {
            r1: Vec2::zero(),
            r2: Vec2::new(0.0, -1.0),
            ..Contact::default()
        }];

        arbiter.prestep(&mut contacts, &body_a, &body_b, 1.0 / 60.0, 0.1, 0.1);
        arbiter.apply_impulse(&mut contacts, &mut body_a, &mut body_b);

        assert_relative_eq!(contacts[0].jn_acc, 0.0);
        assert!(contacts[0].jt_acc.abs() <= arbiter.u * contacts[0].jn_acc + 1e-12);
        // The separating body keeps its velocity.
        assert_relative_eq!(body_b.velocity().y, 5.0, epsilon = 1e-9);
    }

    /// An approaching contact produces a positive normal impulse.
    #[test]
    fn test_impulse_resolves_approach() {
        let mut arbiter = test_arbiter();
        arbiter.n = Vec2::unit_y();
        arbiter.state = ArbiterState::Normal;

        let mut body_a = Body::new_static();
        let mut body_b = Body::new(1.0, 1.0);
        body_b.set_position(Vec2::new(0.0, 1.0));
        body_b.set_velocity(Vec2::new(0.0, -2.0));

        let mut contacts = [Contact {
            r1: Vec2::zero(),
            r2: Vec2::new(0.0, -1.0),
            ..Contact::default()
        }];

        arbiter.prestep(&mut contacts, &body_a, &body_b, 1.0 / 60.0, 0.1, 0.1);
        arbiter.apply_impulse(&mut contacts, &mut body_a, &mut body_b);

        assert!(contacts[0].jn_acc > 0.0);
        // With zero restitution the approach velocity is cancelled.
        assert_relative_eq!(body_b.velocity().y, 0.0, epsilon = 1e-9);
    }
}
