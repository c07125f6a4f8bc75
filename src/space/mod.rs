//! The simulation world and its step pipeline.

mod query;
mod sleep;
mod step;

pub use query::QueryScope;

use std::mem;

use hashbrown::HashMap;
use serde::Deserialize;
use slotmap::SlotMap;
use vek::Vec2;

use crate::{
    arbiter::{Arbiter, ArbiterId, Contact, ContactStore},
    body::{Body, BodyId, BodyType, Impact},
    broadphase::ShapeIndex,
    buffer::ContactBuffer,
    constraint::{Constraint, ConstraintId, ConstraintKind},
    handler::{CollisionHandler, HandlerRegistry},
    shape::{Shape, ShapeId},
    Timestamp,
};

/// Callback receiving the aggregated impacts of a body once per step.
pub type ImpactFn = Box<dyn FnMut(BodyId, &Impact)>;

/// Deferred mutation executed when the space unlocks.
pub type PostStepFn = Box<dyn FnOnce(&mut Space)>;

/// Queued post-step callback, coalesced by key.
struct PostStepCallback {
    /// Uniqueness key, duplicate keys within one step are ignored.
    key: u64,
    /// Taken out while executing so re-entrant runs skip it.
    func: Option<PostStepFn>,
}

/// Tunables of a space, loadable from a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpaceSettings {
    /// Solver iterations per step.
    pub iterations: u32,
    /// Gravity applied to every dynamic body.
    pub gravity: Vec2<f64>,
    /// Per-second decay of linear velocity.
    pub damping: f64,
    /// Per-second decay of angular velocity.
    pub damping_w: f64,
    /// Speed below which a body accumulates idle time, zero derives it from
    /// the gravity.
    pub idle_speed_threshold: f64,
    /// Idle seconds after which a contact component falls asleep, infinite
    /// disables sleeping.
    pub sleep_time_threshold: f64,
    /// Penetration depth the solver leaves uncorrected to keep contacts alive.
    pub collision_slop: f64,
    /// Fraction of penetration left after one second of correction.
    pub collision_bias: f64,
    /// Steps an arbiter outlives its last contact.
    pub collision_persistence: Timestamp,
}

impl Default for SpaceSettings {
    fn default() -> Self {
        Self {
            iterations: 10,
            gravity: Vec2::zero(),
            damping: 1.0,
            damping_w: 1.0,
            idle_speed_threshold: 0.0,
            sleep_time_threshold: f64::INFINITY,
            collision_slop: 0.1,
            collision_bias: (1.0f64 - 0.1).powf(60.0),
            collision_persistence: 3,
        }
    }
}

/// The simulation world owning bodies, shapes, constraints and collision
/// state, advanced in fixed time steps.
pub struct Space {
    /// Tunables.
    pub(crate) settings: SpaceSettings,
    /// Current step number.
    pub(crate) stamp: Timestamp,
    /// Timestep of the step in progress, also the previous step's timestep
    /// for the warm start scaling.
    pub(crate) curr_dt: f64,

    /// All bodies.
    pub(crate) bodies: SlotMap<BodyId, Body>,
    /// All shapes.
    pub(crate) shapes: SlotMap<ShapeId, Shape>,
    /// All constraints.
    pub(crate) constraint_store: SlotMap<ConstraintId, Constraint>,
    /// All arbiters, the slotmap free list doubles as the arbiter pool.
    pub(crate) arbiter_store: SlotMap<ArbiterId, Arbiter>,

    /// Awake dynamic and kinematic bodies.
    pub(crate) dynamic_bodies: Vec<BodyId>,
    /// Static bodies.
    pub(crate) static_bodies: Vec<BodyId>,
    /// Bodies woken during a lock, activated on unlock.
    pub(crate) roused_bodies: Vec<BodyId>,
    /// Roots of the sleeping components.
    pub(crate) sleeping_components: Vec<BodyId>,

    /// Partition of the shapes belonging to awake dynamic bodies.
    pub(crate) dynamic_shapes: ShapeIndex,
    /// Partition of static and sleeping shapes.
    pub(crate) static_shapes: ShapeIndex,

    /// Constraints participating in the solver.
    pub(crate) constraints: Vec<ConstraintId>,
    /// Arbiters with contacts this step.
    pub(crate) arbiters: Vec<ArbiterId>,
    /// Arbiters alive within the persistence window, keyed by the ordered
    /// shape pair.
    pub(crate) cached_arbiters: HashMap<(ShapeId, ShapeId), ArbiterId>,
    /// Ring of contact blocks.
    pub(crate) buffers: ContactBuffer,

    /// Re-entrant lock depth of the step pipeline.
    locked: u32,
    /// Guard against post-step callbacks running post-step callbacks.
    skip_post_step: bool,
    /// Deferred mutations executed at unlock.
    post_step: Vec<PostStepCallback>,

    /// Collision handler registry.
    pub(crate) handlers: HandlerRegistry,
    /// Callback receiving aggregated impacts.
    pub(crate) impact_func: Option<ImpactFn>,

    /// Built-in body to attach static shapes and constraint anchors to.
    static_body: BodyId,

    /// Reused candidate pair allocation.
    pub(crate) pair_scratch: Vec<(ShapeId, ShapeId)>,

    /// Opaque user value.
    pub user_data: u64,
}

impl Space {
    /// Create an empty space with default settings.
    pub fn new() -> Self {
        Self::with_settings(SpaceSettings::default())
    }

    /// Create an empty space.
    pub fn with_settings(settings: SpaceSettings) -> Self {
        let mut bodies = SlotMap::with_key();
        let static_body = bodies.insert(Body::new_static());

        let mut space = Self {
            settings,
            stamp: 0,
            curr_dt: 0.0,
            bodies,
            shapes: SlotMap::with_key(),
            constraint_store: SlotMap::with_key(),
            arbiter_store: SlotMap::with_key(),
            dynamic_bodies: Vec::new(),
            static_bodies: Vec::new(),
            roused_bodies: Vec::new(),
            sleeping_components: Vec::new(),
            dynamic_shapes: ShapeIndex::default(),
            static_shapes: ShapeIndex::default(),
            constraints: Vec::new(),
            arbiters: Vec::new(),
            cached_arbiters: HashMap::new(),
            buffers: ContactBuffer::new(),
            locked: 0,
            skip_post_step: false,
            post_step: Vec::new(),
            handlers: HandlerRegistry::default(),
            impact_func: None,
            static_body,
            pair_scratch: Vec::new(),
            user_data: 0,
        };
        space.static_bodies.push(static_body);

        space
    }

    /// The built-in static body.
    pub fn static_body(&self) -> BodyId {
        self.static_body
    }

    /// Whether a step or query callback is currently running.
    pub fn is_locked(&self) -> bool {
        self.locked > 0
    }

    /// Step number of the simulation.
    pub fn stamp(&self) -> Timestamp {
        self.stamp
    }

    /// Timestep of the most recent step.
    pub fn current_dt(&self) -> f64 {
        self.curr_dt
    }

    /// Current tunables.
    pub fn settings(&self) -> &SpaceSettings {
        &self.settings
    }

    /// Solver iterations per step.
    pub fn set_iterations(&mut self, iterations: u32) {
        debug_assert!(iterations > 0, "Iteration count is invalid");

        self.settings.iterations = iterations;
    }

    /// Gravity applied to every dynamic body, waking everything up.
    pub fn set_gravity(&mut self, gravity: Vec2<f64>) {
        self.settings.gravity = gravity;

        // Sleeping bodies rest on the old gravity vector.
        for root in mem::take(&mut self.sleeping_components) {
            self.activate_body(root);
        }
    }

    /// Per-second decay of linear velocity.
    pub fn set_damping(&mut self, damping: f64) {
        self.settings.damping = damping;
    }

    /// Per-second decay of angular velocity.
    pub fn set_damping_w(&mut self, damping_w: f64) {
        self.settings.damping_w = damping_w;
    }

    /// Speed below which a body accumulates idle time.
    pub fn set_idle_speed_threshold(&mut self, threshold: f64) {
        self.settings.idle_speed_threshold = threshold;
    }

    /// Idle seconds after which a contact component falls asleep.
    pub fn set_sleep_time_threshold(&mut self, threshold: f64) {
        self.settings.sleep_time_threshold = threshold;
    }

    /// Penetration depth the solver leaves uncorrected.
    pub fn set_collision_slop(&mut self, slop: f64) {
        self.settings.collision_slop = slop;
    }

    /// Fraction of penetration left after one second of correction.
    pub fn set_collision_bias(&mut self, bias: f64) {
        self.settings.collision_bias = bias;
    }

    /// Steps an arbiter outlives its last contact.
    pub fn set_collision_persistence(&mut self, persistence: Timestamp) {
        self.settings.collision_persistence = persistence;
    }

    /// Set the callback receiving aggregated impacts.
    pub fn set_impact_handler(&mut self, func: ImpactFn) {
        self.impact_func = Some(func);
    }

    /// Register a collision handler for a pair of collision types.
    pub fn add_collision_handler(&mut self, handler: CollisionHandler) {
        assert!(!self.is_locked(), "Handlers can't be changed during a step");

        self.handlers.add(handler);
    }

    /// Register the handler backing all unregistered pairs.
    pub fn add_default_collision_handler(&mut self, handler: CollisionHandler) {
        assert!(!self.is_locked(), "Handlers can't be changed during a step");

        self.handlers.add_default(handler);
    }

    // Accessors

    /// A body in the space.
    pub fn body(&self, id: BodyId) -> &Body {
        &self.bodies[id]
    }

    /// Mutable access to a body, waking it up.
    pub fn body_mut(&mut self, id: BodyId) -> &mut Body {
        self.activate_body(id);

        &mut self.bodies[id]
    }

    /// A body that might have been removed.
    pub fn get_body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(id)
    }

    /// A shape in the space.
    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id]
    }

    /// Mutable access to a shape, waking its body.
    ///
    /// Collision-relevant changes on a static shape require a
    /// [`Space::reindex_shape`] afterwards.
    pub fn shape_mut(&mut self, id: ShapeId) -> &mut Shape {
        self.activate_body(self.shapes[id].body);

        &mut self.shapes[id]
    }

    /// A shape that might have been removed.
    pub fn get_shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(id)
    }

    /// A constraint in the space.
    pub fn constraint(&self, id: ConstraintId) -> &Constraint {
        &self.constraint_store[id]
    }

    /// Mutable access to a constraint, waking both bodies.
    pub fn constraint_mut(&mut self, id: ConstraintId) -> &mut Constraint {
        let (a, b) = self.constraint_store[id].bodies();
        self.activate_body(a);
        self.activate_body(b);

        &mut self.constraint_store[id]
    }

    /// An arbiter in the space.
    pub fn arbiter(&self, id: ArbiterId) -> &Arbiter {
        &self.arbiter_store[id]
    }

    /// Mutable access to an arbiter, for begin and pre-solve callbacks.
    pub fn arbiter_mut(&mut self, id: ArbiterId) -> &mut Arbiter {
        &mut self.arbiter_store[id]
    }

    /// The contacts of an arbiter.
    pub fn arbiter_contacts(&self, id: ArbiterId) -> &[Contact] {
        match &self.arbiter_store[id].contacts {
            ContactStore::Empty => &[],
            ContactStore::Buffered(slice) => self.buffers.contacts(*slice),
            ContactStore::Owned(contacts) => contacts,
        }
    }

    /// Visit every arbiter a body is an endpoint of.
    ///
    /// Each arbiter is temporarily oriented so the visited body is the first
    /// of the pair.
    pub fn each_body_arbiter(&mut self, body: BodyId, mut f: impl FnMut(&mut Space, ArbiterId)) {
        for arb_id in self.bodies[body].arbiters.clone() {
            let swapped = {
                let arbiter = &mut self.arbiter_store[arb_id];
                let swapped = arbiter.swapped;
                arbiter.swapped = arbiter.body_b == body;
                swapped
            };

            f(self, arb_id);

            if let Some(arbiter) = self.arbiter_store.get_mut(arb_id) {
                arbiter.swapped = swapped;
            }
        }
    }

    /// World positions of an arbiter's contact points.
    pub fn arbiter_contact_points(&self, id: ArbiterId) -> Vec<Vec2<f64>> {
        let arbiter = &self.arbiter_store[id];
        let p_a = self.bodies[arbiter.body_a].p;
        let p_b = self.bodies[arbiter.body_b].p;

        self.arbiter_contacts(id)
            .iter()
            .map(|contact| ((p_a + contact.offset_a()) + (p_b + contact.offset_b())) * 0.5)
            .collect()
    }

    /// Total impulse an arbiter applied during the last step, in callback
    /// orientation.
    pub fn arbiter_total_impulse(&self, id: ArbiterId) -> Vec2<f64> {
        let arbiter = &self.arbiter_store[id];

        let sum = self
            .arbiter_contacts(id)
            .iter()
            .fold(Vec2::zero(), |sum, contact| {
                sum + arbiter.n * contact.jn_acc + crate::math::perp(arbiter.n) * contact.jt_acc
            });

        if arbiter.swapped {
            -sum
        } else {
            sum
        }
    }

    /// Ids of the awake dynamic and kinematic bodies.
    pub fn dynamic_bodies(&self) -> &[BodyId] {
        &self.dynamic_bodies
    }

    /// Ids of the static bodies.
    pub fn static_bodies(&self) -> &[BodyId] {
        &self.static_bodies
    }

    /// Ids of the arbiters that had contacts during the last step.
    pub fn active_arbiters(&self) -> &[ArbiterId] {
        &self.arbiters
    }

    /// Iterate over all bodies.
    pub fn iter_bodies(&self) -> impl Iterator<Item = (BodyId, &Body)> {
        self.bodies.iter()
    }

    /// Iterate over all shapes.
    pub fn iter_shapes(&self) -> impl Iterator<Item = (ShapeId, &Shape)> {
        self.shapes.iter()
    }

    /// Iterate over all constraints.
    pub fn iter_constraints(&self) -> impl Iterator<Item = (ConstraintId, &Constraint)> {
        self.constraint_store.iter()
    }

    // Membership

    /// Add a body to the space.
    pub fn add_body(&mut self, body: Body) -> BodyId {
        assert!(!self.is_locked(), "Bodies can't be added during a step");

        let body_type = body.body_type();
        let id = self.bodies.insert(body);

        if body_type == BodyType::Static {
            self.static_bodies.push(id);
        } else {
            self.dynamic_bodies.push(id);
        }

        id
    }

    /// Remove a body, its shapes and constraints must be removed first.
    pub fn remove_body(&mut self, id: BodyId) -> Body {
        assert!(!self.is_locked(), "Bodies can't be removed during a step");
        assert!(id != self.static_body, "The built-in static body can't be removed");
        assert!(
            self.bodies[id].shapes.is_empty() && self.bodies[id].constraints.is_empty(),
            "Remove the body's shapes and constraints first"
        );

        self.activate_body(id);

        let list = if self.bodies[id].body_type() == BodyType::Static {
            &mut self.static_bodies
        } else {
            &mut self.dynamic_bodies
        };
        if let Some(index) = list.iter().position(|body| *body == id) {
            list.swap_remove(index);
        }

        self.bodies.remove(id).expect("Body was already removed")
    }

    /// Attach a shape to a body and register it for collision.
    pub fn add_shape(&mut self, body_id: BodyId, mut shape: Shape) -> ShapeId {
        assert!(!self.is_locked(), "Shapes can't be added during a step");

        let is_static = self.bodies[body_id].body_type() == BodyType::Static;
        if !is_static {
            self.activate_body(body_id);
        }

        shape.body = body_id;
        shape.cache_data(self.bodies[body_id].transform());
        let has_mass = shape.mass > 0.0;

        let id = self.shapes.insert(shape);
        self.bodies[body_id].shapes.push(id);

        if is_static {
            self.static_shapes.insert(id);
        } else {
            self.dynamic_shapes.insert(id);
        }

        if has_mass {
            self.accumulate_mass_from_shapes(body_id);
        }

        id
    }

    /// Remove a shape, invalidating any collisions it is involved in.
    pub fn remove_shape(&mut self, id: ShapeId) -> Shape {
        assert!(!self.is_locked(), "Shapes can't be removed during a step");

        let body_id = self.shapes[id].body;
        let had_mass = self.shapes[id].mass > 0.0;

        if self.bodies[body_id].body_type() == BodyType::Dynamic {
            self.activate_body(body_id);
        }

        self.invalidate_arbiters_for_shape(id);

        if let Some(index) = self.bodies[body_id]
            .shapes
            .iter()
            .position(|shape| *shape == id)
        {
            self.bodies[body_id].shapes.swap_remove(index);
        }

        self.dynamic_shapes.remove(id);
        self.static_shapes.remove(id);

        if had_mass {
            self.accumulate_mass_from_shapes(body_id);
        }

        self.shapes.remove(id).expect("Shape was already removed")
    }

    /// Set the mass of a shape and recompute its body's mass properties.
    pub fn set_shape_mass(&mut self, id: ShapeId, mass: f64) {
        debug_assert!(mass >= 0.0 && mass.is_finite(), "Mass is invalid");

        let body_id = self.shapes[id].body;
        self.activate_body(body_id);

        self.shapes[id].mass = mass;
        self.accumulate_mass_from_shapes(body_id);
    }

    /// Set the density of a shape and recompute its body's mass properties.
    pub fn set_shape_density(&mut self, id: ShapeId, density: f64) {
        let mass = density * self.shapes[id].mass_info().area;
        self.set_shape_mass(id, mass);
    }

    /// Add a constraint between two bodies.
    pub fn add_constraint(&mut self, mut constraint: Constraint) -> ConstraintId {
        assert!(!self.is_locked(), "Constraints can't be added during a step");

        let (a, b) = constraint.bodies();
        self.activate_body(a);
        self.activate_body(b);

        // Resolve rest values that are measured at attachment time.
        match &mut constraint.kind {
            ConstraintKind::Pin(joint) => {
                if joint.dist.is_none() {
                    let anchor_a = self.bodies[a].local_to_world(joint.anchor_a);
                    let anchor_b = self.bodies[b].local_to_world(joint.anchor_b);
                    joint.dist = Some(anchor_a.distance(anchor_b));
                }
            }
            ConstraintKind::Ratchet(joint) => {
                if joint.angle.is_none() {
                    joint.angle = Some(self.bodies[b].angle() - self.bodies[a].angle());
                }
            }
            _ => (),
        }

        let id = self.constraint_store.insert(constraint);
        self.bodies[a].constraints.push(id);
        self.bodies[b].constraints.push(id);
        self.constraints.push(id);

        id
    }

    /// Pivot two bodies around a world point.
    pub fn add_pivot_joint(&mut self, a: BodyId, b: BodyId, point: Vec2<f64>) -> ConstraintId {
        let anchor_a = self.bodies[a].world_to_local(point);
        let anchor_b = self.bodies[b].world_to_local(point);

        self.add_constraint(Constraint::new(
            a,
            b,
            crate::constraint::PivotJoint::new(anchor_a, anchor_b),
        ))
    }

    /// Remove a constraint.
    pub fn remove_constraint(&mut self, id: ConstraintId) -> Constraint {
        assert!(!self.is_locked(), "Constraints can't be removed during a step");

        let (a, b) = self.constraint_store[id].bodies();
        self.activate_body(a);
        self.activate_body(b);

        for body in [a, b] {
            if let Some(index) = self.bodies[body]
                .constraints
                .iter()
                .position(|constraint| *constraint == id)
            {
                self.bodies[body].constraints.swap_remove(index);
            }
        }
        if let Some(index) = self.constraints.iter().position(|constraint| *constraint == id) {
            self.constraints.swap_remove(index);
        }

        self.constraint_store
            .remove(id)
            .expect("Constraint was already removed")
    }

    /// Change how a body participates in the simulation.
    ///
    /// Moves the body and its shapes between the static and dynamic
    /// partitions and re-establishes the mass invariants.
    pub fn set_body_type(&mut self, id: BodyId, body_type: BodyType) {
        assert!(!self.is_locked(), "Body types can't be changed during a step");

        let old_type = self.bodies[id].body_type();
        if old_type == body_type {
            return;
        }

        // Wake the component while the body still participates in it.
        if self.bodies[id].is_sleeping() {
            self.activate_body(id);
        }

        self.bodies[id].set_type_fields(body_type);

        if body_type == BodyType::Dynamic {
            self.accumulate_mass_from_shapes(id);
        }

        // Move the body between the body arrays.
        let was_static = old_type == BodyType::Static;
        let is_static = body_type == BodyType::Static;
        if was_static != is_static {
            let (from, to) = if was_static {
                (&mut self.static_bodies, &mut self.dynamic_bodies)
            } else {
                (&mut self.dynamic_bodies, &mut self.static_bodies)
            };

            if let Some(index) = from.iter().position(|body| *body == id) {
                from.swap_remove(index);
            }
            to.push(id);

            // Move the shapes to the partition of the new type.
            for shape in self.bodies[id].shapes.clone() {
                if was_static {
                    self.static_shapes.remove(shape);
                    self.dynamic_shapes.insert(shape);
                } else {
                    self.dynamic_shapes.remove(shape);
                    self.static_shapes.insert(shape);
                }
            }
        }
    }

    /// Recompute a body's mass, moment and center of gravity from its shapes.
    pub fn accumulate_mass_from_shapes(&mut self, id: BodyId) {
        let position = self.bodies[id].position();

        let body = &mut self.bodies[id];
        body.m = 0.0;
        body.i = 0.0;
        body.cog = Vec2::zero();

        let mut bb = vek::Aabr {
            min: position,
            max: position,
        };

        if self.bodies[id].shapes.is_empty() {
            let body = &mut self.bodies[id];
            body.m = 1.0;
            body.i = 1.0;
        } else {
            for shape_id in self.bodies[id].shapes.clone() {
                let info = self.shapes[shape_id].mass_info();
                bb.expand_to_contain(self.shapes[shape_id].bb());

                if info.m > 0.0 {
                    let body = &mut self.bodies[id];
                    let msum = body.m + info.m;

                    body.i +=
                        info.m * info.i + body.cog.distance_squared(info.cog) * (info.m * body.m) / msum;
                    body.cog += (info.cog - body.cog) * (info.m / msum);
                    body.m = msum;
                }
            }
        }

        let body = &mut self.bodies[id];
        if body.body_type() != BodyType::Dynamic {
            body.m = f64::INFINITY;
            body.i = f64::INFINITY;
            body.m_inv = 0.0;
            body.i_inv = 0.0;

            body.v = Vec2::zero();
            body.w = 0.0;
        } else {
            body.m_inv = body.m.recip();
            body.i_inv = body.i.recip();
        }

        body.bb = vek::Aabr {
            min: bb.min - position,
            max: bb.max - position,
        };

        // Realign since the center of gravity probably moved.
        body.set_position(position);
    }

    /// Refresh the cached world data of every static shape.
    pub fn reindex_static(&mut self) {
        assert!(!self.is_locked(), "Reindexing is not allowed during a step");

        let Self {
            shapes,
            bodies,
            static_shapes,
            ..
        } = self;
        for id in static_shapes.iter() {
            let shape = &mut shapes[id];
            let body = shape.body;
            shape.cache_data(bodies[body].transform());
        }
    }

    /// Refresh the cached world data of a single shape.
    pub fn reindex_shape(&mut self, id: ShapeId) {
        assert!(!self.is_locked(), "Reindexing is not allowed during a step");

        let Self { shapes, bodies, .. } = self;
        let shape = &mut shapes[id];
        let body = shape.body;
        shape.cache_data(bodies[body].transform());
    }

    /// Refresh the cached world data of all shapes attached to a body.
    pub fn reindex_shapes_for_body(&mut self, id: BodyId) {
        assert!(!self.is_locked(), "Reindexing is not allowed during a step");

        for shape in self.bodies[id].shapes.clone() {
            let Self { shapes, bodies, .. } = self;
            shapes[shape].cache_data(bodies[id].transform());
        }
    }

    // Locking

    pub(crate) fn lock(&mut self) {
        self.locked += 1;
    }

    pub(crate) fn unlock(&mut self, run_post_step: bool) {
        assert!(self.locked > 0, "Space lock underflow");
        self.locked -= 1;

        if self.locked > 0 {
            return;
        }

        // Wake everything that was roused during the lock.
        let waking = mem::take(&mut self.roused_bodies);
        for body in waking {
            self.activate_body_now(body);
        }

        if run_post_step && !self.skip_post_step {
            self.skip_post_step = true;

            // Callbacks may append more callbacks, those run in the same
            // drain.
            let mut index = 0;
            while index < self.post_step.len() {
                if let Some(func) = self.post_step[index].func.take() {
                    func(self);
                }
                index += 1;
            }
            self.post_step.clear();

            self.skip_post_step = false;
        }
    }

    /// Defer a mutation until the space unlocks at the end of the step.
    ///
    /// Returns whether the callback was queued, duplicate keys within one
    /// step are ignored.
    pub fn add_post_step_callback(
        &mut self,
        key: u64,
        func: impl FnOnce(&mut Space) + 'static,
    ) -> bool {
        if !self.is_locked() {
            log::warn!(
                "Adding a post-step callback while the space is not locked is unnecessary, \
                 it will not run until the end of the next step"
            );
        }

        if self.post_step.iter().any(|callback| callback.key == key) {
            return false;
        }

        self.post_step.push(PostStepCallback {
            key,
            func: Some(Box::new(func)),
        });

        true
    }

    // Arbiter upkeep

    /// Normalised cache key of a shape pair.
    pub(crate) fn pair_key(a: ShapeId, b: ShapeId) -> (ShapeId, ShapeId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Thread an arbiter into a body's contact graph list.
    pub(crate) fn thread_arbiter(&mut self, body: BodyId, id: ArbiterId) {
        let list = &mut self.bodies[body].arbiters;
        if !list.contains(&id) {
            list.push(id);
        }
    }

    /// Remove an arbiter from both endpoint body lists.
    pub(crate) fn unthread_arbiter(&mut self, id: ArbiterId) {
        let (a, b) = {
            let arbiter = &self.arbiter_store[id];
            (arbiter.body_a, arbiter.body_b)
        };

        for body in [a, b] {
            if let Some(body) = self.bodies.get_mut(body) {
                if let Some(index) = body.arbiters.iter().position(|arbiter| *arbiter == id) {
                    body.arbiters.swap_remove(index);
                }
            }
        }
    }

    /// Invalidate and free every arbiter involving a shape about to be
    /// removed.
    fn invalidate_arbiters_for_shape(&mut self, id: ShapeId) {
        let affected: Vec<((ShapeId, ShapeId), ArbiterId)> = self
            .cached_arbiters
            .iter()
            .filter(|((a, b), _)| *a == id || *b == id)
            .map(|(key, arbiter)| (*key, *arbiter))
            .collect();

        for (key, arb_id) in affected {
            // Pairs that were still touching get their separate callback.
            if self.arbiter_store[arb_id].state != crate::arbiter::ArbiterState::Cached {
                self.arbiter_store[arb_id].state = crate::arbiter::ArbiterState::Invalidated;
                self.dispatch_separate(arb_id);
            }

            self.unthread_arbiter(arb_id);
            self.cached_arbiters.remove(&key);
            if let Some(index) = self.arbiters.iter().position(|live| *live == arb_id) {
                self.arbiters.swap_remove(index);
            }
            self.arbiter_store.remove(arb_id);
        }
    }

    // Handler dispatch

    /// Fire the begin callbacks of an arbiter's handlers.
    ///
    /// The conjunction of the results decides whether the collision is
    /// accepted for its whole lifetime.
    pub(crate) fn dispatch_begin(&mut self, id: ArbiterId) -> bool {
        let keys = self.arbiter_store[id].handlers;
        let mut registry = mem::take(&mut self.handlers);

        let mut accepted = true;
        for key in keys.keys() {
            if let Some(handler) = registry.get_mut(key) {
                if let Some(begin) = handler.begin.as_mut() {
                    accepted &= begin(self, id);
                }
            }
        }

        self.handlers = registry;
        accepted
    }

    /// Fire the pre-solve callbacks of an arbiter's handlers.
    pub(crate) fn dispatch_pre_solve(&mut self, id: ArbiterId) -> bool {
        let keys = self.arbiter_store[id].handlers;
        let mut registry = mem::take(&mut self.handlers);

        let mut accepted = true;
        for key in keys.keys() {
            if let Some(handler) = registry.get_mut(key) {
                if let Some(pre_solve) = handler.pre_solve.as_mut() {
                    accepted &= pre_solve(self, id);
                }
            }
        }

        self.handlers = registry;
        accepted
    }

    /// Fire the post-solve callbacks of an arbiter's handlers.
    pub(crate) fn dispatch_post_solve(&mut self, id: ArbiterId) {
        let keys = self.arbiter_store[id].handlers;
        let mut registry = mem::take(&mut self.handlers);

        for key in keys.keys() {
            if let Some(handler) = registry.get_mut(key) {
                if let Some(post_solve) = handler.post_solve.as_mut() {
                    post_solve(self, id);
                }
            }
        }

        self.handlers = registry;
    }

    /// Fire the separate callbacks of an arbiter's handlers.
    pub(crate) fn dispatch_separate(&mut self, id: ArbiterId) {
        let keys = self.arbiter_store[id].handlers;
        let mut registry = mem::take(&mut self.handlers);

        for key in keys.keys() {
            if let Some(handler) = registry.get_mut(key) {
                if let Some(separate) = handler.separate.as_mut() {
                    separate(self, id);
                }
            }
        }

        self.handlers = registry;
    }
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use approx::assert_relative_eq;
    use vek::Vec2;

    use crate::{
        body::{Body, BodyType},
        handler::CollisionHandler,
        shape::Shape,
    };

    use super::Space;

    /// Recomputing the mass properties from the shapes is idempotent.
    #[test]
    fn test_accumulate_mass_idempotent() {
        let mut space = Space::new();
        let body = space.add_body(Body::new(0.0, 0.0));

        let mut near = Shape::circle(1.0, Vec2::new(-1.0, 0.0));
        near.set_mass(2.0);
        space.add_shape(body, near);

        let mut far = Shape::circle(0.5, Vec2::new(2.0, 0.0));
        far.set_mass(1.0);
        space.add_shape(body, far);

        let mass = space.body(body).mass();
        let moment = space.body(body).moment();
        let cog = space.body(body).center_of_gravity();
        assert_relative_eq!(mass, 3.0, epsilon = 1e-12);
        // The center of gravity sits between the circles, weighted by mass.
        assert_relative_eq!(cog.x, 0.0, epsilon = 1e-9);

        space.accumulate_mass_from_shapes(body);
        assert_relative_eq!(space.body(body).mass(), mass, epsilon = 1e-12);
        assert_relative_eq!(space.body(body).moment(), moment, epsilon = 1e-12);
        assert_relative_eq!(space.body(body).center_of_gravity().x, cog.x, epsilon = 1e-12);
    }

    /// Changing the body type re-establishes the mass invariants and moves
    /// the body between the partitions.
    #[test]
    fn test_set_body_type() {
        let mut space = Space::new();
        let body = space.add_body(Body::new(1.0, 1.0));
        space.body_mut(body).set_velocity(Vec2::new(1.0, 0.0));
        space.add_shape(body, Shape::circle(1.0, Vec2::zero()));

        space.set_body_type(body, BodyType::Static);
        assert!(space.body(body).mass().is_infinite());
        assert_relative_eq!(space.body(body).velocity().x, 0.0);
        assert!(space.body(body).idle_time().is_infinite());
        assert!(!space.dynamic_bodies().contains(&body));
        assert!(space.static_bodies().contains(&body));

        space.set_body_type(body, BodyType::Dynamic);
        assert!(space.dynamic_bodies().contains(&body));
        assert!(!space.body(body).idle_time().is_infinite());
    }

    /// Removing a shape mid-contact fires the separate callback and frees
    /// the arbiter.
    #[test]
    fn test_remove_shape_invalidates_arbiters() {
        let mut space = Space::new();

        let a = space.add_body(Body::new(1.0, 1.0));
        space.add_shape(a, Shape::circle(1.0, Vec2::zero()));

        let b = space.add_body(Body::new(1.0, 1.0));
        space.body_mut(b).set_position(Vec2::new(1.5, 0.0));
        let removed = space.add_shape(b, Shape::circle(1.0, Vec2::zero()));

        let separations = Rc::new(Cell::new(0));
        let handler = {
            let separations = Rc::clone(&separations);
            let mut handler = CollisionHandler::new(0, 0);
            handler.separate = Some(Box::new(move |_space, _arbiter| {
                separations.set(separations.get() + 1);
            }));
            handler
        };
        space.add_collision_handler(handler);

        space.step(1.0 / 60.0);
        assert_eq!(space.active_arbiters().len(), 1);

        space.remove_shape(removed);
        assert_eq!(separations.get(), 1);
        assert!(space.cached_arbiters.is_empty());
        assert!(space.arbiter_store.is_empty());
        assert!(space.body(a).arbiters().is_empty());
        assert!(space.body(b).arbiters().is_empty());
    }

    /// The space's built-in static body anchors shapes and constraints.
    #[test]
    fn test_static_body() {
        let mut space = Space::new();
        let floor = space.static_body();

        assert_eq!(space.body(floor).body_type(), BodyType::Static);

        let shape = space.add_shape(floor, Shape::segment(Vec2::zero(), Vec2::unit_x(), 0.0));
        assert_eq!(space.shape(shape).body(), floor);
    }
}
