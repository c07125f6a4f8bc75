//! The fixed time step pipeline.

use std::mem;

use itertools::Itertools;
use smallvec::SmallVec;
use vek::Vec2;

use crate::{
    arbiter::{Arbiter, ArbiterId, ArbiterState, Contact, ContactStore},
    body::{BodyId, BodyType, Impact},
    broadphase, collision,
    buffer::MAX_CONTACTS_PER_PAIR,
    shape::ShapeId,
};

use super::Space;

impl Space {
    /// Advance the simulation by a fixed timestep.
    ///
    /// Integrates motion, discovers and persists contacts and solves the
    /// constraint and contact impulses iteratively.
    pub fn step(&mut self, dt: f64) {
        // Don't step if the timestep is zero.
        if dt == 0.0 {
            return;
        }

        puffin::profile_function!();

        self.stamp += 1;
        let prev_dt = self.curr_dt;
        self.curr_dt = dt;

        // Reset and empty the live arbiter list. Pairs whose bodies are both
        // awake are unthreaded from the contact graph, they get rethreaded
        // if they are still colliding.
        let mut live = mem::take(&mut self.arbiters);
        for &arb_id in &live {
            self.arbiter_store[arb_id].state = ArbiterState::Normal;

            let (a, b) = {
                let arbiter = &self.arbiter_store[arb_id];
                (arbiter.body_a, arbiter.body_b)
            };
            if !self.bodies[a].is_sleeping() && !self.bodies[b].is_sleeping() {
                self.unthread_arbiter(arb_id);
            }
        }
        live.clear();
        self.arbiters = live;

        self.lock();
        {
            puffin::profile_scope!("Integrate positions");

            for index in 0..self.dynamic_bodies.len() {
                let id = self.dynamic_bodies[index];
                self.bodies[id].integrate_position(dt);
            }
        }
        {
            puffin::profile_scope!("Collision detection");

            self.buffers
                .push_fresh(self.stamp, self.settings.collision_persistence);

            // Refresh the cached world data of every moving shape.
            {
                let Self {
                    shapes,
                    bodies,
                    dynamic_shapes,
                    ..
                } = self;
                for id in dynamic_shapes.iter() {
                    let body = shapes[id].body();
                    shapes[id].cache_data(bodies[body].transform());
                }
            }

            // Find colliding candidate pairs, sorted so the solver passes
            // run in a deterministic order.
            let mut pairs = mem::take(&mut self.pair_scratch);
            pairs.clear();
            broadphase::candidate_pairs(
                &self.dynamic_shapes,
                &self.static_shapes,
                &self.shapes,
                &mut pairs,
            );

            for (a, b) in pairs
                .iter()
                .map(|&(a, b)| Self::pair_key(a, b))
                .sorted()
            {
                self.collide_shapes(a, b);
            }
            self.pair_scratch = pairs;
        }
        self.unlock(false);

        // Rebuild the contact graph and detect sleeping components.
        self.process_components(dt);

        self.lock();
        {
            // Clear out expired arbiters and fire their separate callbacks.
            self.filter_cached_arbiters();

            let slop = self.settings.collision_slop;
            let bias = 1.0 - self.settings.collision_bias.powf(dt);
            {
                puffin::profile_scope!("Prestep");

                for index in 0..self.arbiters.len() {
                    let arb_id = self.arbiters[index];
                    let Self {
                        arbiter_store,
                        bodies,
                        buffers,
                        ..
                    } = self;

                    let arbiter = &arbiter_store[arb_id];
                    let slice = match arbiter.contacts {
                        ContactStore::Buffered(slice) => slice,
                        _ => continue,
                    };
                    arbiter.prestep(
                        buffers.contacts_mut(slice),
                        &bodies[arbiter.body_a],
                        &bodies[arbiter.body_b],
                        dt,
                        slop,
                        bias,
                    );
                }

                for index in 0..self.constraints.len() {
                    let constraint_id = self.constraints[index];

                    // The user callback runs first, it may still tweak the
                    // constraint.
                    if let Some(mut pre_solve) = self.constraint_store[constraint_id].pre_solve.take()
                    {
                        pre_solve(self, constraint_id);
                        if let Some(constraint) = self.constraint_store.get_mut(constraint_id) {
                            constraint.pre_solve = Some(pre_solve);
                        }
                    }

                    let Self {
                        constraint_store,
                        bodies,
                        ..
                    } = self;
                    let constraint = &mut constraint_store[constraint_id];
                    let [a, b] = bodies
                        .get_disjoint_mut([constraint.a, constraint.b])
                        .expect("Constraint bodies are missing");
                    constraint.prestep(a, b, dt);
                }
            }
            {
                puffin::profile_scope!("Integrate velocities");

                let damping = self.settings.damping.powf(dt);
                let damping_w = self.settings.damping_w.powf(dt);
                let gravity = self.settings.gravity;

                for index in 0..self.dynamic_bodies.len() {
                    let id = self.dynamic_bodies[index];
                    let Self {
                        bodies, impact_func, ..
                    } = self;

                    let body = &mut bodies[id];
                    body.integrate_velocity(gravity, damping, damping_w, dt);

                    // Report and clear the impacts aggregated last step.
                    if body.impact.dirty {
                        if let Some(impact_func) = impact_func {
                            impact_func(id, &body.impact);
                        }
                        body.impact = Impact::default();
                    }
                }
            }
            {
                puffin::profile_scope!("Warm start");

                // Scale the cached impulses in case the timestep changed.
                let dt_coef = if prev_dt == 0.0 { 0.0 } else { dt / prev_dt };

                for index in 0..self.arbiters.len() {
                    let arb_id = self.arbiters[index];
                    let Self {
                        arbiter_store,
                        bodies,
                        buffers,
                        ..
                    } = self;

                    let arbiter = &arbiter_store[arb_id];
                    let slice = match arbiter.contacts {
                        ContactStore::Buffered(slice) => slice,
                        _ => continue,
                    };
                    let [a, b] = bodies
                        .get_disjoint_mut([arbiter.body_a, arbiter.body_b])
                        .expect("Arbiter bodies are missing");
                    arbiter.apply_cached_impulse(buffers.contacts(slice), a, b, dt_coef);
                }

                for index in 0..self.constraints.len() {
                    let constraint_id = self.constraints[index];
                    let Self {
                        constraint_store,
                        bodies,
                        ..
                    } = self;

                    let constraint = &mut constraint_store[constraint_id];
                    let [a, b] = bodies
                        .get_disjoint_mut([constraint.a, constraint.b])
                        .expect("Constraint bodies are missing");
                    constraint.apply_cached_impulse(a, b, dt_coef);
                }
            }
            {
                puffin::profile_scope!("Solve");

                for _ in 0..self.settings.iterations {
                    for index in 0..self.arbiters.len() {
                        let arb_id = self.arbiters[index];
                        let Self {
                            arbiter_store,
                            bodies,
                            buffers,
                            ..
                        } = self;

                        let arbiter = &arbiter_store[arb_id];
                        let slice = match arbiter.contacts {
                            ContactStore::Buffered(slice) => slice,
                            _ => continue,
                        };
                        let [a, b] = bodies
                            .get_disjoint_mut([arbiter.body_a, arbiter.body_b])
                            .expect("Arbiter bodies are missing");
                        arbiter.apply_impulse(buffers.contacts_mut(slice), a, b);
                    }

                    for index in 0..self.constraints.len() {
                        let constraint_id = self.constraints[index];
                        let Self {
                            constraint_store,
                            bodies,
                            ..
                        } = self;

                        let constraint = &mut constraint_store[constraint_id];
                        let [a, b] = bodies
                            .get_disjoint_mut([constraint.a, constraint.b])
                            .expect("Constraint bodies are missing");
                        constraint.apply_impulse(a, b, dt);
                    }
                }
            }
            {
                puffin::profile_scope!("Post solve");

                for index in 0..self.constraints.len() {
                    let constraint_id = self.constraints[index];
                    if let Some(mut post_solve) =
                        self.constraint_store[constraint_id].post_solve.take()
                    {
                        post_solve(self, constraint_id);
                        if let Some(constraint) = self.constraint_store.get_mut(constraint_id) {
                            constraint.post_solve = Some(post_solve);
                        }
                    }
                }

                for index in 0..self.arbiters.len() {
                    let arb_id = self.arbiters[index];
                    self.dispatch_post_solve(arb_id);
                    self.aggregate_impact(arb_id);
                }
            }
        }
        self.unlock(true);
    }

    /// Run the narrow phase on a candidate pair and update its arbiter.
    fn collide_shapes(&mut self, a: ShapeId, b: ShapeId) {
        debug_assert!(a <= b, "Candidate pairs must be normalised");

        // Reject the simple cases.
        if self.query_reject(a, b) {
            return;
        }

        // Narrow phase collision detection.
        let mut info = collision::collide(
            &self.shapes[a],
            &self.shapes[b],
            self.settings.collision_slop,
        );
        if info.contacts.is_empty() {
            // The shapes are not colliding.
            return;
        }
        info.contacts.truncate(MAX_CONTACTS_PER_PAIR);

        let body_a = self.shapes[a].body();
        let body_b = self.shapes[b].body();

        // Get the arbiter of the pair, or a pooled one. This is where the
        // persistent contact magic comes from.
        let key = Self::pair_key(a, b);
        let arb_id = {
            let Self {
                cached_arbiters,
                arbiter_store,
                ..
            } = self;
            *cached_arbiters
                .entry(key)
                .or_insert_with(|| arbiter_store.insert(Arbiter::new(a, b, body_a, body_b)))
        };

        // Fold the fresh contacts in, carrying over matching impulses.
        let old_contacts: SmallVec<[Contact; MAX_CONTACTS_PER_PAIR]> =
            self.arbiter_contacts(arb_id).iter().copied().collect();
        {
            let Self {
                arbiter_store,
                shapes,
                bodies,
                handlers,
                ..
            } = self;
            arbiter_store[arb_id].update(
                &mut info,
                &old_contacts,
                &shapes[a],
                &shapes[b],
                &bodies[body_a],
                &bodies[body_b],
                handlers,
            );
        }

        let slice = self.buffers.claim(
            &info.contacts,
            self.stamp,
            self.settings.collision_persistence,
        );
        self.arbiter_store[arb_id].contacts = ContactStore::Buffered(slice);

        // The begin callbacks may reject the pair for its whole lifetime.
        if self.arbiter_store[arb_id].state == ArbiterState::FirstCollision
            && !self.dispatch_begin(arb_id)
        {
            self.arbiter_store[arb_id].ignore();
        }

        let admit = self.arbiter_store[arb_id].state != ArbiterState::Ignore
            // The pre-solve callbacks decide participation per step, and may
            // also have ignored the pair.
            && self.dispatch_pre_solve(arb_id)
            && self.arbiter_store[arb_id].state != ArbiterState::Ignore
            // Sensors report contacts but never solve them.
            && !(self.shapes[a].is_sensor() || self.shapes[b].is_sensor())
            // Neither do two infinite-mass bodies.
            && !(self.bodies[body_a].mass() == f64::INFINITY
                && self.bodies[body_b].mass() == f64::INFINITY);

        if admit {
            self.arbiters.push(arb_id);
        } else {
            // Hand the claimed contact slots back.
            self.buffers.pop(slice);

            let arbiter = &mut self.arbiter_store[arb_id];
            arbiter.contacts = ContactStore::Empty;

            // Post-solve won't run for rejected arbiters, mark them used.
            if arbiter.state != ArbiterState::Ignore {
                arbiter.state = ArbiterState::Normal;
            }
        }

        // Time stamp the arbiter so we know it was used recently.
        self.arbiter_store[arb_id].stamp = self.stamp;
    }

    /// Cheap rejections before the narrow phase runs.
    fn query_reject(&self, a: ShapeId, b: ShapeId) -> bool {
        let shape_a = &self.shapes[a];
        let shape_b = &self.shapes[b];
        let body_a = &self.bodies[shape_a.body()];
        let body_b = &self.bodies[shape_b.body()];

        // The bounding boxes must overlap.
        !shape_a.bb().collides_with_aabr(shape_b.bb())
            // Don't collide shapes attached to the same body.
            || shape_a.body() == shape_b.body()
            // Don't collide shapes belonging to the same entity.
            || (body_a.parent != 0 && body_a.parent == body_b.parent)
            // Don't collide filtered shape pairs.
            || shape_a.filter().reject(&shape_b.filter())
            // Don't collide bodies joined by a non-colliding constraint.
            || self.query_reject_constraint(shape_a.body(), shape_b.body())
    }

    fn query_reject_constraint(&self, a: BodyId, b: BodyId) -> bool {
        self.bodies[a].constraints.iter().any(|&id| {
            let constraint = &self.constraint_store[id];
            !constraint.collide_bodies
                && ((constraint.a == a && constraint.b == b)
                    || (constraint.a == b && constraint.b == a))
        })
    }

    /// Throw away arbiters that have outlived the persistence window and
    /// fire separate callbacks for pairs that stopped touching.
    fn filter_cached_arbiters(&mut self) {
        puffin::profile_scope!("Filter arbiters");

        let stamp = self.stamp;
        let persistence = self.settings.collision_persistence;

        let entries: Vec<((ShapeId, ShapeId), ArbiterId)> = self
            .cached_arbiters
            .iter()
            .map(|(key, arbiter)| (*key, *arbiter))
            .collect();

        for (key, arb_id) in entries {
            let (body_a, body_b, state, arb_stamp) = {
                let arbiter = &self.arbiter_store[arb_id];
                (arbiter.body_a, arbiter.body_b, arbiter.state, arbiter.stamp)
            };

            // Pairs between sleeping or static bodies are preserved
            // untouched so no spurious separate callbacks fire when
            // components fall asleep.
            let a_idle = self.bodies[body_a].body_type() == BodyType::Static
                || self.bodies[body_a].is_sleeping();
            let b_idle = self.bodies[body_b].body_type() == BodyType::Static
                || self.bodies[body_b].is_sleeping();
            if a_idle && b_idle {
                continue;
            }

            let ticks = stamp - arb_stamp;

            // The arbiter was used last frame but not this one.
            if ticks >= 1 && state != ArbiterState::Cached {
                self.arbiter_store[arb_id].state = ArbiterState::Cached;
                self.dispatch_separate(arb_id);
            }

            if ticks >= persistence {
                self.unthread_arbiter(arb_id);
                self.cached_arbiters.remove(&key);
                if let Some(index) = self.arbiters.iter().position(|live| *live == arb_id) {
                    self.arbiters.swap_remove(index);
                }
                self.arbiter_store.remove(arb_id);
            }
        }
    }

    /// Summarise a solved arbiter into its bodies' impact records.
    fn aggregate_impact(&mut self, arb_id: ArbiterId) {
        if !self.arbiter_store[arb_id].dirty {
            return;
        }
        self.arbiter_store[arb_id].dirty = false;

        let arbiter = &self.arbiter_store[arb_id];
        let slice = match arbiter.contacts {
            ContactStore::Buffered(slice) => slice,
            _ => return,
        };
        let contacts = self.buffers.contacts(slice);
        let count = contacts.len();
        if count == 0 {
            return;
        }

        let e_coef = (1.0 - arbiter.e) / (1.0 + arbiter.e);
        let n = if arbiter.swapped { -arbiter.n } else { arbiter.n };

        let body_a_p = self.bodies[arbiter.body_a].p;
        let body_b_p = self.bodies[arbiter.body_b].p;

        let mut sum = 0.0;
        let mut bounce = 0.0;
        let mut bounce_rigid = 0.0;
        let mut pos = Vec2::zero();
        for contact in contacts {
            sum += e_coef * contact.jn_acc * contact.jn_acc / contact.n_mass
                + contact.jt_acc * contact.jt_acc / contact.t_mass;
            bounce += contact.bounce;
            bounce_rigid += contact.bounce_rigid.abs();

            let p1 = body_a_p + contact.r1;
            let p2 = body_b_p + contact.r2;
            pos += (p1 + p2) * 0.5;
        }
        pos /= count as f64;

        let (body_a, body_b) = (arbiter.body_a, arbiter.body_b);
        let material_a = self.shapes[arbiter.a].material();
        let material_b = self.shapes[arbiter.b].material();
        let type_a = self.bodies[body_a].body_type();
        let type_b = self.bodies[body_b].body_type();
        let stamp = self.stamp;

        for (body_id, normal, own_material, other_material, own_type, other_type) in [
            (body_a, n, material_a, material_b, type_a, type_b),
            (body_b, -n, material_b, material_a, type_b, type_a),
        ] {
            if self.bodies[body_id].body_type() != BodyType::Dynamic {
                continue;
            }

            let impact = &mut self.bodies[body_id].impact;
            impact.p += pos;
            impact.n += normal;
            impact.bounce_rigid += bounce_rigid;
            impact.count += count as u32;

            if impact.dirty {
                // Average with what this step already recorded.
                impact.p *= 0.5;
                impact.n *= 0.5;
                impact.bounce_rigid *= 0.5;
            } else {
                impact.material_a = own_material;
                impact.material_b = other_material;
                impact.body_type_a = Some(own_type);
                impact.body_type_b = Some(other_type);
            }

            impact.bounce += bounce;
            impact.ke += sum;
            impact.dirty = true;
            impact.stamp = stamp;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use approx::assert_relative_eq;
    use vek::{Extent2, Vec2};

    use crate::{
        body::Body,
        constraint::{Constraint, PinJoint},
        handler::CollisionHandler,
        shape::Shape,
        space::Space,
    };

    const DT: f64 = 1.0 / 60.0;

    fn space_with_gravity() -> Space {
        let mut space = Space::new();
        space.set_gravity(Vec2::new(0.0, -10.0));
        space
    }

    fn ball_shape(radius: f64, e: f64, u: f64) -> Shape {
        let mut shape = Shape::circle(radius, Vec2::zero());
        shape.set_elasticity(e);
        shape.set_friction(u);
        shape
    }

    /// A unit mass in free fall covers the analytic distance within the
    /// symplectic Euler drift.
    #[test]
    fn test_free_fall() {
        let mut space = space_with_gravity();
        let body = space.add_body(Body::new(1.0, 1.0));

        for _ in 0..60 {
            space.step(DT);
        }

        // p = -g t² / 2 after one second.
        assert_relative_eq!(space.body(body).position().y, -5.0, epsilon = 0.1);
        assert_relative_eq!(space.body(body).velocity().y, -10.0, epsilon = 0.01);
    }

    /// A perfectly elastic ball bounces back to its drop height.
    #[test]
    fn test_elastic_bounce() {
        let mut space = space_with_gravity();

        let floor = space.static_body();
        let floor_shape = {
            let mut shape = Shape::segment(Vec2::new(-50.0, 0.0), Vec2::new(50.0, 0.0), 0.0);
            shape.set_elasticity(1.0);
            shape
        };
        space.add_shape(floor, floor_shape);

        let ball = space.add_body(Body::new(1.0, 0.5));
        space.body_mut(ball).set_position(Vec2::new(0.0, 10.0));
        space.add_shape(ball, ball_shape(1.0, 1.0, 0.0));

        // Track the apex after each bounce.
        let mut peaks: Vec<f64> = Vec::new();
        let mut rising = false;
        let mut peak = 0.0f64;
        for _ in 0..800 {
            space.step(DT);

            let vy = space.body(ball).velocity().y;
            let y = space.body(ball).position().y;
            if vy > 0.0 {
                rising = true;
                peak = peak.max(y);
            } else if rising {
                peaks.push(peak);
                rising = false;
                peak = 0.0;
            }

            if peaks.len() >= 2 {
                break;
            }
        }

        assert!(peaks.len() >= 2, "Ball never bounced twice");
        for peak in peaks {
            assert_relative_eq!(peak, 10.0, epsilon = 0.5);
        }
    }

    /// A stack of boxes comes to rest on a static floor.
    #[test]
    fn test_stack_rest() {
        let mut space = space_with_gravity();

        let floor_shape = {
            let mut shape = Shape::segment(Vec2::new(-10.0, 0.0), Vec2::new(10.0, 0.0), 0.0);
            shape.set_friction(0.7);
            shape
        };
        space.add_shape(space.static_body(), floor_shape);

        let mut boxes = Vec::new();
        for level in 0..3 {
            let body = space.add_body(Body::new(1.0, 2.0 / 12.0));
            // Seed a slight overlap so the stack starts in contact.
            space
                .body_mut(body)
                .set_position(Vec2::new(0.0, 0.495 + level as f64 * 0.99));

            let mut shape = Shape::rectangle(Extent2::new(1.0, 1.0));
            shape.set_friction(0.7);
            space.add_shape(body, shape);

            boxes.push(body);
        }

        // Two seconds of settling.
        for _ in 0..120 {
            space.step(DT);
        }

        let top = *boxes.last().unwrap();
        assert!(
            space.body(top).velocity().y.abs() < 0.01,
            "Top box is still moving at {} m/s",
            space.body(top).velocity().y
        );
        // The stack must not have collapsed.
        assert!(space.body(top).position().y > 2.0);
    }

    /// A pin joint keeps its anchors at the measured distance.
    #[test]
    fn test_pin_joint_distance() {
        let mut space = Space::new();

        let a = space.add_body(Body::new(1.0, 1.0 / 6.0));
        let b = space.add_body(Body::new(1.0, 1.0 / 6.0));
        space.body_mut(b).set_position(Vec2::new(1.5, 0.0));

        let joint = PinJoint::new(Vec2::new(0.5, 0.0), Vec2::new(-0.5, 0.0));
        space.add_constraint(Constraint::new(a, b, joint));

        let anchor_distance = |space: &Space| {
            let pa = space.body(a).local_to_world(Vec2::new(0.5, 0.0));
            let pb = space.body(b).local_to_world(Vec2::new(-0.5, 0.0));
            pa.distance(pb)
        };
        assert_relative_eq!(anchor_distance(&space), 0.5, epsilon = 1e-9);

        space.body_mut(a).set_angular_velocity(1.0);

        space.step(DT);
        assert!((anchor_distance(&space) - 0.5).abs() < 1e-3);

        for _ in 0..60 {
            space.step(DT);
        }
        assert!((anchor_distance(&space) - 0.5).abs() < 1e-3);
    }

    /// Idle bodies leave the active list and wake up when mutated.
    #[test]
    fn test_sleep_and_wake() {
        let mut space = Space::new();
        space.set_sleep_time_threshold(0.5);

        let body = space.add_body(Body::new(1.0, 1.0));

        for _ in 0..40 {
            space.step(DT);
        }

        assert!(space.body(body).is_sleeping());
        assert!(!space.dynamic_bodies().contains(&body));

        // Any mutation through the space wakes the body again.
        space.body_mut(body).set_position(Vec2::new(1.0, 0.0));
        assert!(!space.body(body).is_sleeping());
        assert!(space.dynamic_bodies().contains(&body));
    }

    /// Separating shapes fire their separate callback exactly once and the
    /// arbiter expires after the persistence window.
    #[test]
    fn test_arbiter_expiry() {
        let mut space = Space::new();

        let a = space.add_body(Body::new(1.0, 1.0));
        space.add_shape(a, ball_shape(1.0, 0.0, 0.0));

        let b = space.add_body(Body::new(1.0, 1.0));
        space.body_mut(b).set_position(Vec2::new(1.5, 0.0));
        space.add_shape(b, ball_shape(1.0, 0.0, 0.0));

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

        // One step of contact.
        space.step(DT);
        assert_eq!(space.active_arbiters().len(), 1);
        assert_eq!(separations.get(), 0);

        // Pull the bodies apart, the next step fires the separation.
        space.body_mut(b).set_position(Vec2::new(100.0, 0.0));
        space.step(DT);
        assert_eq!(separations.get(), 1);

        // The cached pair expires after the persistence window.
        for _ in 0..space.settings().collision_persistence {
            space.step(DT);
        }
        assert_eq!(separations.get(), 1);
        assert!(space.cached_arbiters.is_empty());
        assert!(space.arbiter_store.is_empty());
    }

    /// Every live arbiter is threaded into both endpoint body lists.
    #[test]
    fn test_contact_graph_threading() {
        let mut space = space_with_gravity();

        let floor_shape = Shape::segment(Vec2::new(-10.0, 0.0), Vec2::new(10.0, 0.0), 0.0);
        space.add_shape(space.static_body(), floor_shape);

        let ball = space.add_body(Body::new(1.0, 0.5));
        space.body_mut(ball).set_position(Vec2::new(0.0, 1.0));
        space.add_shape(ball, ball_shape(1.0, 0.0, 0.3));

        for _ in 0..10 {
            space.step(DT);
        }

        assert_eq!(space.active_arbiters().len(), 1);
        let arb_id = space.active_arbiters()[0];
        let threaded_ball = space.body(ball).arbiters().iter().filter(|a| **a == arb_id).count();
        let threaded_floor = space
            .body(space.static_body())
            .arbiters()
            .iter()
            .filter(|a| **a == arb_id)
            .count();
        assert_eq!(threaded_ball, 1);
        assert_eq!(threaded_floor, 1);
    }

    /// Post-step callbacks with the same key coalesce and run exactly once.
    #[test]
    fn test_post_step_coalescing() {
        let mut space = Space::new();
        let runs = Rc::new(Cell::new(0));

        space.lock();
        for _ in 0..2 {
            let runs = Rc::clone(&runs);
            space.add_post_step_callback(7, move |_space| {
                runs.set(runs.get() + 1);
            });
        }
        {
            let runs = Rc::clone(&runs);
            space.add_post_step_callback(8, move |_space| {
                runs.set(runs.get() + 10);
            });
        }
        space.unlock(true);

        assert_eq!(runs.get(), 11);

        // The queue is drained, nothing runs twice.
        space.lock();
        space.unlock(true);
        assert_eq!(runs.get(), 11);
    }

    /// Impacts are aggregated on dynamic bodies and reported once.
    #[test]
    fn test_impact_aggregation() {
        let mut space = space_with_gravity();

        let floor_shape = {
            let mut shape = Shape::segment(Vec2::new(-10.0, 0.0), Vec2::new(10.0, 0.0), 0.0);
            shape.set_material(3);
            shape
        };
        space.add_shape(space.static_body(), floor_shape);

        let ball = space.add_body(Body::new(1.0, 0.5));
        space.body_mut(ball).set_position(Vec2::new(0.0, 3.0));
        let sphere = {
            let mut shape = ball_shape(1.0, 0.0, 0.0);
            shape.set_material(5);
            shape
        };
        space.add_shape(ball, sphere);

        let impacts = Rc::new(Cell::new(0));
        {
            let impacts = Rc::clone(&impacts);
            space.set_impact_handler(Box::new(move |_body, impact| {
                assert!(impact.dirty);
                assert!(impact.count > 0);
                impacts.set(impacts.get() + 1);
            }));
        }

        // Let the ball fall onto the floor and rest for a while.
        for _ in 0..120 {
            space.step(DT);
        }

        assert!(impacts.get() > 0, "No impacts were reported");
    }
}
