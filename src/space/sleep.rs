//! Sleeping of idle contact-graph components.
//!
//! Bodies connected through arbiters and constraints form components that are
//! put to sleep as a whole once every member has been idle long enough.
//! Sleeping bodies leave the active list and the dynamic partition, so they
//! cost nothing per step until something wakes them.

use arrayvec::ArrayVec;
use slotmap::Key as _;

use crate::{
    arbiter::ContactStore,
    body::{BodyId, BodyType},
    buffer::MAX_CONTACTS_PER_PAIR,
};

use super::Space;

impl Space {
    /// Wake a body and the sleeping component it belongs to.
    pub fn activate_body(&mut self, id: BodyId) {
        if self
            .bodies
            .get(id)
            .map_or(true, |body| body.body_type() != BodyType::Dynamic)
        {
            return;
        }

        self.bodies[id].sleeping.idle_time = 0.0;

        let root = self.bodies[id].sleeping.root;
        if !root.is_null() {
            // Wake the whole component.
            let mut body = root;
            while !body.is_null() {
                let next = self.bodies[body].sleeping.next;

                let sleeping = &mut self.bodies[body].sleeping;
                sleeping.idle_time = 0.0;
                sleeping.root = BodyId::null();
                sleeping.next = BodyId::null();

                if self.is_locked() {
                    // Restored when the space unlocks.
                    if !self.roused_bodies.contains(&body) {
                        self.roused_bodies.push(body);
                    }
                } else {
                    self.activate_body_now(body);
                }

                body = next;
            }

            if let Some(index) = self
                .sleeping_components
                .iter()
                .position(|component| *component == root)
            {
                self.sleeping_components.swap_remove(index);
            }
        }

        // Reset the idle timer of touching bodies as well so stacks don't
        // get left hanging in the air.
        for arb_id in self.bodies[id].arbiters.clone() {
            let arbiter = &self.arbiter_store[arb_id];
            let other = if arbiter.body_a == id {
                arbiter.body_b
            } else {
                arbiter.body_a
            };

            if self.bodies[other].body_type() != BodyType::Static {
                self.bodies[other].sleeping.idle_time = 0.0;
            }
        }
    }

    /// Restore a woken body into the active lists and partitions.
    pub(crate) fn activate_body_now(&mut self, id: BodyId) {
        debug_assert!(
            self.bodies[id].body_type() == BodyType::Dynamic,
            "Only dynamic bodies sleep"
        );
        debug_assert!(
            self.bodies[id].sleeping.root.is_null(),
            "Activating a body with live component pointers"
        );

        if self.dynamic_bodies.contains(&id) {
            return;
        }
        self.dynamic_bodies.push(id);

        for shape in self.bodies[id].shapes.clone() {
            self.static_shapes.remove(shape);
            self.dynamic_shapes.insert(shape);
        }

        // Arbiters are shared between two bodies that wake up together, so
        // each is restored once; the first endpoint arbitrarily owns it
        // unless that endpoint is the static anchor.
        for arb_id in self.bodies[id].arbiters.clone() {
            let (body_a, shape_a, shape_b) = {
                let arbiter = &self.arbiter_store[arb_id];
                (arbiter.body_a, arbiter.a, arbiter.b)
            };

            if id == body_a || self.bodies[body_a].body_type() == BodyType::Static {
                let key = Self::pair_key(shape_a, shape_b);

                // The pair may have re-collided this very step and received
                // a fresh arbiter, in which case the slept one is dropped.
                if self.cached_arbiters.contains_key(&key) {
                    self.unthread_arbiter(arb_id);
                    self.arbiter_store.remove(arb_id);
                    continue;
                }

                let contacts: ArrayVec<_, MAX_CONTACTS_PER_PAIR> =
                    match &self.arbiter_store[arb_id].contacts {
                        ContactStore::Owned(contacts) => contacts.clone(),
                        _ => continue,
                    };

                // Restore the contacts into the block ring so the solver can
                // warm start from them again.
                let slice = self.buffers.claim(
                    &contacts,
                    self.stamp,
                    self.settings.collision_persistence,
                );

                let arbiter = &mut self.arbiter_store[arb_id];
                arbiter.contacts = ContactStore::Buffered(slice);
                arbiter.stamp = self.stamp;

                self.cached_arbiters.insert(key, arb_id);
                self.arbiters.push(arb_id);
            }
        }

        for constraint_id in self.bodies[id].constraints.clone() {
            let body_a = self.constraint_store[constraint_id].a;
            if id == body_a || self.bodies[body_a].body_type() == BodyType::Static {
                self.constraints.push(constraint_id);
            }
        }
    }

    /// Move a body of a freshly sleeping component out of the active lists.
    pub(crate) fn deactivate_body(&mut self, id: BodyId) {
        debug_assert!(
            self.bodies[id].body_type() == BodyType::Dynamic,
            "Only dynamic bodies sleep"
        );

        if let Some(index) = self.dynamic_bodies.iter().position(|body| *body == id) {
            self.dynamic_bodies.swap_remove(index);
        }

        for shape in self.bodies[id].shapes.clone() {
            self.dynamic_shapes.remove(shape);
            self.static_shapes.insert(shape);
        }

        for arb_id in self.bodies[id].arbiters.clone() {
            let (body_a, shape_a, shape_b) = {
                let arbiter = &self.arbiter_store[arb_id];
                (arbiter.body_a, arbiter.a, arbiter.b)
            };

            if id == body_a || self.bodies[body_a].body_type() == BodyType::Static {
                let key = Self::pair_key(shape_a, shape_b);
                if self.cached_arbiters.get(&key) == Some(&arb_id) {
                    self.cached_arbiters.remove(&key);
                }
                if let Some(index) = self.arbiters.iter().position(|live| *live == arb_id) {
                    self.arbiters.swap_remove(index);
                }

                // Copy the contacts out of the block ring so they don't time
                // out while the component sleeps.
                let contacts: ArrayVec<_, MAX_CONTACTS_PER_PAIR> =
                    match self.arbiter_store[arb_id].contacts {
                        ContactStore::Buffered(slice) => {
                            self.buffers.contacts(slice).iter().copied().collect()
                        }
                        ContactStore::Owned(ref contacts) => contacts.clone(),
                        ContactStore::Empty => ArrayVec::new(),
                    };
                self.arbiter_store[arb_id].contacts = ContactStore::Owned(contacts);
            }
        }

        for constraint_id in self.bodies[id].constraints.clone() {
            let body_a = self.constraint_store[constraint_id].a;
            if id == body_a || self.bodies[body_a].body_type() == BodyType::Static {
                if let Some(index) = self
                    .constraints
                    .iter()
                    .position(|constraint| *constraint == constraint_id)
                {
                    self.constraints.swap_remove(index);
                }
            }
        }
    }

    /// Rebuild the contact graph and handle component sleeping and waking.
    pub(crate) fn process_components(&mut self, dt: f64) {
        puffin::profile_function!();

        let sleep = self.settings.sleep_time_threshold != f64::INFINITY;

        // Update the idle timers.
        let dv = self.settings.idle_speed_threshold;
        let dvsq = if dv != 0.0 {
            dv * dv
        } else {
            self.settings.gravity.magnitude_squared() * dt * dt
        };
        for index in 0..self.dynamic_bodies.len() {
            let id = self.dynamic_bodies[index];
            let body = &mut self.bodies[id];

            // Kinematic bodies keep their partners awake through the arbiter
            // scan below instead.
            if body.body_type() != BodyType::Dynamic {
                continue;
            }

            let ke_threshold = if dvsq != 0.0 { body.m * dvsq } else { 0.0 };
            body.sleeping.idle_time = if body.kinetic_energy() > ke_threshold {
                0.0
            } else {
                body.sleeping.idle_time + dt
            };
        }

        // Wake bodies touched by kinematic or sleeping partners, then thread
        // the live arbiters into the contact graph. Waking may append
        // restored arbiters to the live list, those are threaded as well.
        let mut index = 0;
        while index < self.arbiters.len() {
            let arb_id = self.arbiters[index];
            index += 1;

            let (a, b) = {
                let arbiter = &self.arbiter_store[arb_id];
                (arbiter.body_a, arbiter.body_b)
            };

            if sleep {
                if self.bodies[b].body_type() == BodyType::Kinematic || self.bodies[a].is_sleeping()
                {
                    self.activate_body(a);
                }
                if self.bodies[a].body_type() == BodyType::Kinematic || self.bodies[b].is_sleeping()
                {
                    self.activate_body(b);
                }
            }

            self.thread_arbiter(a, arb_id);
            self.thread_arbiter(b, arb_id);
        }

        if !sleep {
            return;
        }

        // Bodies jointed to a kinematic body are held active as well.
        for constraint_id in self.constraints.clone() {
            let (a, b) = self.constraint_store[constraint_id].bodies();

            if self.bodies[b].body_type() == BodyType::Kinematic {
                self.activate_body(a);
            }
            if self.bodies[a].body_type() == BodyType::Kinematic {
                self.activate_body(b);
            }
        }

        // Generate components and put the fully idle ones to sleep.
        let threshold = self.settings.sleep_time_threshold;
        let mut index = 0;
        while index < self.dynamic_bodies.len() {
            let id = self.dynamic_bodies[index];

            if self.bodies[id].sleeping.root.is_null() {
                // Flood fill the component of the contact graph this body is
                // part of.
                self.flood_fill(id, id);

                if !self.component_active(id, threshold) {
                    self.sleeping_components.push(id);

                    let mut body = id;
                    while !body.is_null() {
                        let next = self.bodies[body].sleeping.next;
                        self.deactivate_body(body);
                        body = next;
                    }

                    // Deactivation removed the current body from the list,
                    // the index already holds the next candidate.
                    continue;
                }
            }

            index += 1;

            // Only sleeping bodies retain their component pointers.
            let body = &mut self.bodies[id];
            body.sleeping.root = BodyId::null();
            body.sleeping.next = BodyId::null();
        }
    }

    /// Mark every body reachable through arbiters and constraints as part of
    /// a component.
    fn flood_fill(&mut self, root: BodyId, id: BodyId) {
        // Kinematic bodies can't sleep and static bodies only anchor
        // components, neither propagates.
        if self.bodies[id].body_type() != BodyType::Dynamic {
            return;
        }

        let other_root = self.bodies[id].sleeping.root;
        if other_root.is_null() {
            {
                let root_next = self.bodies[root].sleeping.next;
                let body = &mut self.bodies[id];
                body.sleeping.root = root;
                if id != root {
                    body.sleeping.next = root_next;
                }
            }
            if id != root {
                self.bodies[root].sleeping.next = id;
            }

            for arb_id in self.bodies[id].arbiters.clone() {
                let arbiter = &self.arbiter_store[arb_id];
                let other = if arbiter.body_a == id {
                    arbiter.body_b
                } else {
                    arbiter.body_a
                };
                self.flood_fill(root, other);
            }

            for constraint_id in self.bodies[id].constraints.clone() {
                let constraint = &self.constraint_store[constraint_id];
                let other = if constraint.a == id {
                    constraint.b
                } else {
                    constraint.a
                };
                self.flood_fill(root, other);
            }
        } else {
            debug_assert_eq!(
                other_root, root,
                "Inconsistency detected in the contact graph"
            );
        }
    }

    /// Whether any body of a component is still below the sleep threshold.
    fn component_active(&self, root: BodyId, threshold: f64) -> bool {
        let mut body = root;
        while !body.is_null() {
            if self.bodies[body].sleeping.idle_time < threshold {
                return true;
            }
            body = self.bodies[body].sleeping.next;
        }

        false
    }
}
