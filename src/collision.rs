use std::hash::{Hash, Hasher};

use parry2d_f64::query::{ContactManifold, DefaultQueryDispatcher, PersistentQueryDispatcher};
use smallvec::SmallVec;
use vek::Vec2;

use crate::{
    arbiter::Contact,
    math::{from_na, from_na_point},
    shape::Shape,
};

/// Contacts produced by colliding a single shape pair.
#[derive(Debug, Default)]
pub(crate) struct CollisionResult {
    /// Collision normal, pointing from the first towards the second shape.
    pub(crate) n: Vec2<f64>,
    /// Contact points, with the witness points stored in their offset slots.
    pub(crate) contacts: SmallVec<[Contact; 4]>,
}

/// Single point of a probe shape query.
#[derive(Debug, Clone, Copy)]
pub struct ContactPoint {
    /// Witness point on the first shape.
    pub point_a: Vec2<f64>,
    /// Witness point on the second shape.
    pub point_b: Vec2<f64>,
    /// Signed distance between the witness points, negative when penetrating.
    pub distance: f64,
}

/// Contact points reported by a probe shape query.
#[derive(Debug, Default)]
pub struct ContactPointSet {
    /// Collision normal, pointing from the probe towards the hit shape.
    pub normal: Vec2<f64>,
    /// Contact points.
    pub points: SmallVec<[ContactPoint; 2]>,
}

/// Collide two shapes using their cached world isometries.
///
/// Only penetrating contact points are emitted; `margin` widens the manifold
/// search so resting contacts stay persistent from frame to frame.
pub(crate) fn collide(a: &Shape, b: &Shape, margin: f64) -> CollisionResult {
    puffin::profile_function!();

    let pos12 = a.iso.inv_mul(&b.iso);

    let mut manifolds: Vec<ContactManifold<(), ()>> = Vec::new();
    DefaultQueryDispatcher
        .contact_manifolds(
            &pos12,
            a.parry_shape().as_ref(),
            b.parry_shape().as_ref(),
            margin,
            &mut manifolds,
            &mut None,
        )
        .expect("Collision between unsupported shape pair");

    let mut result = CollisionResult::default();

    for (manifold_index, manifold) in manifolds.iter().enumerate() {
        if manifold.points.is_empty() {
            continue;
        }

        // The manifold normal is in the local space of the first shape.
        result.n = from_na(a.iso.transform_vector(&manifold.local_n1));

        for tracked in manifold.contacts() {
            // Ignore contacts that are not penetrating yet.
            if tracked.dist >= 0.0 {
                continue;
            }

            // Witness points stay absolute until the arbiter makes them
            // relative to the body centers.
            result.contacts.push(Contact {
                r1: from_na_point(a.iso * tracked.local_p1),
                r2: from_na_point(b.iso * tracked.local_p2),
                hash: feature_hash(manifold_index, &tracked.fid1, &tracked.fid2),
                ..Contact::default()
            });
        }
    }

    result
}

/// Collide two shapes and report all touching points without arbiter bookkeeping.
pub(crate) fn shapes_collide(a: &Shape, b: &Shape) -> ContactPointSet {
    let pos12 = a.iso.inv_mul(&b.iso);

    let mut manifolds: Vec<ContactManifold<(), ()>> = Vec::new();
    DefaultQueryDispatcher
        .contact_manifolds(
            &pos12,
            a.parry_shape().as_ref(),
            b.parry_shape().as_ref(),
            0.0,
            &mut manifolds,
            &mut None,
        )
        .expect("Collision between unsupported shape pair");

    let mut set = ContactPointSet::default();

    for manifold in &manifolds {
        if manifold.points.is_empty() {
            continue;
        }

        set.normal = from_na(a.iso.transform_vector(&manifold.local_n1));

        for tracked in manifold.contacts() {
            if tracked.dist >= 0.0 {
                continue;
            }

            set.points.push(ContactPoint {
                point_a: from_na_point(a.iso * tracked.local_p1),
                point_b: from_na_point(b.iso * tracked.local_p2),
                distance: tracked.dist,
            });
        }
    }

    set
}

/// Stable hash identifying a contact point within a persistent manifold.
///
/// Matching hashes across frames carry the accumulated impulses over.
fn feature_hash<F: Hash>(manifold_index: usize, fid1: &F, fid2: &F) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    manifold_index.hash(&mut hasher);
    fid1.hash(&mut hasher);
    fid2.hash(&mut hasher);

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::{Extent2, Vec2};

    use crate::{body::Transform, shape::Shape};

    use super::collide;

    fn cached(mut shape: Shape, position: Vec2<f64>) -> Shape {
        shape.cache_data(&Transform::new(position, 0.0, Vec2::one()));
        shape
    }

    /// Two overlapping circles produce a single contact along the center line.
    #[test]
    fn test_circle_circle() {
        let a = cached(Shape::circle(1.0, Vec2::zero()), Vec2::zero());
        let b = cached(Shape::circle(1.0, Vec2::zero()), Vec2::new(1.5, 0.0));

        let result = collide(&a, &b, 0.1);
        assert_eq!(result.contacts.len(), 1);
        assert_relative_eq!(result.n.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(result.n.y, 0.0, epsilon = 1e-9);

        // Witness points sit on each surface.
        assert_relative_eq!(result.contacts[0].r1.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(result.contacts[0].r2.x, 0.5, epsilon = 1e-9);
    }

    /// Separated shapes produce no contacts.
    #[test]
    fn test_separated() {
        let a = cached(Shape::circle(1.0, Vec2::zero()), Vec2::zero());
        let b = cached(Shape::circle(1.0, Vec2::zero()), Vec2::new(5.0, 0.0));

        let result = collide(&a, &b, 0.1);
        assert!(result.contacts.is_empty());
    }

    /// A box resting on a box produces a two point manifold with stable hashes.
    #[test]
    fn test_box_box_manifold() {
        let a = cached(Shape::rectangle(Extent2::new(2.0, 2.0)), Vec2::zero());
        let b = cached(
            Shape::rectangle(Extent2::new(2.0, 2.0)),
            Vec2::new(0.0, 1.9),
        );

        let first = collide(&a, &b, 0.1);
        assert_eq!(first.contacts.len(), 2);

        // The same configuration produces the same feature hashes.
        let second = collide(&a, &b, 0.1);
        assert_eq!(first.contacts[0].hash, second.contacts[0].hash);
        assert_eq!(first.contacts[1].hash, second.contacts[1].hash);
        assert_ne!(first.contacts[0].hash, first.contacts[1].hash);
    }
}
