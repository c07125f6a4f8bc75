use bvh_arena::{volumes::Aabb, Bvh};
use slotmap::SlotMap;
use vek::Aabr;

use crate::shape::{Shape, ShapeId};

/// One of the space's two shape partitions.
///
/// Membership is kept in insertion order so candidate pair emission stays
/// deterministic for identical inputs.
#[derive(Default)]
pub(crate) struct ShapeIndex {
    /// Shapes registered in this partition.
    shapes: Vec<ShapeId>,
}

impl ShapeIndex {
    /// Register a shape.
    pub(crate) fn insert(&mut self, id: ShapeId) {
        debug_assert!(!self.shapes.contains(&id), "Shape is already indexed");

        self.shapes.push(id);
    }

    /// Unregister a shape.
    pub(crate) fn remove(&mut self, id: ShapeId) {
        if let Some(index) = self.shapes.iter().position(|shape| *shape == id) {
            self.shapes.remove(index);
        }
    }

    /// All shapes in this partition.
    pub(crate) fn iter(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.shapes.iter().copied()
    }

    /// Amount of registered shapes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shapes.len()
    }
}

/// Emit candidate pairs for the dynamic partition.
///
/// Dynamic-dynamic pairs come from a bounding volume hierarchy built over the
/// cached world bounds, dynamic-static pairs from scanning the static
/// partition with the same bounds.
pub(crate) fn candidate_pairs(
    dynamic: &ShapeIndex,
    statics: &ShapeIndex,
    shapes: &SlotMap<ShapeId, Shape>,
    pairs: &mut Vec<(ShapeId, ShapeId)>,
) {
    puffin::profile_function!();

    // Construct a bounding volume hierarchy to find matching pairs.
    let mut bvh: Bvh<ShapeId, Aabb<2>> = Bvh::default();
    for id in dynamic.iter() {
        bvh.insert(id, volume(shapes[id].bb()));
    }

    bvh.for_each_overlaping_pair(|a, b| pairs.push((*a, *b)));

    // Collide every dynamic shape against the static partition.
    for id in dynamic.iter() {
        let bb = shapes[id].bb();
        for other in statics.iter() {
            if bb.collides_with_aabr(shapes[other].bb()) {
                pairs.push((id, other));
            }
        }
    }
}

/// Convert a world bounding box into a hierarchy volume.
fn volume(bb: Aabr<f64>) -> Aabb<2> {
    Aabb::from_min_max(
        [bb.min.x as f32, bb.min.y as f32],
        [bb.max.x as f32, bb.max.y as f32],
    )
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;
    use vek::Vec2;

    use crate::{
        body::Transform,
        shape::{Shape, ShapeId},
    };

    use super::{candidate_pairs, ShapeIndex};

    fn add_shape(
        shapes: &mut SlotMap<ShapeId, Shape>,
        index: &mut ShapeIndex,
        position: Vec2<f64>,
    ) -> ShapeId {
        let mut shape = Shape::circle(1.0, Vec2::zero());
        shape.cache_data(&Transform::new(position, 0.0, Vec2::one()));

        let id = shapes.insert(shape);
        index.insert(id);

        id
    }

    /// Overlapping dynamic shapes are reported exactly once.
    #[test]
    fn test_dynamic_pairs() {
        let mut shapes = SlotMap::with_key();
        let mut dynamic = ShapeIndex::default();
        let statics = ShapeIndex::default();

        let a = add_shape(&mut shapes, &mut dynamic, Vec2::zero());
        let b = add_shape(&mut shapes, &mut dynamic, Vec2::new(1.0, 0.0));
        // Far away, must not pair with anything.
        add_shape(&mut shapes, &mut dynamic, Vec2::new(100.0, 0.0));

        let mut pairs = Vec::new();
        candidate_pairs(&dynamic, &statics, &shapes, &mut pairs);

        assert_eq!(pairs.len(), 1);
        let (x, y) = pairs[0];
        assert!((x == a && y == b) || (x == b && y == a));
    }

    /// Dynamic shapes also pair against the static partition.
    #[test]
    fn test_static_pairs() {
        let mut shapes = SlotMap::with_key();
        let mut dynamic = ShapeIndex::default();
        let mut statics = ShapeIndex::default();

        let a = add_shape(&mut shapes, &mut dynamic, Vec2::zero());
        let b = add_shape(&mut shapes, &mut statics, Vec2::new(0.5, 0.5));

        let mut pairs = Vec::new();
        candidate_pairs(&dynamic, &statics, &shapes, &mut pairs);

        assert_eq!(pairs, vec![(a, b)]);
    }

    /// Removal unregisters the shape.
    #[test]
    fn test_remove() {
        let mut shapes = SlotMap::with_key();
        let mut index = ShapeIndex::default();

        let id = add_shape(&mut shapes, &mut index, Vec2::zero());
        assert_eq!(index.len(), 1);

        index.remove(id);
        assert_eq!(index.len(), 0);
    }
}
