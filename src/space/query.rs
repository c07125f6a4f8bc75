//! Point, segment, bounding box and shape queries against both partitions.
//!
//! Queries don't take the space lock and may be issued outside a step. A
//! query miss is a well-formed outcome, never an error.

use vek::{Aabr, Vec2};

use crate::{
    body::Transform,
    collision::{self, ContactPointSet},
    shape::{PointQueryInfo, SegmentQueryInfo, Shape, ShapeFilter, ShapeId},
};

use super::Space;

/// Which partitions a buffered query inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryScope {
    /// Only shapes of awake dynamic bodies.
    Dynamic,
    /// Only static and sleeping shapes.
    Static,
    /// Everything.
    Both,
}

impl QueryScope {
    fn dynamic(self) -> bool {
        matches!(self, QueryScope::Dynamic | QueryScope::Both)
    }

    fn statics(self) -> bool {
        matches!(self, QueryScope::Static | QueryScope::Both)
    }
}

/// Bounding box of a point query.
fn point_bb(point: Vec2<f64>, max_distance: f64) -> Aabr<f64> {
    let radius = max_distance.max(0.0);

    Aabr {
        min: point - radius,
        max: point + radius,
    }
}

/// Bounding box of a segment query.
fn segment_bb(start: Vec2<f64>, end: Vec2<f64>, radius: f64) -> Aabr<f64> {
    Aabr {
        min: Vec2::new(start.x.min(end.x), start.y.min(end.y)) - radius,
        max: Vec2::new(start.x.max(end.x), start.y.max(end.y)) + radius,
    }
}

impl Space {
    /// Find all shapes within a distance of a point.
    pub fn point_query(
        &self,
        point: Vec2<f64>,
        max_distance: f64,
        filter: ShapeFilter,
        mut f: impl FnMut(&PointQueryInfo),
    ) {
        let bb = point_bb(point, max_distance);

        for id in self.dynamic_shapes.iter().chain(self.static_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&filter) || !bb.collides_with_aabr(shape.bb()) {
                continue;
            }

            let info = shape.point_query(id, point);
            if info.distance < max_distance {
                f(&info);
            }
        }
    }

    /// Find the shape closest to a point, ignoring sensors.
    pub fn point_query_nearest(
        &self,
        point: Vec2<f64>,
        max_distance: f64,
        filter: ShapeFilter,
    ) -> Option<PointQueryInfo> {
        let bb = point_bb(point, max_distance);

        let mut best: Option<PointQueryInfo> = None;
        for id in self.dynamic_shapes.iter().chain(self.static_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&filter)
                || shape.is_sensor()
                || !bb.collides_with_aabr(shape.bb())
            {
                continue;
            }

            let info = shape.point_query(id, point);
            // Narrow the search to the best match found so far.
            let cutoff = best.as_ref().map_or(max_distance, |best| best.distance);
            if info.distance < cutoff {
                best = Some(info);
            }
        }

        best
    }

    /// Collect shapes within a distance of a point, up to a maximum count.
    pub fn point_query_all(
        &self,
        point: Vec2<f64>,
        max_distance: f64,
        filter: ShapeFilter,
        scope: QueryScope,
        max_count: usize,
        results: &mut Vec<PointQueryInfo>,
    ) -> usize {
        results.clear();
        let bb = point_bb(point, max_distance);

        for (enabled, partition) in [
            (scope.dynamic(), &self.dynamic_shapes),
            (scope.statics(), &self.static_shapes),
        ] {
            if !enabled {
                continue;
            }

            for id in partition.iter() {
                if results.len() >= max_count {
                    return results.len();
                }

                let shape = &self.shapes[id];
                if shape.filter().reject(&filter) || !bb.collides_with_aabr(shape.bb()) {
                    continue;
                }

                let info = shape.point_query(id, point);
                if info.distance < max_distance {
                    results.push(info);
                }
            }
        }

        results.len()
    }

    /// Cast a thick segment through the space, reporting every hit.
    pub fn segment_query(
        &self,
        start: Vec2<f64>,
        end: Vec2<f64>,
        radius: f64,
        filter: ShapeFilter,
        mut f: impl FnMut(&SegmentQueryInfo),
    ) {
        let bb = segment_bb(start, end, radius);

        for id in self.static_shapes.iter().chain(self.dynamic_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&filter) || !bb.collides_with_aabr(shape.bb()) {
                continue;
            }

            if let Some(info) = shape.segment_query(id, start, end, radius) {
                f(&info);
            }
        }
    }

    /// Cast a thick segment and return the first hit, ignoring sensors.
    pub fn segment_query_first(
        &self,
        start: Vec2<f64>,
        end: Vec2<f64>,
        radius: f64,
        filter: ShapeFilter,
    ) -> Option<SegmentQueryInfo> {
        let bb = segment_bb(start, end, radius);

        let mut best: Option<SegmentQueryInfo> = None;
        for id in self.static_shapes.iter().chain(self.dynamic_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&filter)
                || shape.is_sensor()
                || !bb.collides_with_aabr(shape.bb())
            {
                continue;
            }

            // Contract the search as the closest hit fraction shrinks.
            let cutoff = best.as_ref().map_or(1.0, |best| best.alpha);
            if let Some(info) = shape.segment_query(id, start, end, radius) {
                if info.alpha < cutoff {
                    best = Some(info);
                }
            }
        }

        best
    }

    /// Cast a thick segment, collecting hits up to a maximum count.
    pub fn segment_query_all(
        &self,
        start: Vec2<f64>,
        end: Vec2<f64>,
        radius: f64,
        filter: ShapeFilter,
        scope: QueryScope,
        max_count: usize,
        results: &mut Vec<SegmentQueryInfo>,
    ) -> usize {
        results.clear();
        let bb = segment_bb(start, end, radius);

        for (enabled, partition) in [
            (scope.dynamic(), &self.dynamic_shapes),
            (scope.statics(), &self.static_shapes),
        ] {
            if !enabled {
                continue;
            }

            for id in partition.iter() {
                if results.len() >= max_count {
                    return results.len();
                }

                let shape = &self.shapes[id];
                if shape.filter().reject(&filter) || !bb.collides_with_aabr(shape.bb()) {
                    continue;
                }

                if let Some(info) = shape.segment_query(id, start, end, radius) {
                    results.push(info);
                }
            }
        }

        results.len()
    }

    /// Find all shapes whose bounding box overlaps the queried one.
    pub fn bb_query(&self, bb: Aabr<f64>, filter: ShapeFilter, mut f: impl FnMut(ShapeId)) {
        for id in self.dynamic_shapes.iter().chain(self.static_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&filter) || !bb.collides_with_aabr(shape.bb()) {
                continue;
            }

            f(id);
        }
    }

    /// Collect shapes whose bounding box overlaps the queried one.
    pub fn bb_query_all(
        &self,
        bb: Aabr<f64>,
        filter: ShapeFilter,
        scope: QueryScope,
        max_count: usize,
        results: &mut Vec<ShapeId>,
    ) -> usize {
        results.clear();

        for (enabled, partition) in [
            (scope.dynamic(), &self.dynamic_shapes),
            (scope.statics(), &self.static_shapes),
        ] {
            if !enabled {
                continue;
            }

            for id in partition.iter() {
                if results.len() >= max_count {
                    return results.len();
                }

                let shape = &self.shapes[id];
                if !shape.filter().reject(&filter) && bb.collides_with_aabr(shape.bb()) {
                    results.push(id);
                }
            }
        }

        results.len()
    }

    /// Collide a probe shape against the world.
    ///
    /// The callback receives the contact set of every touching shape.
    /// Returns whether any touching pair was not a sensor.
    pub fn shape_query(
        &self,
        probe: &mut Shape,
        transform: &Transform,
        mut f: impl FnMut(ShapeId, &ContactPointSet),
    ) -> bool {
        let bb = probe.cache_data(transform);

        let mut any_collision = false;
        for id in self.dynamic_shapes.iter().chain(self.static_shapes.iter()) {
            let shape = &self.shapes[id];
            if shape.filter().reject(&probe.filter()) || !bb.collides_with_aabr(shape.bb()) {
                continue;
            }

            let set = collision::shapes_collide(probe, shape);
            if !set.points.is_empty() {
                any_collision |= !(probe.is_sensor() || shape.is_sensor());
                f(id, &set);
            }
        }

        any_collision
    }

    /// Collide a probe shape against the world, collecting the touching
    /// shapes up to a maximum count.
    pub fn shape_query_all(
        &self,
        probe: &mut Shape,
        transform: &Transform,
        scope: QueryScope,
        max_count: usize,
        results: &mut Vec<ShapeId>,
    ) -> usize {
        results.clear();
        let bb = probe.cache_data(transform);

        for (enabled, partition) in [
            (scope.dynamic(), &self.dynamic_shapes),
            (scope.statics(), &self.static_shapes),
        ] {
            if !enabled {
                continue;
            }

            for id in partition.iter() {
                if results.len() >= max_count {
                    return results.len();
                }

                let shape = &self.shapes[id];
                if shape.filter().reject(&probe.filter()) || !bb.collides_with_aabr(shape.bb()) {
                    continue;
                }

                if !collision::shapes_collide(probe, shape).points.is_empty() {
                    results.push(id);
                }
            }
        }

        results.len()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::{Aabr, Vec2};

    use crate::{
        body::{Body, Transform},
        shape::{Shape, ShapeFilter, ShapeId},
        space::Space,
    };

    use super::QueryScope;

    fn test_space() -> (Space, ShapeId, ShapeId) {
        let mut space = Space::new();

        // A static circle at the origin and a dynamic one to the right.
        let fixed = space.add_shape(space.static_body(), Shape::circle(1.0, Vec2::zero()));

        let body = space.add_body(Body::new(1.0, 1.0));
        space.body_mut(body).set_position(Vec2::new(5.0, 0.0));
        let moving = space.add_shape(body, Shape::circle(1.0, Vec2::zero()));

        (space, fixed, moving)
    }

    /// Point queries report every shape in range.
    #[test]
    fn test_point_query() {
        let (space, fixed, _) = test_space();

        let mut hits = Vec::new();
        space.point_query(Vec2::new(0.0, 2.0), 1.5, ShapeFilter::ALL, |info| {
            hits.push(info.shape)
        });
        assert_eq!(hits, vec![fixed]);

        // Out of range of everything.
        let mut hits = 0;
        space.point_query(Vec2::new(0.0, 20.0), 1.5, ShapeFilter::ALL, |_| hits += 1);
        assert_eq!(hits, 0);
    }

    /// The nearest variant picks the closest shape.
    #[test]
    fn test_point_query_nearest() {
        let (space, _, moving) = test_space();

        let info = space
            .point_query_nearest(Vec2::new(3.5, 0.0), f64::INFINITY, ShapeFilter::ALL)
            .expect("No shape found");
        assert_eq!(info.shape, moving);
        assert_relative_eq!(info.distance, 0.5, epsilon = 1e-9);
    }

    /// Raycasts hit the first surface along the segment.
    #[test]
    fn test_segment_query_first() {
        let (space, fixed, _) = test_space();

        let info = space
            .segment_query_first(
                Vec2::new(-10.0, 0.0),
                Vec2::new(10.0, 0.0),
                0.0,
                ShapeFilter::ALL,
            )
            .expect("Ray hit nothing");
        assert_eq!(info.shape, fixed);
        assert_relative_eq!(info.point.x, -1.0, epsilon = 1e-6);
    }

    /// Bounding box queries are a pure broadphase overlap filter.
    #[test]
    fn test_bb_query() {
        let (space, _, moving) = test_space();

        let mut results = Vec::new();
        space.bb_query_all(
            Aabr {
                min: Vec2::new(4.0, -0.5),
                max: Vec2::new(6.0, 0.5),
            },
            ShapeFilter::ALL,
            QueryScope::Both,
            16,
            &mut results,
        );
        assert_eq!(results, vec![moving]);
    }

    /// Probe shape queries report contact sets and sensor-ness.
    #[test]
    fn test_shape_query() {
        let (space, fixed, _) = test_space();

        let mut probe = Shape::circle(1.0, Vec2::zero());
        let transform = Transform::new(Vec2::new(1.5, 0.0), 0.0, Vec2::one());

        let mut hits = Vec::new();
        let any = space.shape_query(&mut probe, &transform, |id, set| {
            assert!(!set.points.is_empty());
            hits.push(id);
        });
        assert!(any);
        assert_eq!(hits, vec![fixed]);

        // A sensor probe still reports, but doesn't count as a collision.
        probe.set_sensor(true);
        let any = space.shape_query(&mut probe, &transform, |_, _| {});
        assert!(!any);
    }
}
