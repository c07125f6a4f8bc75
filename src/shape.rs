use std::f64::consts::PI;

use parry2d_f64::{
    na::{Isometry2, Point2, Vector2},
    query::{self, PointQuery as _, Ray, RayCast as _},
    shape::{Ball, Shape as _, SharedShape},
};
use slotmap::{new_key_type, Key as _};
use vek::{Aabr, Extent2, Vec2};

use crate::{
    body::{BodyId, Transform},
    handler::CollisionType,
    math::{from_na, from_na_point, perp_dot, to_na, to_na_point},
};

new_key_type! {
    /// Handle of a shape inside a space.
    pub struct ShapeId;
}

/// Distance under which query gradients fall back to a fixed direction.
const GRADIENT_EPSILON: f64 = 1e-9;

/// Category/mask/group based collision filter.
///
/// Two shapes collide when neither filter rejects the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeFilter {
    /// Shapes in the same non-zero group never collide.
    pub group: u32,
    /// Categories this shape belongs to.
    pub categories: u32,
    /// Categories this shape is willing to collide with.
    pub mask: u32,
}

impl ShapeFilter {
    /// Filter that collides with everything.
    pub const ALL: Self = Self {
        group: 0,
        categories: u32::MAX,
        mask: u32::MAX,
    };

    /// Whether a pair of filters rejects the collision.
    pub fn reject(&self, other: &Self) -> bool {
        (self.group != 0 && self.group == other.group)
            || (self.categories & other.mask) == 0
            || (other.categories & self.mask) == 0
    }
}

impl Default for ShapeFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// Mass contribution of a single shape to its body.
#[derive(Debug, Clone, Copy)]
pub struct MassInfo {
    /// Mass of the shape.
    pub m: f64,
    /// Moment of inertia per unit mass, around the shape's own center of gravity.
    pub i: f64,
    /// Center of gravity in body-local coordinates.
    pub cog: Vec2<f64>,
    /// Surface area.
    pub area: f64,
}

/// Convex geometry of a shape in body-local coordinates.
#[derive(Debug, Clone)]
pub enum ShapeGeometry {
    /// Circle with an offset from the body center.
    Circle {
        /// Center in body-local coordinates.
        offset: Vec2<f64>,
        /// Radius.
        radius: f64,
    },
    /// Line segment with an optional thickness radius.
    Segment {
        /// First endpoint.
        a: Vec2<f64>,
        /// Second endpoint.
        b: Vec2<f64>,
        /// Thickness radius.
        radius: f64,
    },
    /// Convex polygon with an optional rounding radius.
    Poly {
        /// Corner points in body-local coordinates.
        verts: Vec<Vec2<f64>>,
        /// Rounding radius.
        radius: f64,
    },
}

impl ShapeGeometry {
    /// Build the parry shape with the body scale baked into the local points.
    fn build(&self, scale: Vec2<f64>) -> SharedShape {
        match self {
            ShapeGeometry::Circle { radius, .. } => SharedShape::ball(radius * scale.x),
            ShapeGeometry::Segment { a, b, radius } => {
                let a = to_na_point(*a * scale);
                let b = to_na_point(*b * scale);

                if *radius > 0.0 {
                    SharedShape::capsule(a, b, *radius * scale.x)
                } else {
                    SharedShape::segment(a, b)
                }
            }
            ShapeGeometry::Poly { verts, radius } => {
                let points: Vec<Point2<f64>> =
                    verts.iter().map(|vert| to_na_point(*vert * scale)).collect();

                if *radius > 0.0 {
                    SharedShape::round_convex_hull(&points, *radius * scale.x)
                } else {
                    SharedShape::convex_hull(&points)
                }
                .expect("Degenerate polygon shape")
            }
        }
    }

    /// Mass contribution for a given total shape mass.
    fn mass_info(&self, mass: f64) -> MassInfo {
        match self {
            ShapeGeometry::Circle { offset, radius } => MassInfo {
                m: mass,
                i: 0.5 * radius * radius,
                cog: *offset,
                area: PI * radius * radius,
            },
            ShapeGeometry::Segment { a, b, radius } => {
                let length = a.distance(*b);

                MassInfo {
                    m: mass,
                    i: (length * length + 4.0 * radius * radius) / 12.0,
                    cog: (*a + *b) / 2.0,
                    area: 2.0 * radius * length + PI * radius * radius,
                }
            }
            ShapeGeometry::Poly { verts, radius } => {
                // Shoelace sums for area, centroid and second moment.
                let mut area2 = 0.0;
                let mut centroid = Vec2::zero();
                let mut moment = 0.0;
                let mut perimeter = 0.0;
                for (index, v0) in verts.iter().enumerate() {
                    let v1 = verts[(index + 1) % verts.len()];
                    let cross = perp_dot(*v0, v1);

                    area2 += cross;
                    centroid += (*v0 + v1) * cross;
                    moment += cross * (v0.dot(*v0) + v0.dot(v1) + v1.dot(v1));
                    perimeter += v0.distance(v1);
                }

                let centroid = centroid / (3.0 * area2);
                let unit_moment =
                    (moment / 12.0) / (area2 * 0.5) - centroid.magnitude_squared();

                MassInfo {
                    m: mass,
                    i: unit_moment,
                    cog: centroid,
                    area: (area2 * 0.5).abs() + perimeter * radius + PI * radius * radius,
                }
            }
        }
    }
}

/// Result of a point query against a single shape.
#[derive(Debug, Clone, Copy)]
pub struct PointQueryInfo {
    /// Shape that was hit.
    pub shape: ShapeId,
    /// Nearest point on the shape surface.
    pub point: Vec2<f64>,
    /// Signed distance to the surface, negative when the point is inside.
    pub distance: f64,
    /// Direction of increasing distance.
    pub gradient: Vec2<f64>,
}

/// Result of a segment query against a single shape.
#[derive(Debug, Clone, Copy)]
pub struct SegmentQueryInfo {
    /// Shape that was hit.
    pub shape: ShapeId,
    /// Hit point on the shape surface.
    pub point: Vec2<f64>,
    /// Surface normal at the hit point.
    pub normal: Vec2<f64>,
    /// Fraction along the queried segment.
    pub alpha: f64,
}

/// Convex collision shape attached to a body.
pub struct Shape {
    /// Body this shape is attached to.
    pub(crate) body: BodyId,
    /// Geometry in body-local coordinates.
    geometry: ShapeGeometry,
    /// Parry shape with the body scale baked in.
    shared: SharedShape,
    /// Scale the parry shape was built with.
    cached_scale: Vec2<f64>,
    /// World isometry cached by the last [`Shape::cache_data`].
    pub(crate) iso: Isometry2<f64>,
    /// World axis-aligned bounding box cached by the last [`Shape::cache_data`].
    pub(crate) bb: Aabr<f64>,
    /// Mass, zero for shapes that don't contribute to their body.
    pub(crate) mass: f64,
    /// Whether this shape only detects collisions without responding to them.
    pub(crate) sensor: bool,
    /// Coefficient of restitution.
    pub(crate) e: f64,
    /// Friction coefficient.
    pub(crate) u: f64,
    /// Surface velocity, for conveyor-belt style effects.
    pub(crate) surface_velocity: Vec2<f64>,
    /// Which collision handlers apply to this shape.
    pub(crate) collision_type: CollisionType,
    /// Collision filter.
    pub(crate) filter: ShapeFilter,
    /// Material identifier forwarded into impact reports.
    pub(crate) material: u8,
    /// Opaque user value.
    pub user_data: u64,
}

impl Shape {
    fn new(geometry: ShapeGeometry) -> Self {
        let shared = geometry.build(Vec2::one());

        Self {
            body: BodyId::null(),
            geometry,
            shared,
            cached_scale: Vec2::one(),
            iso: Isometry2::identity(),
            bb: Aabr {
                min: Vec2::zero(),
                max: Vec2::zero(),
            },
            mass: 0.0,
            sensor: false,
            e: 0.0,
            u: 0.0,
            surface_velocity: Vec2::zero(),
            collision_type: 0,
            filter: ShapeFilter::ALL,
            material: 0,
            user_data: 0,
        }
    }

    /// Create a circle with an offset from the body center.
    pub fn circle(radius: f64, offset: Vec2<f64>) -> Self {
        Self::new(ShapeGeometry::Circle { offset, radius })
    }

    /// Create a line segment with a thickness radius.
    pub fn segment(a: Vec2<f64>, b: Vec2<f64>, radius: f64) -> Self {
        Self::new(ShapeGeometry::Segment { a, b, radius })
    }

    /// Create a convex polygon with a rounding radius.
    pub fn poly(verts: Vec<Vec2<f64>>, radius: f64) -> Self {
        Self::new(ShapeGeometry::Poly { verts, radius })
    }

    /// Create an axis-aligned box centered on the body.
    pub fn rectangle(size: Extent2<f64>) -> Self {
        let half = size / 2.0;
        let verts = vec![
            Vec2::new(-half.w, -half.h),
            Vec2::new(half.w, -half.h),
            Vec2::new(half.w, half.h),
            Vec2::new(-half.w, half.h),
        ];

        Self::poly(verts, 0.0)
    }

    /// Refresh the cached world isometry and bounding box.
    pub(crate) fn cache_data(&mut self, transform: &Transform) -> Aabr<f64> {
        // Scaling changes the baked-in local points.
        if transform.scale != self.cached_scale {
            self.shared = self.geometry.build(transform.scale);
            self.cached_scale = transform.scale;
        }

        self.iso = match self.geometry {
            // A ball carries no orientation, bake the offset into the translation.
            ShapeGeometry::Circle { offset, .. } => Isometry2::new(
                to_na(transform.point(offset)),
                transform.iso.rot.to_radians(),
            ),
            _ => transform.iso.into(),
        };

        let aabb = self.shared.compute_aabb(&self.iso);
        self.bb = Aabr {
            min: Vec2::new(aabb.mins.x, aabb.mins.y),
            max: Vec2::new(aabb.maxs.x, aabb.maxs.y),
        };

        self.bb
    }

    /// Cached world bounding box.
    pub fn bb(&self) -> Aabr<f64> {
        self.bb
    }

    /// Body this shape is attached to.
    pub fn body(&self) -> BodyId {
        self.body
    }

    /// Mass contribution based on the current mass value.
    pub fn mass_info(&self) -> MassInfo {
        self.geometry.mass_info(self.mass)
    }

    /// Geometry in body-local coordinates.
    pub fn geometry(&self) -> &ShapeGeometry {
        &self.geometry
    }

    /// Parry representation, scaled to the owning body.
    pub(crate) fn parry_shape(&self) -> &SharedShape {
        &self.shared
    }

    /// Find the nearest point on this shape.
    pub fn point_query(&self, id: ShapeId, point: Vec2<f64>) -> PointQueryInfo {
        let projection = self
            .shared
            .as_ref()
            .project_point(&self.iso, &to_na_point(point), true);

        let delta = point - from_na_point(projection.point);
        let distance = delta.magnitude();

        let gradient = if distance > GRADIENT_EPSILON {
            // Inside the shape the distance grows towards the surface.
            if projection.is_inside {
                -delta / distance
            } else {
                delta / distance
            }
        } else {
            Vec2::unit_y()
        };

        PointQueryInfo {
            shape: id,
            point: from_na_point(projection.point),
            distance: if projection.is_inside {
                -distance
            } else {
                distance
            },
            gradient,
        }
    }

    /// Cast a segment with a thickness radius against this shape.
    pub fn segment_query(
        &self,
        id: ShapeId,
        a: Vec2<f64>,
        b: Vec2<f64>,
        radius: f64,
    ) -> Option<SegmentQueryInfo> {
        if radius == 0.0 {
            let ray = Ray::new(to_na_point(a), to_na(b - a));

            self.shared
                .as_ref()
                .cast_ray_and_get_normal(&self.iso, &ray, 1.0, true)
                .map(|hit| SegmentQueryInfo {
                    shape: id,
                    point: a + (b - a) * hit.toi,
                    normal: from_na(hit.normal),
                    alpha: hit.toi,
                })
        } else {
            let ball = Ball::new(radius);
            let start = Isometry2::new(to_na(a), 0.0);
            let velocity = to_na(b - a);

            query::time_of_impact(
                &start,
                &velocity,
                &ball,
                &self.iso,
                &Vector2::zeros(),
                self.shared.as_ref(),
                1.0,
                true,
            )
            .ok()
            .flatten()
            .map(|hit| SegmentQueryInfo {
                shape: id,
                point: from_na_point(self.iso * hit.witness2),
                normal: from_na(self.iso.transform_vector(&hit.normal2)),
                alpha: hit.toi,
            })
        }
    }

    /// Whether this shape only detects collisions without responding to them.
    pub fn is_sensor(&self) -> bool {
        self.sensor
    }

    /// Make this shape a sensor.
    pub fn set_sensor(&mut self, sensor: bool) {
        self.sensor = sensor;
    }

    /// Coefficient of restitution.
    pub fn elasticity(&self) -> f64 {
        self.e
    }

    /// Set the coefficient of restitution.
    pub fn set_elasticity(&mut self, e: f64) {
        debug_assert!(e >= 0.0 && e.is_finite(), "Elasticity is invalid");

        self.e = e;
    }

    /// Friction coefficient.
    pub fn friction(&self) -> f64 {
        self.u
    }

    /// Set the friction coefficient.
    pub fn set_friction(&mut self, u: f64) {
        debug_assert!(u >= 0.0 && u.is_finite(), "Friction is invalid");

        self.u = u;
    }

    /// Surface velocity, for conveyor-belt style effects.
    pub fn surface_velocity(&self) -> Vec2<f64> {
        self.surface_velocity
    }

    /// Set the surface velocity.
    pub fn set_surface_velocity(&mut self, velocity: Vec2<f64>) {
        self.surface_velocity = velocity;
    }

    /// Which collision handlers apply to this shape.
    pub fn collision_type(&self) -> CollisionType {
        self.collision_type
    }

    /// Set the collision type.
    pub fn set_collision_type(&mut self, collision_type: CollisionType) {
        self.collision_type = collision_type;
    }

    /// Collision filter.
    pub fn filter(&self) -> ShapeFilter {
        self.filter
    }

    /// Set the collision filter.
    pub fn set_filter(&mut self, filter: ShapeFilter) {
        self.filter = filter;
    }

    /// Material identifier forwarded into impact reports.
    pub fn material(&self) -> u8 {
        self.material
    }

    /// Set the material identifier.
    pub fn set_material(&mut self, material: u8) {
        self.material = material;
    }

    /// Mass of the shape.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Set the mass of the shape.
    ///
    /// For a shape that is already attached use
    /// [`crate::Space::set_shape_mass`], which also recomputes the body's
    /// mass properties.
    pub fn set_mass(&mut self, mass: f64) {
        debug_assert!(mass >= 0.0 && mass.is_finite(), "Mass is invalid");

        self.mass = mass;
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::{Extent2, Vec2};

    use crate::body::Transform;

    use super::Shape;

    /// A unit box must have the mass contribution of a unit box.
    #[test]
    fn test_box_mass_info() {
        let shape = {
            let mut shape = Shape::rectangle(Extent2::new(2.0, 2.0));
            shape.mass = 3.0;
            shape
        };

        let info = shape.mass_info();
        assert_relative_eq!(info.area, 4.0, epsilon = 1e-9);
        assert_relative_eq!(info.cog.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(info.cog.y, 0.0, epsilon = 1e-9);
        // Box moment per unit mass is (w² + h²) / 12.
        assert_relative_eq!(info.i, 8.0 / 12.0, epsilon = 1e-9);
        assert_relative_eq!(info.m, 3.0);
    }

    /// The cached bounding box must follow the body transform.
    #[test]
    fn test_cache_data() {
        let mut shape = Shape::circle(1.0, Vec2::zero());
        let transform = Transform::new(Vec2::new(5.0, -2.0), 0.0, Vec2::one());

        let bb = shape.cache_data(&transform);
        assert_relative_eq!(bb.min.x, 4.0, epsilon = 1e-9);
        assert_relative_eq!(bb.max.x, 6.0, epsilon = 1e-9);
        assert_relative_eq!(bb.min.y, -3.0, epsilon = 1e-9);
        assert_relative_eq!(bb.max.y, -1.0, epsilon = 1e-9);
    }

    /// A raycast must hit the surface of a circle.
    #[test]
    fn test_segment_query() {
        let mut shape = Shape::circle(1.0, Vec2::zero());
        shape.cache_data(&Transform::new(Vec2::zero(), 0.0, Vec2::one()));

        let hit = shape
            .segment_query(Default::default(), Vec2::new(-5.0, 0.0), Vec2::new(5.0, 0.0), 0.0)
            .expect("Ray missed the circle");

        assert_relative_eq!(hit.alpha, 0.4, epsilon = 1e-9);
        assert_relative_eq!(hit.point.x, -1.0, epsilon = 1e-9);
        assert_relative_eq!(hit.normal.x, -1.0, epsilon = 1e-9);
    }

    /// Point queries report signed distances.
    #[test]
    fn test_point_query() {
        let mut shape = Shape::circle(1.0, Vec2::zero());
        shape.cache_data(&Transform::new(Vec2::zero(), 0.0, Vec2::one()));

        let outside = shape.point_query(Default::default(), Vec2::new(3.0, 0.0));
        assert_relative_eq!(outside.distance, 2.0, epsilon = 1e-9);
        assert_relative_eq!(outside.gradient.x, 1.0, epsilon = 1e-9);

        let inside = shape.point_query(Default::default(), Vec2::new(0.5, 0.0));
        assert_relative_eq!(inside.distance, -0.5, epsilon = 1e-9);
        assert_relative_eq!(inside.gradient.x, 1.0, epsilon = 1e-9);
    }
}
