use std::f64::consts::TAU;

use parry2d_f64::na::{Isometry2, Point2, Vector2};
use vek::Vec2;

/// Wrap an angle to the `(-2π, 2π)` range.
pub fn wrap_angle(angle: f64) -> f64 {
    angle % TAU
}

/// Counterclockwise perpendicular vector.
pub fn perp(v: Vec2<f64>) -> Vec2<f64> {
    Vec2::new(-v.y, v.x)
}

/// Perpendicular dot product, the 2D analogue of the cross product.
pub fn perp_dot(a: Vec2<f64>, b: Vec2<f64>) -> f64 {
    a.x * b.y - a.y * b.x
}

/// Clamp a vector to a maximum magnitude.
pub fn clamp_magnitude(v: Vec2<f64>, max: f64) -> Vec2<f64> {
    if v.magnitude_squared() > max * max {
        v.normalized() * max
    } else {
        v
    }
}

/// Convert to a nalgebra vector for parry.
pub(crate) fn to_na(v: Vec2<f64>) -> Vector2<f64> {
    Vector2::new(v.x, v.y)
}

/// Convert to a nalgebra point for parry.
pub(crate) fn to_na_point(v: Vec2<f64>) -> Point2<f64> {
    Point2::new(v.x, v.y)
}

/// Convert a nalgebra point back to a vek vector.
pub(crate) fn from_na_point(p: Point2<f64>) -> Vec2<f64> {
    Vec2::new(p.x, p.y)
}

/// Convert a nalgebra vector back to a vek vector.
pub(crate) fn from_na(v: Vector2<f64>) -> Vec2<f64> {
    Vec2::new(v.x, v.y)
}

/// Position with a rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Iso {
    /// Position before being rotated.
    pub pos: Vec2<f64>,
    /// Rotation.
    pub rot: Rotation,
}

impl Iso {
    /// Construct from a position and a rotation.
    pub fn new<P, R>(pos: P, rot: R) -> Self
    where
        P: Into<Vec2<f64>>,
        R: Into<Rotation>,
    {
        let pos = pos.into();
        let rot = rot.into();

        Self { pos, rot }
    }

    /// Construct from a position with a rotation of zero.
    pub fn from_pos<P>(pos: P) -> Self
    where
        P: Into<Vec2<f64>>,
    {
        let pos = pos.into();
        let rot = Rotation::default();

        Self { pos, rot }
    }

    /// Rotate a relative point and add the position.
    pub fn translate(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.pos + self.rot.rotate(point)
    }

    /// Inverse of [`Iso::translate`], mapping a world point back to a relative one.
    pub fn translate_inv(&self, point: Vec2<f64>) -> Vec2<f64> {
        self.rot.rotate_inv(point - self.pos)
    }

    /// Rotate a direction vector, ignoring the position.
    pub fn rotate(&self, dir: Vec2<f64>) -> Vec2<f64> {
        self.rot.rotate(dir)
    }
}

impl Default for Iso {
    fn default() -> Self {
        Self::from_pos(Vec2::zero())
    }
}

impl From<Iso> for Isometry2<f64> {
    fn from(value: Iso) -> Self {
        Isometry2::new(to_na(value.pos), value.rot.to_radians())
    }
}

/// Rotation split into its sine and cosine parts.
///
/// This allows something to rotate infinitely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    /// Cosine part of the rotation.
    cos: f64,
    /// Sine part of the rotation.
    sin: f64,
}

impl Rotation {
    /// Create from radians.
    pub fn from_radians(rotation: f64) -> Self {
        let (sin, cos) = rotation.sin_cos();

        Self { sin, cos }
    }

    /// Convert to radians in the `(-π, π]` range.
    pub fn to_radians(self) -> f64 {
        self.sin.atan2(self.cos)
    }

    /// Rotate a point.
    pub fn rotate(&self, point: Vec2<f64>) -> Vec2<f64> {
        Vec2::new(
            point.x * self.cos - point.y * self.sin,
            point.x * self.sin + point.y * self.cos,
        )
    }

    /// Rotate a point in the opposite direction.
    pub fn rotate_inv(&self, point: Vec2<f64>) -> Vec2<f64> {
        Vec2::new(
            point.x * self.cos + point.y * self.sin,
            -point.x * self.sin + point.y * self.cos,
        )
    }

    /// Sine.
    pub fn sin(&self) -> f64 {
        self.sin
    }

    /// Cosine.
    pub fn cos(&self) -> f64 {
        self.cos
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Self { cos: 1.0, sin: 0.0 }
    }
}

impl From<f64> for Rotation {
    fn from(value: f64) -> Self {
        Self::from_radians(value)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::Vec2;

    use super::{perp, perp_dot, Iso, Rotation};

    /// Rotating back and forth must round-trip.
    #[test]
    fn test_rotation_roundtrip() {
        let rot = Rotation::from_radians(1.3);
        let point = Vec2::new(-2.0, 5.0);

        let there = rot.rotate(point);
        let back = rot.rotate_inv(there);

        assert_relative_eq!(back.x, point.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, point.y, epsilon = 1e-12);
    }

    /// Translating a point into an isometry and back must round-trip.
    #[test]
    fn test_iso_roundtrip() {
        let iso = Iso::new(Vec2::new(10.0, -3.0), 0.7);
        let point = Vec2::new(1.0, 2.0);

        let world = iso.translate(point);
        let local = iso.translate_inv(world);

        assert_relative_eq!(local.x, point.x, epsilon = 1e-12);
        assert_relative_eq!(local.y, point.y, epsilon = 1e-12);
    }

    /// Perpendicular vectors have a zero dot product and a positive perp dot.
    #[test]
    fn test_perp() {
        let v = Vec2::new(3.0, 1.0);
        let p = perp(v);

        assert_relative_eq!(v.dot(p), 0.0);
        assert!(perp_dot(v, p) > 0.0);
    }
}
