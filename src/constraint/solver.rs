//! Shared building blocks of the sequential impulse solver.

use vek::Vec2;

use crate::{
    body::Body,
    math::{perp, perp_dot},
};

/// Velocity of the second body relative to the first at a pair of offsets.
#[inline]
pub(crate) fn relative_velocity(a: &Body, b: &Body, r1: Vec2<f64>, r2: Vec2<f64>) -> Vec2<f64> {
    (b.v + perp(r2) * b.w) - (a.v + perp(r1) * a.w)
}

/// Relative velocity projected on a normal.
#[inline]
pub(crate) fn normal_relative_velocity(
    a: &Body,
    b: &Body,
    r1: Vec2<f64>,
    r2: Vec2<f64>,
    n: Vec2<f64>,
) -> f64 {
    relative_velocity(a, b, r1, r2).dot(n)
}

/// Apply equal and opposite impulses at a pair of offsets.
#[inline]
pub(crate) fn apply_impulses(a: &mut Body, b: &mut Body, r1: Vec2<f64>, r2: Vec2<f64>, j: Vec2<f64>) {
    a.apply_impulse(-j, r1);
    b.apply_impulse(j, r2);
}

/// Apply equal and opposite positional correction impulses.
#[inline]
pub(crate) fn apply_bias_impulses(
    a: &mut Body,
    b: &mut Body,
    r1: Vec2<f64>,
    r2: Vec2<f64>,
    j: Vec2<f64>,
) {
    a.apply_bias_impulse(-j, r1);
    b.apply_bias_impulse(j, r2);
}

/// Effective inverse mass of a single body along a direction.
#[inline]
fn k_scalar_body(body: &Body, r: Vec2<f64>, n: Vec2<f64>) -> f64 {
    let rcn = perp_dot(r, n);

    body.m_inv + body.i_inv * rcn * rcn
}

/// Effective inverse mass of a body pair along a direction.
#[inline]
pub(crate) fn k_scalar(a: &Body, b: &Body, r1: Vec2<f64>, r2: Vec2<f64>, n: Vec2<f64>) -> f64 {
    let value = k_scalar_body(a, r1, n) + k_scalar_body(b, r2, n);
    debug_assert!(value != 0.0, "Unsolvable constraint between two immovable bodies");

    value
}

/// Column-major 2x2 matrix for the planar effective mass.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Mat2x2 {
    pub(crate) a: f64,
    pub(crate) b: f64,
    pub(crate) c: f64,
    pub(crate) d: f64,
}

impl Mat2x2 {
    /// Multiply a vector by the matrix.
    #[inline]
    pub(crate) fn transform(&self, v: Vec2<f64>) -> Vec2<f64> {
        Vec2::new(self.a * v.x + self.b * v.y, self.c * v.x + self.d * v.y)
    }
}

/// Inverted effective mass tensor of a body pair, for constraints that remove
/// both translational degrees of freedom.
pub(crate) fn k_tensor(a: &Body, b: &Body, r1: Vec2<f64>, r2: Vec2<f64>) -> Mat2x2 {
    let m_sum = a.m_inv + b.m_inv;

    let mut k11 = m_sum;
    let mut k12 = 0.0;
    let mut k21 = 0.0;
    let mut k22 = m_sum;

    // Influence of the first body's rotation.
    let a_i_inv = a.i_inv;
    k11 += a_i_inv * r1.y * r1.y;
    k12 += -a_i_inv * r1.x * r1.y;
    k21 += -a_i_inv * r1.x * r1.y;
    k22 += a_i_inv * r1.x * r1.x;

    // Influence of the second body's rotation.
    let b_i_inv = b.i_inv;
    k11 += b_i_inv * r2.y * r2.y;
    k12 += -b_i_inv * r2.x * r2.y;
    k21 += -b_i_inv * r2.x * r2.y;
    k22 += b_i_inv * r2.x * r2.x;

    let det = k11 * k22 - k12 * k21;
    debug_assert!(det != 0.0, "Unsolvable constraint between two immovable bodies");

    let det_inv = det.recip();
    Mat2x2 {
        a: k22 * det_inv,
        b: -k12 * det_inv,
        c: -k21 * det_inv,
        d: k11 * det_inv,
    }
}

/// Fraction of the positional error corrected this step.
#[inline]
pub(crate) fn bias_coef(error_bias: f64, dt: f64) -> f64 {
    1.0 - error_bias.powf(dt)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use vek::Vec2;

    use crate::body::Body;

    use super::{apply_impulses, k_scalar, k_tensor, relative_velocity};

    /// Opposite impulses conserve momentum between two bodies.
    #[test]
    fn test_momentum_conservation() {
        let mut a = Body::new(2.0, 1.0);
        let mut b = Body::new(3.0, 1.0);

        apply_impulses(
            &mut a,
            &mut b,
            Vec2::zero(),
            Vec2::zero(),
            Vec2::new(6.0, 0.0),
        );

        let momentum = a.velocity() * 2.0 + b.velocity() * 3.0;
        assert_relative_eq!(momentum.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(momentum.y, 0.0, epsilon = 1e-12);
    }

    /// The scalar effective mass of two unit masses at their centers is the
    /// sum of the inverse masses.
    #[test]
    fn test_k_scalar() {
        let a = Body::new(2.0, 1.0);
        let b = Body::new(4.0, 1.0);

        let k = k_scalar(&a, &b, Vec2::zero(), Vec2::zero(), Vec2::unit_x());
        assert_relative_eq!(k, 0.5 + 0.25);
    }

    /// The tensor reduces to a diagonal inverse mass without offsets.
    #[test]
    fn test_k_tensor() {
        let a = Body::new(2.0, 1.0);
        let b = Body::new(2.0, 1.0);

        let k = k_tensor(&a, &b, Vec2::zero(), Vec2::zero());
        let j = k.transform(Vec2::new(1.0, 0.0));
        assert_relative_eq!(j.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(j.y, 0.0, epsilon = 1e-12);
    }

    /// Relative velocity includes the rotational part at the offsets.
    #[test]
    fn test_relative_velocity() {
        let a = Body::new(1.0, 1.0);
        let mut b = Body::new(1.0, 1.0);
        b.set_angular_velocity(2.0);

        let vr = relative_velocity(&a, &b, Vec2::zero(), Vec2::new(1.0, 0.0));
        assert_relative_eq!(vr.y, 2.0, epsilon = 1e-12);
    }
}
