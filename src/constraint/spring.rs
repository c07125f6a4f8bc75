use vek::Vec2;

use crate::body::Body;

use super::{
    solver::{apply_impulses, k_scalar, normal_relative_velocity},
    ConstraintKind,
};

/// Custom spring force as a function of the anchor distance.
pub type SpringForceFn = Box<dyn Fn(f64) -> f64>;

/// Custom spring torque as a function of the relative angle.
pub type SpringTorqueFn = Box<dyn Fn(f64) -> f64>;

/// Damped linear spring between two anchor points.
///
/// Unlike the joints a spring applies its full force during the prestep and
/// only solves the damping term iteratively, so it never warm starts.
pub struct DampedSpring {
    /// Anchor on the first body, in body-local coordinates.
    pub anchor_a: Vec2<f64>,
    /// Anchor on the second body, in body-local coordinates.
    pub anchor_b: Vec2<f64>,
    /// Distance at which the spring applies no force.
    pub rest_length: f64,
    /// Spring constant.
    pub stiffness: f64,
    /// Damping coefficient.
    pub damping: f64,
    /// Custom force curve, linear when unset.
    pub force_func: Option<SpringForceFn>,

    /// Damping target velocity, updated every iteration.
    target_vrn: f64,
    /// Fraction of the velocity error the damping removes.
    v_coef: f64,
    /// World offset of the first anchor from its body center.
    r1: Vec2<f64>,
    /// World offset of the second anchor from its body center.
    r2: Vec2<f64>,
    /// Effective mass along the spring axis.
    n_mass: f64,
    /// Spring axis.
    n: Vec2<f64>,
    /// Accumulated impulse.
    j_acc: f64,
}

impl DampedSpring {
    /// Connect two bodies with a damped spring.
    pub fn new(
        anchor_a: Vec2<f64>,
        anchor_b: Vec2<f64>,
        rest_length: f64,
        stiffness: f64,
        damping: f64,
    ) -> Self {
        Self {
            anchor_a,
            anchor_b,
            rest_length,
            stiffness,
            damping,
            force_func: None,
            target_vrn: 0.0,
            v_coef: 0.0,
            r1: Vec2::zero(),
            r2: Vec2::zero(),
            n_mass: 0.0,
            n: Vec2::zero(),
            j_acc: 0.0,
        }
    }

    /// Spring force at a distance between the anchors.
    fn force(&self, dist: f64) -> f64 {
        match &self.force_func {
            Some(force_func) => force_func(dist),
            None => (self.rest_length - dist) * self.stiffness,
        }
    }

    pub(crate) fn prestep(&mut self, a: &mut Body, b: &mut Body, dt: f64) {
        self.r1 = a.transform.vect(self.anchor_a - a.cog);
        self.r2 = b.transform.vect(self.anchor_b - b.cog);

        let delta = (b.p + self.r2) - (a.p + self.r1);
        let dist = delta.magnitude();
        self.n = delta * (if dist != 0.0 { dist } else { f64::INFINITY }).recip();

        let k = k_scalar(a, b, self.r1, self.r2, self.n);
        self.n_mass = k.recip();

        self.target_vrn = 0.0;
        self.v_coef = 1.0 - (-self.damping * dt * k).exp();

        // Apply the full spring force immediately.
        self.j_acc = self.force(dist) * dt;
        apply_impulses(a, b, self.r1, self.r2, self.n * self.j_acc);
    }

    pub(crate) fn apply_impulse(&mut self, a: &mut Body, b: &mut Body) {
        let vrn = normal_relative_velocity(a, b, self.r1, self.r2, self.n);

        // Remove a fraction of the relative velocity per iteration.
        let v_damp = (self.target_vrn - vrn) * self.v_coef;
        self.target_vrn = vrn + v_damp;

        let j_damp = v_damp * self.n_mass;
        self.j_acc += j_damp;

        apply_impulses(a, b, self.r1, self.r2, self.n * j_damp);
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc
    }
}

impl From<DampedSpring> for ConstraintKind {
    fn from(spring: DampedSpring) -> Self {
        ConstraintKind::DampedSpring(spring)
    }
}

/// Damped angular spring between two bodies.
pub struct DampedRotarySpring {
    /// Relative angle at which the spring applies no torque.
    pub rest_angle: f64,
    /// Spring constant.
    pub stiffness: f64,
    /// Damping coefficient.
    pub damping: f64,
    /// Custom torque curve, linear when unset.
    pub torque_func: Option<SpringTorqueFn>,

    /// Damping target angular velocity, updated every iteration.
    target_wrn: f64,
    /// Fraction of the angular velocity error the damping removes.
    w_coef: f64,
    /// Effective angular mass.
    i_sum: f64,
    /// Accumulated impulse.
    j_acc: f64,
}

impl DampedRotarySpring {
    /// Connect two bodies with a damped angular spring.
    pub fn new(rest_angle: f64, stiffness: f64, damping: f64) -> Self {
        Self {
            rest_angle,
            stiffness,
            damping,
            torque_func: None,
            target_wrn: 0.0,
            w_coef: 0.0,
            i_sum: 0.0,
            j_acc: 0.0,
        }
    }

    /// Spring torque at a relative angle.
    fn torque(&self, relative_angle: f64) -> f64 {
        match &self.torque_func {
            Some(torque_func) => torque_func(relative_angle),
            None => (relative_angle - self.rest_angle) * self.stiffness,
        }
    }

    pub(crate) fn prestep(&mut self, a: &mut Body, b: &mut Body, dt: f64) {
        let i_inv_sum = a.i_inv + b.i_inv;
        debug_assert!(i_inv_sum != 0.0, "Unsolvable spring between two immovable bodies");

        self.i_sum = i_inv_sum.recip();
        self.w_coef = 1.0 - (-self.damping * dt * i_inv_sum).exp();
        self.target_wrn = 0.0;

        // Apply the full spring torque immediately.
        let j_spring = self.torque(a.a - b.a) * dt;
        self.j_acc = j_spring;

        a.w -= j_spring * a.i_inv;
        b.w += j_spring * b.i_inv;
    }

    pub(crate) fn apply_impulse(&mut self, a: &mut Body, b: &mut Body) {
        let wrn = a.w - b.w;

        // Remove a fraction of the relative angular velocity per iteration.
        let w_damp = (self.target_wrn - wrn) * self.w_coef;
        self.target_wrn = wrn + w_damp;

        let j_damp = w_damp * self.i_sum;
        self.j_acc += j_damp;

        a.w += j_damp * a.i_inv;
        b.w -= j_damp * b.i_inv;
    }

    pub(crate) fn impulse(&self) -> f64 {
        self.j_acc
    }
}

impl From<DampedRotarySpring> for ConstraintKind {
    fn from(spring: DampedRotarySpring) -> Self {
        ConstraintKind::DampedRotarySpring(spring)
    }
}
