//! Two-state, single-input, single-output linear system tooling.
//!
//! The turn axis of a swerve module is modelled as a position system
//! `x = [angle, angular_velocity]` driven by motor voltage and observed
//! through an angle encoder. This module provides discretization, a
//! Kalman observer and a discrete LQR for that shape of system.

use crate::error::{DrivetrainError, Result};
use nalgebra as na;

pub type StateVector = na::Vector2<f64>;
pub type StateMatrix = na::Matrix2<f64>;
pub type InputVector = na::Vector2<f64>;
pub type OutputRow = na::RowVector2<f64>;

const DARE_MAX_ITERATIONS: usize = 100_000;
const DARE_TOLERANCE: f64 = 1e-10;

/// Continuous time model `dx/dt = A x + B u`, `y = C x`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSystem {
    pub a: StateMatrix,
    pub b: InputVector,
    pub c: OutputRow,
}

impl LinearSystem {
    /// Position system from motor feedforward constants.
    ///
    /// `kv` in volts per (rad/s), `ka` in volts per (rad/s²).
    pub fn identify_position_system(kv: f64, ka: f64) -> Result<Self> {
        if !(kv >= 0.0 && kv.is_finite()) {
            return Err(DrivetrainError::configuration(format!(
                "kv must be non-negative, got {kv}"
            )));
        }
        if !(ka > 0.0 && ka.is_finite()) {
            return Err(DrivetrainError::configuration(format!(
                "ka must be positive, got {ka}"
            )));
        }
        Ok(Self {
            a: StateMatrix::new(0.0, 1.0, 0.0, -kv / ka),
            b: InputVector::new(0.0, 1.0 / ka),
            c: OutputRow::new(1.0, 0.0),
        })
    }

    /// Zero order hold discretization over `dt` seconds.
    pub fn discretize(&self, dt: f64) -> DiscreteSystem {
        let mut augmented = na::Matrix3::<f64>::zeros();
        augmented.fixed_view_mut::<2, 2>(0, 0).copy_from(&self.a);
        augmented.fixed_view_mut::<2, 1>(0, 2).copy_from(&self.b);
        let phi = (augmented * dt).exp();
        DiscreteSystem {
            a: phi.fixed_view::<2, 2>(0, 0).into_owned(),
            b: phi.fixed_view::<2, 1>(0, 2).into_owned(),
            c: self.c,
            dt,
        }
    }

    /// Discretize continuous process noise with Van Loan's method.
    pub fn discretize_process_noise(&self, q: &StateMatrix, dt: f64) -> StateMatrix {
        let mut van_loan = na::Matrix4::<f64>::zeros();
        van_loan.fixed_view_mut::<2, 2>(0, 0).copy_from(&(-self.a));
        van_loan.fixed_view_mut::<2, 2>(0, 2).copy_from(q);
        van_loan
            .fixed_view_mut::<2, 2>(2, 2)
            .copy_from(&self.a.transpose());
        let phi = (van_loan * dt).exp();
        let phi12 = phi.fixed_view::<2, 2>(0, 2).into_owned();
        let phi22 = phi.fixed_view::<2, 2>(2, 2).into_owned();
        let discrete = phi22.transpose() * phi12;
        (discrete + discrete.transpose()) * 0.5
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteSystem {
    pub a: StateMatrix,
    pub b: InputVector,
    pub c: OutputRow,
    pub dt: f64,
}

impl DiscreteSystem {
    pub fn step(&self, x: &StateVector, u: f64) -> StateVector {
        self.a * x + self.b * u
    }

    pub fn output(&self, x: &StateVector) -> f64 {
        (self.c * x)[0]
    }
}

/// Diagonal covariance from standard deviations.
pub fn covariance_from_std_devs(std_devs: [f64; 2]) -> StateMatrix {
    StateMatrix::from_diagonal(&na::Vector2::new(
        std_devs[0] * std_devs[0],
        std_devs[1] * std_devs[1],
    ))
}

/// Bryson's rule cost matrix: each state weighted by `1 / tolerance²`.
pub fn cost_from_tolerances(tolerances: [f64; 2]) -> Result<StateMatrix> {
    if tolerances.iter().any(|t| !(*t > 0.0 && t.is_finite())) {
        return Err(DrivetrainError::configuration(
            "LQR state tolerances must be positive",
        ));
    }
    Ok(StateMatrix::from_diagonal(&na::Vector2::new(
        1.0 / (tolerances[0] * tolerances[0]),
        1.0 / (tolerances[1] * tolerances[1]),
    )))
}

/// Solve the discrete algebraic Riccati equation
/// `X = Aᵀ X A − Aᵀ X B (Bᵀ X B + R)⁻¹ Bᵀ X A + Q` by fixed point iteration.
pub fn solve_dare(
    a: &StateMatrix,
    b: &InputVector,
    q: &StateMatrix,
    r: f64,
) -> Result<StateMatrix> {
    let mut x = *q;
    for _ in 0..DARE_MAX_ITERATIONS {
        let btxb = (b.transpose() * x * b)[0] + r;
        if btxb.abs() < f64::EPSILON {
            break;
        }
        let atxb = a.transpose() * x * b;
        let next = a.transpose() * x * a - atxb * atxb.transpose() / btxb + q;
        let next = (next + next.transpose()) * 0.5;
        let change = (next - x).norm();
        x = next;
        if change <= DARE_TOLERANCE * (1.0 + x.norm()) {
            return Ok(x);
        }
    }
    Err(DrivetrainError::configuration(
        "riccati iteration did not converge, check model constants",
    ))
}

/// Discrete linear quadratic regulator with a fixed gain.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearQuadraticRegulator {
    gain: OutputRow,
}

impl LinearQuadraticRegulator {
    /// `state_tolerances` and `control_tolerance` follow Bryson's rule.
    pub fn new(
        system: &DiscreteSystem,
        state_tolerances: [f64; 2],
        control_tolerance: f64,
    ) -> Result<Self> {
        if !(control_tolerance > 0.0 && control_tolerance.is_finite()) {
            return Err(DrivetrainError::configuration(
                "LQR control tolerance must be positive",
            ));
        }
        let q = cost_from_tolerances(state_tolerances)?;
        let r = 1.0 / (control_tolerance * control_tolerance);
        let s = solve_dare(&system.a, &system.b, &q, r)?;
        let btsb = (system.b.transpose() * s * system.b)[0] + r;
        let gain = system.b.transpose() * s * system.a / btsb;
        Ok(Self { gain })
    }

    pub fn gain(&self) -> &OutputRow {
        &self.gain
    }

    /// Control effort pushing `x` toward `reference`.
    pub fn calculate(&self, x: &StateVector, reference: &StateVector) -> f64 {
        (self.gain * (reference - x))[0]
    }
}

/// Feedforward that inverts the discrete plant: `u = B⁺ (r_next − A r)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlantInversionFeedforward {
    a: StateMatrix,
    b_pseudo_inverse: OutputRow,
}

impl PlantInversionFeedforward {
    pub fn new(system: &DiscreteSystem) -> Self {
        let norm = system.b.norm_squared();
        let b_pseudo_inverse = if norm > 0.0 {
            system.b.transpose() / norm
        } else {
            OutputRow::zeros()
        };
        Self {
            a: system.a,
            b_pseudo_inverse,
        }
    }

    pub fn calculate(&self, reference: &StateVector, next_reference: &StateVector) -> f64 {
        (self.b_pseudo_inverse * (next_reference - self.a * reference))[0]
    }
}

/// Kalman observer for the two-state system.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    system: DiscreteSystem,
    process_noise: StateMatrix,
    measurement_noise: f64,
    x_hat: StateVector,
    covariance: StateMatrix,
    initial_covariance: StateMatrix,
}

impl KalmanFilter {
    /// `state_std_devs` is the trust in the model, `measurement_std_dev` the trust in the sensor.
    pub fn new(
        continuous: &LinearSystem,
        state_std_devs: [f64; 2],
        measurement_std_dev: f64,
        dt: f64,
    ) -> Result<Self> {
        if !(measurement_std_dev > 0.0 && measurement_std_dev.is_finite()) {
            return Err(DrivetrainError::configuration(
                "measurement standard deviation must be positive",
            ));
        }
        let system = continuous.discretize(dt);
        let process_noise = continuous
            .discretize_process_noise(&covariance_from_std_devs(state_std_devs), dt);
        let measurement_noise = measurement_std_dev * measurement_std_dev / dt;
        // observer riccati equation is the dual of the regulator one
        let initial_covariance = solve_dare(
            &system.a.transpose(),
            &system.c.transpose(),
            &process_noise,
            measurement_noise,
        )?;
        Ok(Self {
            system,
            process_noise,
            measurement_noise,
            x_hat: StateVector::zeros(),
            covariance: initial_covariance,
            initial_covariance,
        })
    }

    pub fn x_hat(&self) -> &StateVector {
        &self.x_hat
    }

    pub fn covariance(&self) -> &StateMatrix {
        &self.covariance
    }

    pub fn system(&self) -> &DiscreteSystem {
        &self.system
    }

    pub fn set_x_hat(&mut self, x_hat: StateVector) {
        self.x_hat = x_hat;
    }

    pub fn reset(&mut self, x_hat: StateVector) {
        self.x_hat = x_hat;
        self.covariance = self.initial_covariance;
    }

    /// Fuse a measurement into the estimate.
    pub fn correct(&mut self, measurement: f64) {
        let c = self.system.c;
        let innovation_covariance =
            (c * self.covariance * c.transpose())[0] + self.measurement_noise;
        let gain = self.covariance * c.transpose() / innovation_covariance;
        let residual = measurement - self.system.output(&self.x_hat);
        self.x_hat += gain * residual;
        // joseph form keeps the covariance symmetric positive definite
        let i_kc = StateMatrix::identity() - gain * c;
        self.covariance = i_kc * self.covariance * i_kc.transpose()
            + gain * gain.transpose() * self.measurement_noise;
    }

    /// Project the estimate one tick ahead under input `u`.
    pub fn predict(&mut self, u: f64) {
        self.x_hat = self.system.step(&self.x_hat, u);
        self.covariance = self.system.a * self.covariance * self.system.a.transpose()
            + self.process_noise;
    }
}
