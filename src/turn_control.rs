use crate::error::{DrivetrainError, Result};
use crate::geometry::{closest_equivalent_angle, wrap_angle};
use crate::linear_system::{
    KalmanFilter, LinearQuadraticRegulator, LinearSystem, PlantInversionFeedforward, StateVector,
};
use serde::Deserialize;
use tracing::trace;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnControlMode {
    #[default]
    StateSpace,
    /// Older feedback-only loop, kept for hardware that was tuned against it.
    Feedback,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TurnControlConfig {
    #[serde(default)]
    pub mode: TurnControlMode,
    pub kv: f64,
    pub ka: f64,
    #[serde(default = "default_model_std_devs")]
    pub model_std_devs: [f64; 2],
    #[serde(default = "default_encoder_std_dev")]
    pub encoder_std_dev: f64,
    #[serde(default = "default_state_tolerances")]
    pub state_tolerances: [f64; 2],
    #[serde(default = "default_max_voltage")]
    pub control_tolerance: f64,
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    #[serde(default)]
    pub feedback: FeedbackGains,
}

impl Default for TurnControlConfig {
    fn default() -> Self {
        Self {
            mode: TurnControlMode::default(),
            kv: 0.25,
            ka: 0.007,
            model_std_devs: default_model_std_devs(),
            encoder_std_dev: default_encoder_std_dev(),
            state_tolerances: default_state_tolerances(),
            control_tolerance: default_max_voltage(),
            max_voltage: default_max_voltage(),
            feedback: FeedbackGains::default(),
        }
    }
}

fn default_model_std_devs() -> [f64; 2] {
    [3.0, 3.0]
}

fn default_encoder_std_dev() -> f64 {
    0.01
}

fn default_state_tolerances() -> [f64; 2] {
    [4.0, 4.0]
}

fn default_max_voltage() -> f64 {
    12.0
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FeedbackGains {
    pub kp: f64,
    #[serde(default)]
    pub kd: f64,
}

impl Default for FeedbackGains {
    fn default() -> Self {
        Self { kp: 3.5, kd: 0.0 }
    }
}

/// Estimated steering axis state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TurnAxisState {
    pub angle: f64,
    pub angular_velocity: f64,
}

/// Kalman observer plus LQR on the steering axis.
#[derive(Debug, Clone)]
pub struct KalmanTurnControl {
    observer: KalmanFilter,
    regulator: LinearQuadraticRegulator,
    feedforward: PlantInversionFeedforward,
    target: f64,
    reference: StateVector,
    max_voltage: f64,
    initialized: bool,
}

impl KalmanTurnControl {
    pub fn new(config: &TurnControlConfig, dt: f64) -> Result<Self> {
        let model = LinearSystem::identify_position_system(config.kv, config.ka)?;
        let observer =
            KalmanFilter::new(&model, config.model_std_devs, config.encoder_std_dev, dt)?;
        let regulator = LinearQuadraticRegulator::new(
            observer.system(),
            config.state_tolerances,
            config.control_tolerance,
        )?;
        let feedforward = PlantInversionFeedforward::new(observer.system());
        Ok(Self {
            observer,
            regulator,
            feedforward,
            target: 0.0,
            reference: StateVector::zeros(),
            max_voltage: checked_max_voltage(config.max_voltage)?,
            initialized: false,
        })
    }

    pub fn set_target(&mut self, angle: f64) {
        self.target = angle;
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn estimate(&self) -> TurnAxisState {
        let x_hat = self.observer.x_hat();
        TurnAxisState {
            angle: x_hat[0],
            angular_velocity: x_hat[1],
        }
    }

    pub fn observer(&self) -> &KalmanFilter {
        &self.observer
    }

    /// Re-seed the estimate at `angle` and hold that angle.
    pub fn reset(&mut self, angle: f64) {
        self.seed(angle);
        self.target = angle;
    }

    fn seed(&mut self, angle: f64) {
        self.observer.reset(StateVector::new(angle, 0.0));
        self.reference = StateVector::new(angle, 0.0);
        self.initialized = true;
    }

    /// One control tick: correct, regulate, predict. Returns the voltage to apply.
    ///
    /// `measured_angle` may be wrapped; it is unwrapped against the estimate.
    /// `None` skips the correction and runs on the model alone.
    pub fn calculate(&mut self, measured_angle: Option<f64>) -> f64 {
        let measured_angle = measured_angle.filter(|angle| angle.is_finite());
        if !self.initialized {
            if let Some(angle) = measured_angle {
                self.seed(angle);
            }
        }

        if let Some(angle) = measured_angle {
            let continuous = closest_equivalent_angle(self.observer.x_hat()[0], angle);
            self.observer.correct(continuous);
        }

        let estimate = *self.observer.x_hat();
        let next_reference =
            StateVector::new(closest_equivalent_angle(estimate[0], self.target), 0.0);
        // the reference only jumps when the target moved, keep feedforward from
        // reacting to the unwrap itself
        let reference = StateVector::new(
            closest_equivalent_angle(next_reference[0], self.reference[0]),
            self.reference[1],
        );
        let unclamped = self.regulator.calculate(&estimate, &next_reference)
            + self.feedforward.calculate(&reference, &next_reference);
        let voltage = clamp_voltage(unclamped, self.max_voltage);

        self.observer.predict(voltage);
        self.reference = next_reference;
        voltage
    }
}

/// Proportional/derivative steering loop on the wrapped angle error.
#[derive(Debug, Clone)]
pub struct FeedbackTurnControl {
    gains: FeedbackGains,
    max_voltage: f64,
    dt: f64,
    target: f64,
    last_angle: Option<f64>,
    last_error: Option<f64>,
}

impl FeedbackTurnControl {
    pub fn new(config: &TurnControlConfig, dt: f64) -> Result<Self> {
        Ok(Self {
            gains: config.feedback,
            max_voltage: checked_max_voltage(config.max_voltage)?,
            dt,
            target: 0.0,
            last_angle: None,
            last_error: None,
        })
    }

    pub fn set_target(&mut self, angle: f64) {
        self.target = angle;
    }

    pub fn reset(&mut self, angle: f64) {
        self.target = angle;
        self.last_angle = Some(angle);
        self.last_error = None;
    }

    pub fn calculate(&mut self, measured_angle: Option<f64>) -> f64 {
        let angle = match measured_angle.filter(|angle| angle.is_finite()) {
            Some(angle) => {
                self.last_angle = Some(angle);
                angle
            }
            None => match self.last_angle {
                Some(angle) => angle,
                None => return 0.0,
            },
        };
        let error = wrap_angle(self.target - angle);
        let derivative = self
            .last_error
            .map(|last| (error - last) / self.dt)
            .unwrap_or_default();
        self.last_error = Some(error);
        clamp_voltage(
            self.gains.kp * error + self.gains.kd * derivative,
            self.max_voltage,
        )
    }
}

/// Steering controller selected by configuration.
#[derive(Debug, Clone)]
pub enum TurnControl {
    StateSpace(Box<KalmanTurnControl>),
    Feedback(FeedbackTurnControl),
}

impl TurnControl {
    pub fn from_config(config: &TurnControlConfig, dt: f64) -> Result<Self> {
        Ok(match config.mode {
            TurnControlMode::StateSpace => {
                TurnControl::StateSpace(Box::new(KalmanTurnControl::new(config, dt)?))
            }
            TurnControlMode::Feedback => {
                TurnControl::Feedback(FeedbackTurnControl::new(config, dt)?)
            }
        })
    }

    pub fn set_target(&mut self, angle: f64) {
        match self {
            TurnControl::StateSpace(control) => control.set_target(angle),
            TurnControl::Feedback(control) => control.set_target(angle),
        }
    }

    pub fn reset(&mut self, angle: f64) {
        match self {
            TurnControl::StateSpace(control) => control.reset(angle),
            TurnControl::Feedback(control) => control.reset(angle),
        }
    }

    pub fn calculate(&mut self, measured_angle: Option<f64>) -> f64 {
        match self {
            TurnControl::StateSpace(control) => control.calculate(measured_angle),
            TurnControl::Feedback(control) => control.calculate(measured_angle),
        }
    }

    /// Estimated axis state, only available for the state space loop.
    pub fn estimate(&self) -> Option<TurnAxisState> {
        match self {
            TurnControl::StateSpace(control) => Some(control.estimate()),
            TurnControl::Feedback(_) => None,
        }
    }
}

fn checked_max_voltage(max_voltage: f64) -> Result<f64> {
    if max_voltage > 0.0 && max_voltage.is_finite() {
        Ok(max_voltage)
    } else {
        Err(DrivetrainError::configuration(format!(
            "max voltage must be positive, got {max_voltage}"
        )))
    }
}

pub(crate) fn clamp_voltage(voltage: f64, max_voltage: f64) -> f64 {
    let clamped = voltage.clamp(-max_voltage, max_voltage);
    if clamped != voltage {
        trace!(requested = voltage, applied = clamped, "voltage saturated");
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear_system::DiscreteSystem;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const DT: f64 = 0.02;

    fn test_config(mode: TurnControlMode) -> TurnControlConfig {
        TurnControlConfig {
            mode,
            ..Default::default()
        }
    }

    fn plant() -> DiscreteSystem {
        LinearSystem::identify_position_system(0.25, 0.007)
            .unwrap()
            .discretize(DT)
    }

    fn simulate(control: &mut TurnControl, start: f64, ticks: usize) -> StateVector {
        let plant = plant();
        let mut x = StateVector::new(start, 0.0);
        for _ in 0..ticks {
            let u = control.calculate(Some(wrap_angle(x[0])));
            assert!(u.abs() <= 12.0);
            x = plant.step(&x, u);
        }
        x
    }

    #[test]
    fn state_space_loop_reaches_target() {
        let mut control =
            TurnControl::from_config(&test_config(TurnControlMode::StateSpace), DT).unwrap();
        control.set_target(1.0);
        // slowest closed loop pole is near 1/s with the default tolerances
        let x = simulate(&mut control, 0.0, 150);
        assert!(x[0] > 0.9 && x[0] < 1.0, "angle after 3 s {}", x[0]);
        let x = simulate(&mut control, x[0], 250);
        assert_relative_eq!(x[0], 1.0, epsilon = 0.01);
        assert_relative_eq!(x[1], 0.0, epsilon = 0.05);
    }

    #[test]
    fn tighter_angle_tolerance_settles_faster() {
        let mut config = test_config(TurnControlMode::StateSpace);
        config.state_tolerances = [0.2, 4.0];
        let mut control = TurnControl::from_config(&config, DT).unwrap();
        control.set_target(0.1);
        let x = simulate(&mut control, 0.0, 150);
        assert_relative_eq!(x[0], 0.1, epsilon = 1e-3);
    }

    #[test]
    fn state_space_loop_takes_short_way_across_seam() {
        let mut control =
            TurnControl::from_config(&test_config(TurnControlMode::StateSpace), DT).unwrap();
        control.set_target(wrap_angle(PI - 0.1 + 0.2));
        let x = simulate(&mut control, PI - 0.1, 400);
        // continuous state ends just past PI instead of turning all the way around
        assert_relative_eq!(x[0], PI + 0.1, epsilon = 0.01);
    }

    #[test]
    fn missing_measurement_still_predicts() {
        let mut control = KalmanTurnControl::new(&test_config(TurnControlMode::StateSpace), DT)
            .unwrap();
        control.reset(0.0);
        control.set_target(1.0);
        let covariance_before = control.observer().covariance()[(0, 0)];
        let voltage = control.calculate(None);
        assert!(voltage > 0.0);
        assert!(control.estimate().angular_velocity > 0.0);
        assert!(control.observer().covariance()[(0, 0)] > covariance_before);
    }

    #[test]
    fn output_is_clamped() {
        let mut config = test_config(TurnControlMode::StateSpace);
        config.max_voltage = 1.0;
        let mut control = KalmanTurnControl::new(&config, DT).unwrap();
        control.reset(0.0);
        // a 3 rad error asks for about 1.45 V with the default gains
        control.set_target(3.0);
        assert_relative_eq!(control.calculate(Some(0.0)), 1.0);
        control.reset(0.0);
        control.set_target(-3.0);
        assert_relative_eq!(control.calculate(Some(0.0)), -1.0);
    }

    #[test]
    fn feedback_loop_reaches_target() {
        let mut control =
            TurnControl::from_config(&test_config(TurnControlMode::Feedback), DT).unwrap();
        control.set_target(-0.5);
        let x = simulate(&mut control, 0.0, 300);
        assert_relative_eq!(x[0], -0.5, epsilon = 0.02);
        assert!(control.estimate().is_none());
    }

    #[test]
    fn feedback_loop_without_any_reading_is_idle() {
        let mut control = FeedbackTurnControl::new(&test_config(TurnControlMode::Feedback), DT)
            .unwrap();
        control.set_target(1.0);
        assert_eq!(control.calculate(None), 0.0);
    }

    #[test]
    fn non_positive_voltage_limit_is_rejected() {
        let mut config = test_config(TurnControlMode::StateSpace);
        config.max_voltage = 0.0;
        assert!(KalmanTurnControl::new(&config, DT).is_err());
    }
}
