use crate::error::{DrivetrainError, Result};
use crate::turn_control::clamp_voltage;
use serde::Deserialize;

/// Wheel speed loop constants. Speeds are in m/s at the wheel surface.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct DriveControlConfig {
    /// static friction voltage
    #[serde(default)]
    pub ks: f64,
    /// volts per m/s
    pub kv: f64,
    /// volts per m/s²
    #[serde(default)]
    pub ka: f64,
    /// volts per m/s of speed error
    #[serde(default)]
    pub kp: f64,
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
}

fn default_max_voltage() -> f64 {
    12.0
}

impl Default for DriveControlConfig {
    fn default() -> Self {
        Self {
            ks: 0.1,
            kv: 2.5,
            ka: 0.3,
            kp: 1.2,
            max_voltage: default_max_voltage(),
        }
    }
}

/// Feedforward plus proportional feedback on wheel speed.
#[derive(Debug, Clone)]
pub struct DriveControl {
    config: DriveControlConfig,
    dt: f64,
    target: f64,
    last_target: f64,
}

impl DriveControl {
    pub fn new(config: DriveControlConfig, dt: f64) -> Result<Self> {
        if !(config.max_voltage > 0.0 && config.max_voltage.is_finite()) {
            return Err(DrivetrainError::configuration(
                "drive max voltage must be positive",
            ));
        }
        if [config.ks, config.kv, config.ka, config.kp]
            .iter()
            .any(|gain| !gain.is_finite() || *gain < 0.0)
        {
            return Err(DrivetrainError::configuration(
                "drive gains must be finite and non-negative",
            ));
        }
        Ok(Self {
            config,
            dt,
            target: 0.0,
            last_target: 0.0,
        })
    }

    pub fn set_target(&mut self, speed: f64) {
        self.target = speed;
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn feedforward(&self, speed: f64, acceleration: f64) -> f64 {
        let static_friction = if speed == 0.0 {
            0.0
        } else {
            self.config.ks * speed.signum()
        };
        static_friction + self.config.kv * speed + self.config.ka * acceleration
    }

    /// Voltage for this tick. Without a speed reading only the feedforward is applied.
    pub fn calculate(&mut self, measured_speed: Option<f64>) -> f64 {
        let acceleration = (self.target - self.last_target) / self.dt;
        self.last_target = self.target;
        let feedback = measured_speed
            .filter(|speed| speed.is_finite())
            .map(|speed| self.config.kp * (self.target - speed))
            .unwrap_or_default();
        clamp_voltage(
            self.feedforward(self.target, acceleration) + feedback,
            self.config.max_voltage,
        )
    }

    pub fn reset(&mut self) {
        self.target = 0.0;
        self.last_target = 0.0;
    }
}
