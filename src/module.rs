use crate::drive_control::{DriveControl, DriveControlConfig};
use crate::driver::{ModuleIo, ModuleMeasurement, ModuleOutput};
use crate::error::{DrivetrainError, Result};
use crate::geometry::{closest_equivalent_angle, wrap_angle};
use crate::kinematics::ModuleState;
use crate::turn_control::{TurnAxisState, TurnControl, TurnControlConfig};
use nalgebra as na;
use serde::Deserialize;
use tracing::*;

#[derive(Deserialize, Debug, Clone)]
pub struct ModuleConfig {
    pub id: String,
    /// meters from the chassis center, x forward and y left
    pub location: [f64; 2],
    /// encoder reading when the wheel points forward
    #[serde(default)]
    pub angle_offset_degrees: f64,
    #[serde(default)]
    pub drive_inverted: bool,
    /// address on the serial module bus
    #[serde(default)]
    pub bus_index: Option<u8>,
}

impl ModuleConfig {
    pub fn location(&self) -> na::Vector2<f64> {
        na::Vector2::new(self.location[0], self.location[1])
    }

    pub fn angle_offset(&self) -> f64 {
        self.angle_offset_degrees.to_radians()
    }
}

/// One steerable wheel: sensors, target and both axis controllers.
pub struct SwerveModule {
    id: String,
    location: na::Vector2<f64>,
    angle_offset: f64,
    drive_inverted: bool,
    io: Box<dyn ModuleIo>,
    turn: TurnControl,
    drive: DriveControl,
    state: ModuleState,
    target: ModuleState,
    measurement: Option<ModuleMeasurement>,
    sampled_once: bool,
    degraded: bool,
    last_output: ModuleOutput,
}

impl SwerveModule {
    pub fn new(
        config: &ModuleConfig,
        io: Box<dyn ModuleIo>,
        turn_config: &TurnControlConfig,
        drive_config: &DriveControlConfig,
        dt: f64,
    ) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            location: config.location(),
            angle_offset: config.angle_offset(),
            drive_inverted: config.drive_inverted,
            io,
            turn: TurnControl::from_config(turn_config, dt)?,
            drive: DriveControl::new(*drive_config, dt)?,
            state: ModuleState::default(),
            target: ModuleState::default(),
            measurement: None,
            sampled_once: false,
            degraded: false,
            last_output: ModuleOutput::stopped(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &na::Vector2<f64> {
        &self.location
    }

    /// Last sampled state, angle continuous in the chassis frame.
    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn target(&self) -> ModuleState {
        self.target
    }

    /// True when the last sample or write failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn last_output(&self) -> ModuleOutput {
        self.last_output
    }

    pub fn turn_estimate(&self) -> Option<TurnAxisState> {
        self.turn.estimate()
    }

    /// Steer and drive towards `target`, flipping the wheel when that is shorter.
    pub fn set_target(&mut self, target: ModuleState) {
        let target = target.optimize(self.state.angle);
        self.apply_target(target);
    }

    /// Zero speed, steering held where it was headed.
    pub fn stop(&mut self) {
        self.apply_target(ModuleState::new(0.0, self.target.angle));
    }

    fn apply_target(&mut self, target: ModuleState) {
        self.target = target;
        self.turn.set_target(target.angle);
        self.drive.set_target(target.speed);
    }

    /// Read the sensors once for this tick.
    ///
    /// On a fault the previous state is held and the module is flagged degraded.
    pub fn sample(&mut self) -> ModuleState {
        let reading = self.io.read().and_then(|reading| {
            if reading.is_valid() {
                Ok(reading)
            } else {
                Err(DrivetrainError::sensor_fault(format!(
                    "non finite reading {:?}",
                    reading
                )))
            }
        });
        match reading {
            Ok(reading) => {
                let reading = self.to_chassis_frame(reading);
                let angle = if self.sampled_once {
                    closest_equivalent_angle(self.state.angle, reading.angle)
                } else {
                    self.sampled_once = true;
                    self.target = ModuleState::new(0.0, reading.angle);
                    self.turn.reset(reading.angle);
                    reading.angle
                };
                self.state = ModuleState::new(reading.speed, angle);
                self.measurement = Some(reading);
                self.degraded = false;
            }
            Err(err) => {
                if !self.degraded {
                    warn!("Module {} degraded {}", self.id, err);
                }
                self.measurement = None;
                self.degraded = true;
            }
        }
        self.state
    }

    fn to_chassis_frame(&self, reading: ModuleMeasurement) -> ModuleMeasurement {
        let speed = if self.drive_inverted {
            -reading.speed
        } else {
            reading.speed
        };
        ModuleMeasurement::new(speed, wrap_angle(reading.angle - self.angle_offset))
    }

    /// Run both controllers against this tick's sample and write the voltages.
    pub fn actuate(&mut self) -> ModuleOutput {
        let turn_voltage = self
            .turn
            .calculate(self.measurement.map(|reading| reading.angle));
        let drive_voltage = self
            .drive
            .calculate(self.measurement.map(|reading| reading.speed));
        let output = ModuleOutput::new(
            if self.drive_inverted {
                -drive_voltage
            } else {
                drive_voltage
            },
            turn_voltage,
        );
        self.write(output);
        output
    }

    /// Cut both motors without touching the controller targets.
    pub fn halt(&mut self) {
        self.write(ModuleOutput::stopped());
    }

    fn write(&mut self, output: ModuleOutput) {
        if let Err(err) = self.io.write(output) {
            warn!("Module {} write failed {}", self.id, err);
            self.degraded = true;
        }
        self.last_output = output;
    }

    /// Re-zero the hardware. Both loops restart from the next sample.
    pub fn reset(&mut self) {
        self.io.reset();
        self.drive.reset();
        self.sampled_once = false;
        self.measurement = None;
        self.target = ModuleState::new(0.0, self.state.angle);
    }
}

impl std::fmt::Debug for SwerveModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwerveModule")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("target", &self.target)
            .field("degraded", &self.degraded)
            .finish()
    }
}
