//! In-process plant models standing in for module hardware.
//!
//! Each adapter comes with a cloneable handle so tests and the simulator
//! binary can inspect the true state of the plant or inject faults.

use super::{HeadingSensor, ModuleIo, ModuleMeasurement, ModuleOutput};
use crate::drive_control::DriveControlConfig;
use crate::drivetrain::DrivetrainConfig;
use crate::error::{DrivetrainError, Result};
use crate::geometry::wrap_angle;
use crate::kinematics::{ModuleState, SwerveKinematics};
use crate::linear_system::{DiscreteSystem, LinearSystem, StateVector};
use crate::turn_control::TurnControlConfig;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct ModulePlant {
    drive_kv: f64,
    drive_ks: f64,
    drive_decay: f64,
    speed: f64,
    turn: DiscreteSystem,
    turn_state: StateVector,
    encoder_offset: f64,
    drive_inverted: bool,
    fault: bool,
    last_output: ModuleOutput,
}

impl ModulePlant {
    fn advance(&mut self, output: ModuleOutput) {
        let motor_voltage = if self.drive_inverted {
            -output.drive_voltage
        } else {
            output.drive_voltage
        };
        let effective = if motor_voltage.abs() <= self.drive_ks {
            0.0
        } else {
            motor_voltage - self.drive_ks * motor_voltage.signum()
        };
        let steady_state = effective / self.drive_kv;
        self.speed = self.drive_decay * self.speed + (1.0 - self.drive_decay) * steady_state;
        self.turn_state = self.turn.step(&self.turn_state, output.turn_voltage);
        self.last_output = output;
    }
}

/// First order drive wheel and second order steering plant.
pub struct SimulatedModuleIo {
    plant: Arc<Mutex<ModulePlant>>,
}

impl SimulatedModuleIo {
    /// Plant using the same constants the controllers are tuned with.
    pub fn new(
        drive: &DriveControlConfig,
        turn: &TurnControlConfig,
        dt: f64,
    ) -> Result<Self> {
        if !(drive.kv > 0.0 && drive.kv.is_finite()) {
            return Err(DrivetrainError::configuration(
                "simulated drive plant needs a positive kv",
            ));
        }
        let drive_decay = if drive.ka > 0.0 {
            (-drive.kv / drive.ka * dt).exp()
        } else {
            0.0
        };
        let turn = LinearSystem::identify_position_system(turn.kv, turn.ka)?.discretize(dt);
        Ok(Self {
            plant: Arc::new(Mutex::new(ModulePlant {
                drive_kv: drive.kv,
                drive_ks: drive.ks,
                drive_decay,
                speed: 0.0,
                turn,
                turn_state: StateVector::zeros(),
                encoder_offset: 0.0,
                drive_inverted: false,
                fault: false,
                last_output: ModuleOutput::stopped(),
            })),
        })
    }

    /// Mount the plant the way a physical module is mounted, so the reported
    /// encoder angle carries `encoder_offset` and the drive motor may be reversed.
    pub fn with_mounting(self, encoder_offset: f64, drive_inverted: bool) -> Self {
        {
            let mut plant = lock(&self.plant);
            plant.encoder_offset = encoder_offset;
            plant.drive_inverted = drive_inverted;
        }
        self
    }

    pub fn handle(&self) -> SimulatedModuleHandle {
        SimulatedModuleHandle {
            plant: Arc::clone(&self.plant),
        }
    }
}

impl ModuleIo for SimulatedModuleIo {
    fn read(&mut self) -> Result<ModuleMeasurement> {
        let plant = lock(&self.plant);
        if plant.fault {
            return Err(DrivetrainError::sensor_fault("simulated module encoder"));
        }
        let motor_speed = if plant.drive_inverted {
            -plant.speed
        } else {
            plant.speed
        };
        Ok(ModuleMeasurement::new(
            motor_speed,
            wrap_angle(plant.turn_state[0] + plant.encoder_offset),
        ))
    }

    fn write(&mut self, output: ModuleOutput) -> Result<()> {
        lock(&self.plant).advance(output);
        Ok(())
    }

    fn reset(&mut self) {
        let mut plant = lock(&self.plant);
        plant.speed = 0.0;
        plant.turn_state = StateVector::zeros();
    }
}

/// Inspection and fault injection for a [`SimulatedModuleIo`].
#[derive(Clone, Debug)]
pub struct SimulatedModuleHandle {
    plant: Arc<Mutex<ModulePlant>>,
}

impl SimulatedModuleHandle {
    /// True wheel state in the robot frame, angle unwrapped.
    pub fn state(&self) -> ModuleState {
        let plant = lock(&self.plant);
        ModuleState::new(plant.speed, plant.turn_state[0])
    }

    pub fn steering_velocity(&self) -> f64 {
        lock(&self.plant).turn_state[1]
    }

    pub fn last_output(&self) -> ModuleOutput {
        lock(&self.plant).last_output
    }

    /// Force the steering angle, as if the wheel was turned by hand.
    pub fn set_angle(&self, angle: f64) {
        lock(&self.plant).turn_state = StateVector::new(angle, 0.0);
    }

    pub fn set_fault(&self, fault: bool) {
        lock(&self.plant).fault = fault;
    }
}

#[derive(Debug, Default)]
struct GyroState {
    heading: f64,
    zero: f64,
    fault: bool,
}

struct Tracking {
    kinematics: SwerveKinematics,
    modules: Vec<SimulatedModuleHandle>,
    dt: f64,
}

/// Heading sensor for the simulator.
///
/// Without tracking the heading only changes through the handle. A tracking
/// gyro integrates the chassis rotation implied by the simulated wheels.
pub struct SimulatedGyro {
    state: Arc<Mutex<GyroState>>,
    tracking: Option<Tracking>,
}

impl Default for SimulatedGyro {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGyro {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GyroState::default())),
            tracking: None,
        }
    }

    /// Integrate rotation from `modules`, ordered like `kinematics`.
    pub fn tracking(
        kinematics: SwerveKinematics,
        modules: Vec<SimulatedModuleHandle>,
        dt: f64,
    ) -> Result<Self> {
        if modules.len() != kinematics.locations().len() {
            return Err(DrivetrainError::DimensionMismatch {
                expected: kinematics.locations().len(),
                actual: modules.len(),
            });
        }
        Ok(Self {
            state: Arc::new(Mutex::new(GyroState::default())),
            tracking: Some(Tracking {
                kinematics,
                modules,
                dt,
            }),
        })
    }

    pub fn handle(&self) -> SimulatedGyroHandle {
        SimulatedGyroHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl HeadingSensor for SimulatedGyro {
    fn read_heading(&mut self) -> Result<f64> {
        if let Some(tracking) = &self.tracking {
            let states: Vec<ModuleState> = tracking.modules.iter().map(|m| m.state()).collect();
            let velocity = tracking.kinematics.to_chassis_velocity(&states)?;
            lock(&self.state).heading += velocity.omega * tracking.dt;
        }
        let state = lock(&self.state);
        if state.fault {
            return Err(DrivetrainError::sensor_fault("simulated gyro"));
        }
        Ok(state.heading - state.zero)
    }

    fn reset(&mut self) {
        let mut state = lock(&self.state);
        state.zero = state.heading;
    }
}

#[derive(Clone, Debug)]
pub struct SimulatedGyroHandle {
    state: Arc<Mutex<GyroState>>,
}

impl SimulatedGyroHandle {
    /// True heading, ignoring any zeroing done through the sensor.
    pub fn heading(&self) -> f64 {
        lock(&self.state).heading
    }

    pub fn set_heading(&self, heading: f64) {
        lock(&self.state).heading = heading;
    }

    pub fn set_fault(&self, fault: bool) {
        lock(&self.state).fault = fault;
    }
}

/// Handles into the plants created by [`simulated_hardware`], in module order.
#[derive(Clone, Debug)]
pub struct SimulatedHardware {
    pub modules: Vec<SimulatedModuleHandle>,
    pub gyro: SimulatedGyroHandle,
}

impl SimulatedHardware {
    pub fn module(&self, index: usize) -> Option<&SimulatedModuleHandle> {
        self.modules.get(index)
    }
}

/// Simulated adapters for every configured module plus a tracking gyro.
#[allow(clippy::type_complexity)]
pub fn simulated_hardware(
    config: &DrivetrainConfig,
) -> Result<(Vec<Box<dyn ModuleIo>>, Box<dyn HeadingSensor>, SimulatedHardware)> {
    let plants = config
        .modules
        .iter()
        .map(|module| {
            Ok(SimulatedModuleIo::new(
                &config.drive_control,
                &config.turn_control,
                config.tick_period,
            )?
            .with_mounting(module.angle_offset(), module.drive_inverted))
        })
        .collect::<Result<Vec<_>>>()?;
    let handles: Vec<_> = plants.iter().map(SimulatedModuleIo::handle).collect();
    let gyro = SimulatedGyro::tracking(config.kinematics()?, handles.clone(), config.tick_period)?;
    let hardware = SimulatedHardware {
        modules: handles,
        gyro: gyro.handle(),
    };
    let io = plants
        .into_iter()
        .map(|plant| Box::new(plant) as Box<dyn ModuleIo>)
        .collect();
    Ok((io, Box::new(gyro), hardware))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra as na;

    const DT: f64 = 0.02;

    fn module() -> SimulatedModuleIo {
        SimulatedModuleIo::new(
            &DriveControlConfig::default(),
            &TurnControlConfig::default(),
            DT,
        )
        .unwrap()
    }

    #[test]
    fn drive_settles_at_feedforward_speed() {
        let config = DriveControlConfig::default();
        let mut io = module();
        let volts = config.ks + config.kv * 1.5;
        for _ in 0..500 {
            io.write(ModuleOutput::new(volts, 0.0)).unwrap();
        }
        assert_relative_eq!(io.read().unwrap().speed, 1.5, epsilon = 1e-6);
    }

    #[test]
    fn voltage_below_static_friction_does_not_move() {
        let mut io = module();
        io.write(ModuleOutput::new(0.05, 0.0)).unwrap();
        assert_eq!(io.read().unwrap().speed, 0.0);
    }

    #[test]
    fn reported_angle_includes_mounting_offset() {
        let mut io = module().with_mounting(std::f64::consts::FRAC_PI_4, false);
        io.handle().set_angle(0.1);
        assert_relative_eq!(
            io.read().unwrap().angle,
            0.1 + std::f64::consts::FRAC_PI_4,
            epsilon = 1e-12
        );
    }

    #[test]
    fn inverted_drive_reports_motor_direction() {
        let mut io = module().with_mounting(0.0, true);
        for _ in 0..100 {
            io.write(ModuleOutput::new(-5.0, 0.0)).unwrap();
        }
        assert!(io.handle().state().speed > 0.0);
        assert!(io.read().unwrap().speed < 0.0);
    }

    #[test]
    fn fault_surfaces_as_sensor_fault() {
        let mut io = module();
        io.handle().set_fault(true);
        assert!(matches!(io.read(), Err(DrivetrainError::SensorFault(_))));
    }

    #[test]
    fn gyro_reset_zeroes_reading() {
        let mut gyro = SimulatedGyro::new();
        gyro.handle().set_heading(1.0);
        gyro.reset();
        assert_relative_eq!(gyro.read_heading().unwrap(), 0.0);
        gyro.handle().set_heading(1.5);
        assert_relative_eq!(gyro.read_heading().unwrap(), 0.5);
    }

    #[test]
    fn tracking_gyro_integrates_rotation() {
        let locations = [
            na::Vector2::new(0.3, -0.3),
            na::Vector2::new(0.3, 0.3),
            na::Vector2::new(-0.3, 0.3),
            na::Vector2::new(-0.3, -0.3),
        ];
        let kinematics = SwerveKinematics::new(&locations).unwrap();
        let modules: Vec<SimulatedModuleIo> = (0..4).map(|_| module()).collect();
        let handles: Vec<_> = modules.iter().map(|m| m.handle()).collect();
        let rotation = kinematics
            .to_module_states(&crate::kinematics::ChassisVelocity::new(0.0, 0.0, 1.0));
        for (handle, state) in handles.iter().zip(rotation.iter()) {
            handle.set_angle(state.angle);
            lock(&handle.plant).speed = state.speed;
        }
        let mut gyro = SimulatedGyro::tracking(kinematics, handles, DT).unwrap();
        let heading = gyro.read_heading().unwrap();
        assert_relative_eq!(heading, DT, epsilon = 1e-9);
    }
}
