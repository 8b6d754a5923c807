pub mod serial_bus;
pub mod simulated;

use crate::error::Result;
use serde::{Deserialize, Serialize};

pub use serial_bus::{BusConfig, SerialBus, SerialHeadingSensor, SerialModuleIo};
pub use simulated::{
    simulated_hardware, SimulatedGyro, SimulatedGyroHandle, SimulatedHardware,
    SimulatedModuleHandle, SimulatedModuleIo,
};

/// Raw reading from one module's sensors.
///
/// `angle` is whatever the absolute encoder reports and may be wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleMeasurement {
    pub speed: f64,
    pub angle: f64,
}

impl ModuleMeasurement {
    pub fn new(speed: f64, angle: f64) -> Self {
        Self { speed, angle }
    }

    pub fn is_valid(&self) -> bool {
        self.speed.is_finite() && self.angle.is_finite()
    }
}

/// Voltages for the drive and turn motors of one module.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub drive_voltage: f64,
    pub turn_voltage: f64,
}

impl ModuleOutput {
    pub fn new(drive_voltage: f64, turn_voltage: f64) -> Self {
        Self {
            drive_voltage,
            turn_voltage,
        }
    }

    pub fn stopped() -> Self {
        Self::default()
    }
}

/// Hardware family adapter for one swerve module.
///
/// Both calls run inside the control tick and must return in bounded time.
pub trait ModuleIo: Send {
    /// Latest sensor reading, `SensorFault` when none is available.
    fn read(&mut self) -> Result<ModuleMeasurement>;

    fn write(&mut self, output: ModuleOutput) -> Result<()>;

    /// Re-zero encoders, used by calibration routines.
    fn reset(&mut self) {}
}

/// Robot heading source, counter-clockwise positive radians.
pub trait HeadingSensor: Send {
    fn read_heading(&mut self) -> Result<f64>;

    /// Make the current orientation read as zero.
    fn reset(&mut self);
}
