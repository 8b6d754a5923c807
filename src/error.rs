use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DrivetrainError {
    #[error("invalid drivetrain configuration: {0}")]
    Configuration(String),
    #[error("expected {expected} module states but got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no module with id {0:?}")]
    NotFound(String),
    #[error("sensor fault: {0}")]
    SensorFault(String),
}

impl DrivetrainError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn sensor_fault(message: impl Into<String>) -> Self {
        Self::SensorFault(message.into())
    }

    /// Recoverable errors are handled inside the tick, fatal ones halt startup.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::SensorFault(_))
    }
}

pub type Result<T> = std::result::Result<T, DrivetrainError>;

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("zenoh error {0:?}")]
    ZenohError(zenoh::Error),
}
