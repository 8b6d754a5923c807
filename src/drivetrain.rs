//! Tick driven orchestration of the four swerve modules.
//!
//! Every [`Drivetrain::tick`] runs the same fixed sequence: snapshot all
//! sensors, update and publish the pose, pick up the latest command, then run
//! every module controller. Commands arrive through a last-writer-wins channel
//! and the pose is published on a `watch` channel, so producers and consumers
//! on other tasks never touch the drivetrain itself.

use crate::drive_control::DriveControlConfig;
use crate::driver::{HeadingSensor, ModuleIo};
use crate::error::{DrivetrainError, Result};
use crate::geometry::Pose2d;
use crate::kinematics::{ChassisVelocity, Frame, ModuleState, SwerveKinematics, MODULE_COUNT};
use crate::module::{ModuleConfig, SwerveModule};
use crate::pose_estimator::{PoseEstimate, PoseEstimator, PoseEstimatorConfig};
use crate::turn_control::TurnControlConfig;
use crate::util::{latest_value_channel, LatestReceiver, LatestSender};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::*;

#[derive(Deserialize, Debug, Clone)]
pub struct DrivetrainConfig {
    /// seconds between ticks
    #[serde(default = "default_tick_period")]
    pub tick_period: f64,
    /// m/s, wheel speed limit used for desaturation
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub turn_control: TurnControlConfig,
    #[serde(default)]
    pub drive_control: DriveControlConfig,
    #[serde(default)]
    pub pose_estimator: PoseEstimatorConfig,
}

fn default_tick_period() -> f64 {
    0.02
}

fn default_max_speed() -> f64 {
    4.2
}

impl DrivetrainConfig {
    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.tick_period.max(0.0))
    }

    fn validate(&self) -> Result<()> {
        if !(self.tick_period > 0.0 && self.tick_period.is_finite()) {
            return Err(DrivetrainError::configuration(format!(
                "tick period must be positive, got {}",
                self.tick_period
            )));
        }
        if !(self.max_speed > 0.0 && self.max_speed.is_finite()) {
            return Err(DrivetrainError::configuration(format!(
                "max speed must be positive, got {}",
                self.max_speed
            )));
        }
        if self.modules.len() != MODULE_COUNT {
            return Err(DrivetrainError::configuration(format!(
                "expected {} modules, got {}",
                MODULE_COUNT,
                self.modules.len()
            )));
        }
        let mut ids = HashSet::new();
        for module in &self.modules {
            if !ids.insert(module.id.as_str()) {
                return Err(DrivetrainError::configuration(format!(
                    "duplicate module id {:?}",
                    module.id
                )));
            }
        }
        Ok(())
    }

    pub fn kinematics(&self) -> Result<SwerveKinematics> {
        let locations: Vec<_> = self.modules.iter().map(ModuleConfig::location).collect();
        SwerveKinematics::new(&locations)
    }
}

/// What the drivetrain should be doing until told otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DriveCommand {
    Velocity { velocity: ChassisVelocity, frame: Frame },
    Stop,
}

pub type CommandSender = LatestSender<DriveCommand>;

pub struct Drivetrain {
    tick_period: f64,
    max_speed: f64,
    kinematics: SwerveKinematics,
    modules: Vec<SwerveModule>,
    gyro: Box<dyn HeadingSensor>,
    gyro_degraded: bool,
    estimator: PoseEstimator,
    command_sender: CommandSender,
    command_receiver: LatestReceiver<DriveCommand>,
    active_command: DriveCommand,
    pose_sender: watch::Sender<PoseEstimate>,
    timestamp: f64,
}

impl Drivetrain {
    /// `io` must be ordered like `config.modules`.
    pub fn new(
        config: &DrivetrainConfig,
        io: Vec<Box<dyn ModuleIo>>,
        gyro: Box<dyn HeadingSensor>,
    ) -> Result<Self> {
        config.validate()?;
        if io.len() != config.modules.len() {
            return Err(DrivetrainError::configuration(format!(
                "{} module configs but {} module adapters",
                config.modules.len(),
                io.len()
            )));
        }
        let kinematics = config.kinematics()?;
        let modules = config
            .modules
            .iter()
            .zip(io)
            .map(|(module_config, io)| {
                SwerveModule::new(
                    module_config,
                    io,
                    &config.turn_control,
                    &config.drive_control,
                    config.tick_period,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let estimator = PoseEstimator::new(
            kinematics.clone(),
            config.pose_estimator.clone(),
            Pose2d::origin(),
        );
        let (command_sender, command_receiver) = latest_value_channel();
        let (pose_sender, _) = watch::channel(estimator.estimate());
        info!(
            "Drivetrain ready with modules {:?}",
            modules.iter().map(SwerveModule::id).collect::<Vec<_>>()
        );
        Ok(Self {
            tick_period: config.tick_period,
            max_speed: config.max_speed,
            kinematics,
            modules,
            gyro,
            gyro_degraded: false,
            estimator,
            command_sender,
            command_receiver,
            active_command: DriveCommand::Stop,
            pose_sender,
            timestamp: 0.0,
        })
    }

    /// Queue a chassis velocity, applied on the next tick.
    pub fn set_velocity(&mut self, velocity: ChassisVelocity, frame: Frame) {
        self.submit(DriveCommand::Velocity { velocity, frame });
    }

    fn submit(&self, command: DriveCommand) {
        // the receiver lives as long as self
        let _ = self.command_sender.send(command);
    }

    /// Handle for producers on other tasks. The latest command wins.
    pub fn command_sender(&self) -> CommandSender {
        self.command_sender.clone()
    }

    pub fn pose_receiver(&self) -> watch::Receiver<PoseEstimate> {
        self.pose_sender.subscribe()
    }

    pub fn get_pose(&self) -> Pose2d {
        *self.estimator.pose()
    }

    pub fn estimate(&self) -> PoseEstimate {
        self.estimator.estimate()
    }

    /// Seconds of drivetrain time, advanced by one tick period per tick.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn tick_period(&self) -> f64 {
        self.tick_period
    }

    pub fn kinematics(&self) -> &SwerveKinematics {
        &self.kinematics
    }

    pub fn get_module(&self, id: &str) -> Result<&SwerveModule> {
        self.modules
            .iter()
            .find(|module| module.id() == id)
            .ok_or_else(|| DrivetrainError::NotFound(id.to_owned()))
    }

    pub fn get_module_mut(&mut self, id: &str) -> Result<&mut SwerveModule> {
        self.modules
            .iter_mut()
            .find(|module| module.id() == id)
            .ok_or_else(|| DrivetrainError::NotFound(id.to_owned()))
    }

    pub fn modules(&self) -> &[SwerveModule] {
        &self.modules
    }

    pub fn is_degraded(&self) -> bool {
        self.gyro_degraded || self.modules.iter().any(SwerveModule::is_degraded)
    }

    /// Zero every target speed, keep steering and drop any queued command.
    pub fn stop(&mut self) {
        self.command_receiver.clear();
        self.active_command = DriveCommand::Stop;
        for module in self.modules.iter_mut() {
            module.stop();
        }
    }

    /// Stop and write zero voltage to every motor immediately.
    pub fn shutdown(&mut self) {
        self.stop();
        for module in self.modules.iter_mut() {
            module.halt();
        }
        info!("Drivetrain halted");
    }

    /// Re-zero the heading reference and move the pose to the origin.
    pub fn reset_heading(&mut self) {
        self.gyro.reset();
        self.reset_pose(Pose2d::origin());
    }

    pub fn reset_pose(&mut self, pose: Pose2d) {
        self.estimator.reset(pose);
        self.pose_sender.send_replace(self.estimator.estimate());
    }

    /// Re-zero the heading and every module.
    pub fn reset(&mut self) {
        self.reset_heading();
        for module in self.modules.iter_mut() {
            module.reset();
        }
    }

    /// Fuse an external pose measured at drivetrain time `timestamp`.
    ///
    /// Times after the last processed tick but not past [`Drivetrain::timestamp`]
    /// are matched against the newest pose.
    pub fn add_vision_measurement(
        &mut self,
        pose: Pose2d,
        timestamp: f64,
        confidence: f64,
    ) -> bool {
        let timestamp = self.vision_timestamp(timestamp);
        let applied = self
            .estimator
            .add_vision_measurement(pose, timestamp, confidence);
        if applied {
            self.pose_sender.send_replace(self.estimator.estimate());
        }
        applied
    }

    pub fn add_vision_measurement_with_std(
        &mut self,
        pose: Pose2d,
        timestamp: f64,
        std_devs: Option<[f64; 3]>,
    ) -> bool {
        let timestamp = self.vision_timestamp(timestamp);
        let applied = match std_devs {
            Some(std_devs) => self
                .estimator
                .add_vision_measurement_with_std(pose, timestamp, std_devs),
            None => self.estimator.add_vision_measurement_default(pose, timestamp),
        };
        if applied {
            self.pose_sender.send_replace(self.estimator.estimate());
        }
        applied
    }

    fn vision_timestamp(&self, timestamp: f64) -> f64 {
        match self.estimator.latest_timestamp() {
            Some(latest) if timestamp > latest && timestamp <= self.timestamp => latest,
            _ => timestamp,
        }
    }

    /// One control cycle. Never fails, sensor faults degrade the estimate instead.
    pub fn tick(&mut self) -> PoseEstimate {
        let heading = match self.gyro.read_heading() {
            Ok(heading) => {
                self.gyro_degraded = false;
                Some(heading)
            }
            Err(err) => {
                if !self.gyro_degraded {
                    warn!("Heading sensor degraded {}", err);
                }
                self.gyro_degraded = true;
                None
            }
        };
        let states: Vec<ModuleState> = self.modules.iter_mut().map(SwerveModule::sample).collect();

        let estimate = match self.estimator.update(self.timestamp, heading, &states) {
            Ok(estimate) => estimate,
            Err(err) => {
                error!("Pose update failed {}", err);
                self.estimator.estimate()
            }
        };
        self.pose_sender.send_replace(estimate);

        if let Some(command) = self.command_receiver.try_recv() {
            debug!("New drive command {:?}", command);
            self.active_command = command;
        }
        self.apply_command(estimate.pose.heading());

        for module in self.modules.iter_mut() {
            module.actuate();
        }
        self.timestamp += self.tick_period;
        estimate
    }

    fn apply_command(&mut self, heading: f64) {
        let velocity = match self.active_command {
            DriveCommand::Stop => None,
            DriveCommand::Velocity {
                velocity,
                frame: Frame::RobotRelative,
            } => Some(velocity),
            DriveCommand::Velocity {
                velocity,
                frame: Frame::FieldRelative,
            } => Some(ChassisVelocity::from_field_relative(velocity, heading)),
        };
        match velocity.filter(|velocity| !velocity.is_zero()) {
            Some(velocity) => {
                let mut targets = self.kinematics.to_module_states(&velocity);
                SwerveKinematics::desaturate(&mut targets, self.max_speed);
                for (module, target) in self.modules.iter_mut().zip(targets) {
                    module.set_target(target);
                }
            }
            None => {
                for module in self.modules.iter_mut() {
                    module.stop();
                }
            }
        }
    }
}

impl std::fmt::Debug for Drivetrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drivetrain")
            .field("modules", &self.modules)
            .field("active_command", &self.active_command)
            .field("pose", self.estimator.pose())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
