use crate::drivetrain::DriveCommand;
use crate::geometry::Pose2d;
use crate::kinematics::{ChassisVelocity, Frame};
use crate::pose_estimator::PoseEstimate;
use chrono::prelude::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChassisCommandMessage {
    #[serde(default)]
    pub forward: f64,
    #[serde(default)]
    pub strafe: f64,
    #[serde(default)]
    pub omega: f64,
    #[serde(default)]
    pub frame: Frame,
    #[serde(default)]
    pub stop: bool,
    pub time: Option<DateTime<Utc>>,
}

impl ChassisCommandMessage {
    pub fn command(&self) -> DriveCommand {
        if self.stop {
            DriveCommand::Stop
        } else {
            DriveCommand::Velocity {
                velocity: ChassisVelocity::new(self.forward, self.strafe, self.omega),
                frame: self.frame,
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PoseMessage {
    pub x: f64,
    pub y: f64,
    /// radians, continuous
    pub heading: f64,
    pub uncertainty: [f64; 3],
    pub degraded: bool,
    pub time: DateTime<Utc>,
}

impl PoseMessage {
    pub fn new(estimate: &PoseEstimate, time: DateTime<Utc>) -> Self {
        Self {
            x: estimate.pose.x(),
            y: estimate.pose.y(),
            heading: estimate.pose.heading(),
            uncertainty: estimate.uncertainty,
            degraded: estimate.degraded,
            time,
        }
    }
}

/// Externally computed pose, fused with `confidence` when given and
/// with `std_devs` (or the configured defaults) otherwise.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VisionMessage {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub std_devs: Option<[f64; 3]>,
    /// when the camera frame was captured
    pub time: DateTime<Utc>,
}

impl VisionMessage {
    pub fn pose(&self) -> Pose2d {
        Pose2d::new((self.x, self.y), self.heading)
    }

    /// Seconds between capture and `now`, never negative.
    pub fn latency(&self, now: DateTime<Utc>) -> f64 {
        let micros = (now - self.time).num_microseconds().unwrap_or(i64::MAX);
        (micros.max(0) as f64) / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn command_defaults_to_robot_relative() {
        let message: ChassisCommandMessage =
            serde_json::from_str(r#"{"forward": 1.0, "omega": 0.5}"#).unwrap();
        assert_eq!(
            message.command(),
            DriveCommand::Velocity {
                velocity: ChassisVelocity::new(1.0, 0.0, 0.5),
                frame: Frame::RobotRelative,
            }
        );
    }

    #[test]
    fn field_relative_and_stop_parse() {
        let message: ChassisCommandMessage =
            serde_json::from_str(r#"{"strafe": 1.0, "frame": "field_relative"}"#).unwrap();
        assert!(matches!(
            message.command(),
            DriveCommand::Velocity {
                frame: Frame::FieldRelative,
                ..
            }
        ));
        let message: ChassisCommandMessage = serde_json::from_str(r#"{"stop": true}"#).unwrap();
        assert_eq!(message.command(), DriveCommand::Stop);
    }

    #[test]
    fn vision_latency_from_capture_time() {
        let now = Utc::now();
        let message = VisionMessage {
            x: 1.0,
            y: 2.0,
            heading: 0.0,
            confidence: Some(0.5),
            std_devs: None,
            time: now - Duration::milliseconds(40),
        };
        assert!((message.latency(now) - 0.04).abs() < 1e-9);
        assert_eq!(message.latency(now - Duration::seconds(1)), 0.0);
    }
}
