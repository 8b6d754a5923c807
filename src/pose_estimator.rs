//! Wheel odometry fused with the heading sensor and optional vision fixes.

use crate::error::Result;
use crate::geometry::{closest_equivalent_angle, wrap_angle, Pose2d, Twist2d};
use crate::kinematics::{ModuleState, SwerveKinematics};
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::*;

const TIMESTAMP_EPSILON: f64 = 1e-9;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PoseEstimatorConfig {
    /// x, y in meters and heading in radians. Squared, this is the standing
    /// variance of the estimate and its growth per second of motion.
    #[serde(default = "default_state_std_devs")]
    pub state_std_devs: [f64; 3],
    /// trust in vision poses when no explicit std devs are given
    #[serde(default = "default_vision_std_devs")]
    pub vision_std_devs: [f64; 3],
    /// seconds of pose history kept for latency compensation
    #[serde(default = "default_history_duration")]
    pub history_duration: f64,
}

fn default_state_std_devs() -> [f64; 3] {
    [0.1, 0.1, 0.1]
}

fn default_vision_std_devs() -> [f64; 3] {
    [0.9, 0.9, 0.9]
}

fn default_history_duration() -> f64 {
    1.5
}

impl Default for PoseEstimatorConfig {
    fn default() -> Self {
        Self {
            state_std_devs: default_state_std_devs(),
            vision_std_devs: default_vision_std_devs(),
            history_duration: default_history_duration(),
        }
    }
}

/// Published pose with its diagonal variance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub pose: Pose2d,
    /// variance of x, y and heading
    pub uncertainty: [f64; 3],
    /// seconds, time of the tick that produced this estimate
    pub timestamp: f64,
    /// set while the heading sensor is unavailable
    pub degraded: bool,
}

pub struct PoseEstimator {
    kinematics: SwerveKinematics,
    config: PoseEstimatorConfig,
    pose: Pose2d,
    variance: na::Vector3<f64>,
    /// sensor heading, unwrapped, at the last valid reading
    last_sensor_heading: Option<f64>,
    /// added to the unwrapped sensor heading to get the pose heading
    heading_offset: Option<f64>,
    timestamp: Option<f64>,
    history: VecDeque<(f64, Pose2d)>,
    degraded: bool,
}

fn standing_variance(config: &PoseEstimatorConfig) -> na::Vector3<f64> {
    na::Vector3::from(config.state_std_devs).map(|std| std * std)
}

impl PoseEstimator {
    pub fn new(kinematics: SwerveKinematics, config: PoseEstimatorConfig, initial: Pose2d) -> Self {
        Self {
            kinematics,
            variance: standing_variance(&config),
            config,
            pose: initial,
            last_sensor_heading: None,
            heading_offset: None,
            timestamp: None,
            history: VecDeque::new(),
            degraded: false,
        }
    }

    pub fn estimate(&self) -> PoseEstimate {
        PoseEstimate {
            pose: self.pose,
            uncertainty: self.variance.into(),
            timestamp: self.timestamp.unwrap_or_default(),
            degraded: self.degraded,
        }
    }

    pub fn pose(&self) -> &Pose2d {
        &self.pose
    }

    /// Time of the newest pose in history.
    pub fn latest_timestamp(&self) -> Option<f64> {
        self.history.back().map(|(timestamp, _)| *timestamp)
    }

    /// Integrate one tick of wheel motion.
    ///
    /// `heading` is the raw sensor reading and may be wrapped. When it is
    /// missing the previous heading is held and the estimate is degraded.
    pub fn update(
        &mut self,
        timestamp: f64,
        heading: Option<f64>,
        states: &[ModuleState],
    ) -> Result<PoseEstimate> {
        let velocity = self.kinematics.to_chassis_velocity(states)?;
        let dt = match self.timestamp {
            Some(last) if timestamp < last => {
                warn!("Pose update at {} is older than {}, ignoring motion", timestamp, last);
                0.0
            }
            Some(last) => timestamp - last,
            None => 0.0,
        };

        let new_heading = match heading.filter(|heading| heading.is_finite()) {
            Some(raw) => {
                let unwrapped = match self.last_sensor_heading {
                    Some(last) => closest_equivalent_angle(last, raw),
                    None => raw,
                };
                self.last_sensor_heading = Some(unwrapped);
                let offset = *self
                    .heading_offset
                    .get_or_insert(self.pose.heading() - unwrapped);
                if self.degraded {
                    info!("Heading sensor recovered");
                }
                self.degraded = false;
                unwrapped + offset
            }
            None => {
                if !self.degraded {
                    warn!("Heading sensor unavailable, holding heading");
                }
                self.degraded = true;
                self.pose.heading()
            }
        };

        let wheel_twist = velocity.to_twist(dt);
        let twist = Twist2d::new(
            wheel_twist.dx,
            wheel_twist.dy,
            new_heading - self.pose.heading(),
        );
        self.pose = self.pose.exp(&twist).with_heading(new_heading);

        if !velocity.is_zero() {
            let growth = na::Vector3::from(self.config.state_std_devs).map(|std| std * std * dt);
            self.variance += growth;
        }

        self.timestamp = Some(timestamp);
        self.history.push_back((timestamp, self.pose));
        while let Some((oldest, _)) = self.history.front() {
            if timestamp - oldest > self.config.history_duration {
                self.history.pop_front();
            } else {
                break;
            }
        }
        Ok(self.estimate())
    }

    /// Blend in an externally measured pose taken at `timestamp`.
    ///
    /// The pose from history at that time is compared with `measured` and the
    /// current pose is moved by `confidence` of the difference. Returns whether
    /// the correction was applied.
    pub fn add_vision_measurement(
        &mut self,
        measured: Pose2d,
        timestamp: f64,
        confidence: f64,
    ) -> bool {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self.apply_correction(measured, timestamp, na::Vector3::repeat(confidence))
    }

    /// Same as [`PoseEstimator::add_vision_measurement`] with a per-axis
    /// confidence derived from the current variance and the measurement std devs.
    pub fn add_vision_measurement_with_std(
        &mut self,
        measured: Pose2d,
        timestamp: f64,
        std_devs: [f64; 3],
    ) -> bool {
        let gains = self.variance.zip_map(&na::Vector3::from(std_devs), |q, std| {
            let r = std * std;
            if q + r > 0.0 {
                q / (q + r)
            } else {
                1.0
            }
        });
        self.apply_correction(measured, timestamp, gains)
    }

    /// Vision fusion with the configured vision std devs.
    pub fn add_vision_measurement_default(&mut self, measured: Pose2d, timestamp: f64) -> bool {
        let std_devs = self.config.vision_std_devs;
        self.add_vision_measurement_with_std(measured, timestamp, std_devs)
    }

    fn apply_correction(
        &mut self,
        measured: Pose2d,
        timestamp: f64,
        gains: na::Vector3<f64>,
    ) -> bool {
        let Some(sample) = self.sample_at(timestamp) else {
            warn!(
                "Discarding vision measurement at {}, history covers {:?}",
                timestamp,
                self.history_span()
            );
            return false;
        };

        let correction = na::Vector3::new(
            measured.x() - sample.x(),
            measured.y() - sample.y(),
            wrap_angle(measured.heading() - sample.heading()),
        )
        .component_mul(&gains);

        let shift = |pose: &Pose2d| {
            Pose2d::new(
                (pose.x() + correction.x, pose.y() + correction.y),
                pose.heading() + correction.z,
            )
        };
        self.pose = shift(&self.pose);
        for (_, pose) in self.history.iter_mut() {
            *pose = shift(pose);
        }
        if let Some(offset) = self.heading_offset.as_mut() {
            *offset += correction.z;
        }
        self.variance = self
            .variance
            .zip_map(&gains, |variance, gain| (1.0 - gain) * variance)
            .sup(&standing_variance(&self.config));
        debug!("Applied vision correction {:?}", correction);
        true
    }

    fn history_span(&self) -> Option<(f64, f64)> {
        Some((self.history.front()?.0, self.history.back()?.0))
    }

    fn sample_at(&self, timestamp: f64) -> Option<Pose2d> {
        let (oldest, latest) = self.history_span()?;
        if !timestamp.is_finite()
            || timestamp < oldest - TIMESTAMP_EPSILON
            || timestamp > latest + TIMESTAMP_EPSILON
        {
            return None;
        }
        let after = self
            .history
            .iter()
            .position(|(time, _)| *time >= timestamp - TIMESTAMP_EPSILON)?;
        let (after_time, after_pose) = self.history[after];
        if after == 0 || (after_time - timestamp).abs() <= TIMESTAMP_EPSILON {
            return Some(after_pose);
        }
        let (before_time, before_pose) = self.history[after - 1];
        let t = (timestamp - before_time) / (after_time - before_time);
        Some(before_pose.interpolate(&after_pose, t))
    }

    /// Restart from `pose`. The next heading reading is aligned to its heading.
    pub fn reset(&mut self, pose: Pose2d) {
        info!("Pose reset to {}", pose);
        self.pose = pose;
        self.heading_offset = None;
        self.variance = standing_variance(&self.config);
        self.history.clear();
        if let Some(timestamp) = self.timestamp {
            self.history.push_back((timestamp, pose));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::ChassisVelocity;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    const DT: f64 = 0.02;

    fn kinematics() -> SwerveKinematics {
        SwerveKinematics::new(&[
            na::Vector2::new(0.3, -0.3),
            na::Vector2::new(0.3, 0.3),
            na::Vector2::new(-0.3, 0.3),
            na::Vector2::new(-0.3, -0.3),
        ])
        .unwrap()
    }

    fn estimator() -> PoseEstimator {
        PoseEstimator::new(kinematics(), PoseEstimatorConfig::default(), Pose2d::origin())
    }

    fn drive(estimator: &mut PoseEstimator, velocity: ChassisVelocity, ticks: usize) {
        let states = kinematics().to_module_states(&velocity);
        let start = estimator.timestamp.unwrap_or_default();
        let mut heading = estimator.pose().heading();
        for i in 1..=ticks {
            heading += velocity.omega * DT;
            estimator
                .update(start + i as f64 * DT, Some(wrap_angle(heading)), &states)
                .unwrap();
        }
    }

    fn started() -> PoseEstimator {
        let mut estimator = estimator();
        estimator
            .update(0.0, Some(0.0), &[ModuleState::default(); 4])
            .unwrap();
        estimator
    }

    #[test]
    fn straight_line_odometry() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 50);
        assert_relative_eq!(estimator.pose().x(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().y(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn heading_stays_continuous_across_seam() {
        let mut estimator = estimator();
        estimator
            .update(0.0, Some(PI - 0.05), &[ModuleState::default(); 4])
            .unwrap();
        estimator
            .update(DT, Some(-PI + 0.05), &[ModuleState::default(); 4])
            .unwrap();
        assert_relative_eq!(estimator.pose().heading(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn missing_heading_holds_and_degrades() {
        let mut estimator = started();
        let estimate = estimator
            .update(DT, None, &[ModuleState::default(); 4])
            .unwrap();
        assert!(estimate.degraded);
        assert_eq!(estimate.pose.heading(), 0.0);
        let estimate = estimator
            .update(2.0 * DT, Some(0.0), &[ModuleState::default(); 4])
            .unwrap();
        assert!(!estimate.degraded);
    }

    #[test]
    fn wrong_state_count_is_rejected() {
        let mut estimator = estimator();
        assert!(estimator
            .update(0.0, Some(0.0), &[ModuleState::default(); 3])
            .is_err());
    }

    #[test]
    fn zero_confidence_leaves_pose() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 10);
        let before = *estimator.pose();
        assert!(estimator.add_vision_measurement(Pose2d::new((5.0, 5.0), 1.0), 0.2, 0.0));
        assert_eq!(*estimator.pose(), before);
    }

    #[test]
    fn full_confidence_at_latest_moves_to_measurement() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 10);
        let measured = Pose2d::new((0.5, -0.1), 0.3);
        assert!(estimator.add_vision_measurement(measured, 0.2, 1.0));
        assert_relative_eq!(estimator.pose().x(), 0.5, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().y(), -0.1, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().heading(), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn correction_is_latency_compensated() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 50);
        // at t = 0.5 the robot believed it was at x = 0.5, vision says 0.6
        assert!(estimator.add_vision_measurement(Pose2d::new((0.6, 0.0), 0.0), 0.5, 1.0));
        assert_relative_eq!(estimator.pose().x(), 1.1, epsilon = 1e-9);
    }

    #[test]
    fn stale_and_future_measurements_are_discarded() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 100);
        let before = *estimator.pose();
        assert!(!estimator.add_vision_measurement(Pose2d::origin(), 0.1, 1.0));
        assert!(!estimator.add_vision_measurement(Pose2d::origin(), 5.0, 1.0));
        assert_eq!(*estimator.pose(), before);
    }

    #[test]
    fn heading_correction_persists_through_gyro_updates() {
        let mut estimator = started();
        assert!(estimator.add_vision_measurement(Pose2d::new((0.0, 0.0), 0.2), 0.0, 1.0));
        estimator
            .update(DT, Some(0.0), &[ModuleState::default(); 4])
            .unwrap();
        assert_relative_eq!(estimator.pose().heading(), 0.2, epsilon = 1e-9);
    }

    #[test]
    fn std_dev_fusion_weighs_by_uncertainty() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(1.0, 0.0, 0.0), 100);
        let variance = estimator.estimate().uncertainty[0];
        assert_relative_eq!(variance, 0.03, epsilon = 1e-9);
        let x_before = estimator.pose().x();
        assert!(estimator.add_vision_measurement_with_std(
            Pose2d::new((x_before + 1.0, 0.0), 0.0),
            2.0,
            [variance.sqrt(), 1.0, 1.0],
        ));
        assert_relative_eq!(estimator.pose().x(), x_before + 0.5, epsilon = 1e-9);
        assert_relative_eq!(estimator.estimate().uncertainty[0], variance * 0.5, epsilon = 1e-12);
    }

    #[test]
    fn reset_realigns_heading() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::new(0.0, 0.0, 1.0), 25);
        estimator.reset(Pose2d::new((1.0, 2.0), 0.0));
        estimator
            .update(0.6, Some(0.5), &[ModuleState::default(); 4])
            .unwrap();
        assert_relative_eq!(estimator.pose().heading(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().x(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn stationary_robot_still_accepts_std_dev_fixes() {
        let mut estimator = started();
        drive(&mut estimator, ChassisVelocity::zero(), 10);
        for variance in estimator.estimate().uncertainty {
            assert_relative_eq!(variance, 0.01, epsilon = 1e-12);
        }
        // standing variance 0.01 against vision variance 0.81
        let gain = 0.01 / (0.01 + 0.81);
        let measured = Pose2d::new((2.0, 1.0), 0.5);
        assert!(estimator.add_vision_measurement_default(measured, 0.2));
        assert_relative_eq!(estimator.pose().x(), 2.0 * gain, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().y(), gain, epsilon = 1e-9);
        assert_relative_eq!(estimator.pose().heading(), 0.5 * gain, epsilon = 1e-9);

        // fusion never drives the variance below the standing floor
        let x_before = estimator.pose().x();
        assert!(estimator.add_vision_measurement_default(measured, 0.2));
        assert!(estimator.pose().x() > x_before);
        assert_relative_eq!(estimator.estimate().uncertainty[0], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn latest_timestamp_tracks_history() {
        let mut estimator = estimator();
        assert_eq!(estimator.latest_timestamp(), None);
        estimator
            .update(0.0, Some(0.0), &[ModuleState::default(); 4])
            .unwrap();
        drive(&mut estimator, ChassisVelocity::zero(), 3);
        assert_relative_eq!(estimator.latest_timestamp().unwrap(), 0.06, epsilon = 1e-12);
    }
}
