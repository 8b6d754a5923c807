#![doc = include_str!("../README.md")]
pub mod bridge;
pub mod configuration;
pub mod drive_control;
pub mod driver;
pub mod drivetrain;
pub mod error;
pub mod geometry;
pub mod kinematics;
pub mod linear_system;
pub mod logging;
pub mod messages;
pub mod module;
pub mod pose_estimator;
pub mod turn_control;
pub mod util;
