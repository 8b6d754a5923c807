//! Zenoh transport around the drivetrain.
//!
//! Commands go straight into the drivetrain's command channel. Vision fixes
//! and resets need `&mut Drivetrain`, so they are forwarded as
//! [`BridgeRequest`]s for the control loop to apply between ticks.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::*;
use zenoh::{prelude::r#async::*, subscriber::FlumeSubscriber, Session, SessionDeclarations};

use crate::{
    configuration::SwerveZenohConfig,
    drivetrain::{CommandSender, Drivetrain},
    error::ErrorWrapper,
    messages::{ChassisCommandMessage, PoseMessage, VisionMessage},
    pose_estimator::PoseEstimate,
};

pub const CHASSIS_COMMAND_TOPIC: &str = "cmd/chassis";
pub const RESET_TOPIC: &str = "cmd/reset";
pub const POSE_TOPIC: &str = "state/pose";
pub const VISION_TOPIC: &str = "vision/pose";

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeRequest {
    Vision(VisionMessage),
    ResetHeading,
}

impl BridgeRequest {
    /// Apply to the drivetrain. Must run between ticks.
    pub fn apply(self, drivetrain: &mut Drivetrain) {
        match self {
            BridgeRequest::Vision(message) => {
                let timestamp = drivetrain.timestamp() - message.latency(Utc::now());
                let applied = match message.confidence {
                    Some(confidence) => {
                        drivetrain.add_vision_measurement(message.pose(), timestamp, confidence)
                    }
                    None => drivetrain.add_vision_measurement_with_std(
                        message.pose(),
                        timestamp,
                        message.std_devs,
                    ),
                };
                if !applied {
                    debug!("Vision message at {} not applied", message.time);
                }
            }
            BridgeRequest::ResetHeading => {
                info!("Resetting heading and pose to origin");
                drivetrain.reset_heading();
            }
        }
    }
}

#[async_trait]
pub trait PosePublisher: Send + Sync {
    async fn publish(&self, estimate: &PoseEstimate) -> Result<()>;
}

pub struct ZenohPosePublisher {
    session: Arc<Session>,
    key: String,
}

impl ZenohPosePublisher {
    pub fn new(session: Arc<Session>, config: &SwerveZenohConfig) -> Self {
        Self {
            session,
            key: config.key(POSE_TOPIC),
        }
    }
}

#[async_trait]
impl PosePublisher for ZenohPosePublisher {
    async fn publish(&self, estimate: &PoseEstimate) -> Result<()> {
        let message = serde_json::to_string(&PoseMessage::new(estimate, Utc::now()))?;
        self.session
            .put(self.key.as_str(), message)
            .res_async()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        Ok(())
    }
}

/// Forward every new pose to `publisher` until the drivetrain goes away.
pub async fn run_pose_publisher(
    mut poses: watch::Receiver<PoseEstimate>,
    publisher: impl PosePublisher,
) {
    while poses.changed().await.is_ok() {
        let estimate = *poses.borrow_and_update();
        if let Err(err) = publisher.publish(&estimate).await {
            warn!("Failed to publish pose {:?}", err);
        }
    }
    info!("Pose publisher stopped");
}

pub async fn start_bridge(
    zenoh_session: Arc<Session>,
    config: &SwerveZenohConfig,
    commands: CommandSender,
    poses: watch::Receiver<PoseEstimate>,
) -> Result<mpsc::Receiver<BridgeRequest>> {
    let (requests, request_receiver) = mpsc::channel(16);

    let mut command_subscriber = zenoh_session
        .declare_subscriber(config.key(CHASSIS_COMMAND_TOPIC))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let mut vision_subscriber = zenoh_session
        .declare_subscriber(config.key(VISION_TOPIC))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let reset_subscriber = zenoh_session
        .declare_subscriber(config.key(RESET_TOPIC))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    tokio::spawn(async move {
        while let Err(err) = run_command_listener(&mut command_subscriber, &commands).await {
            error!("Command listener failed with {:?}", err);
        }
    });

    tokio::spawn({
        let requests = requests.clone();
        async move {
            while let Err(err) = run_vision_listener(&mut vision_subscriber, &requests).await {
                error!("Vision listener failed with {:?}", err);
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match reset_subscriber.recv_async().await {
                Ok(_) => {
                    if requests.send(BridgeRequest::ResetHeading).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!("Reset listener failed with {:?}", err);
                    break;
                }
            }
        }
    });

    tokio::spawn(run_pose_publisher(
        poses,
        ZenohPosePublisher::new(zenoh_session, config),
    ));

    Ok(request_receiver)
}

async fn run_command_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    commands: &CommandSender,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = sample.value.try_into()?;
        let message: ChassisCommandMessage = serde_json::from_str(&message)?;
        trace!(?message, "Received chassis command");
        commands.send(message.command())?;
    }
}

async fn run_vision_listener(
    subscriber: &mut FlumeSubscriber<'_>,
    requests: &mpsc::Sender<BridgeRequest>,
) -> Result<()> {
    loop {
        let sample = subscriber.recv_async().await?;
        let message: String = sample.value.try_into()?;
        let message: VisionMessage = serde_json::from_str(&message)?;
        requests.send(BridgeRequest::Vision(message)).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::AppConfig;
    use crate::driver::simulated_hardware;
    use crate::geometry::Pose2d;
    use approx::assert_relative_eq;
    use ::config::Config;
    use std::sync::Mutex;

    fn drivetrain() -> Drivetrain {
        let app_config: AppConfig = Config::builder()
            .add_source(::config::File::from_str(
                include_str!("../config/settings.yaml"),
                ::config::FileFormat::Yaml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let (io, gyro, _) = simulated_hardware(&app_config.drivetrain).unwrap();
        Drivetrain::new(&app_config.drivetrain, io, gyro).unwrap()
    }

    #[test]
    fn fresh_vision_message_is_applied() {
        let mut drivetrain = drivetrain();
        for _ in 0..5 {
            drivetrain.tick();
        }
        BridgeRequest::Vision(VisionMessage {
            x: 1.0,
            y: -1.0,
            heading: 0.0,
            confidence: Some(1.0),
            std_devs: None,
            time: Utc::now(),
        })
        .apply(&mut drivetrain);
        assert_relative_eq!(drivetrain.get_pose().x(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(drivetrain.get_pose().y(), -1.0, epsilon = 1e-9);
    }

    #[test]
    fn reset_request_returns_to_origin() {
        let mut drivetrain = drivetrain();
        drivetrain.tick();
        drivetrain.reset_pose(Pose2d::new((2.0, 1.0), 0.5));
        BridgeRequest::ResetHeading.apply(&mut drivetrain);
        assert_eq!(drivetrain.get_pose(), Pose2d::origin());
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<PoseEstimate>>>,
    }

    #[async_trait]
    impl PosePublisher for RecordingPublisher {
        async fn publish(&self, estimate: &PoseEstimate) -> Result<()> {
            self.published.lock().unwrap().push(*estimate);
            Ok(())
        }
    }

    #[tokio::test]
    async fn publisher_forwards_latest_pose_and_stops_with_sender() {
        let (sender, receiver) = watch::channel(PoseEstimate::default());
        let publisher = RecordingPublisher::default();
        let published = Arc::clone(&publisher.published);
        let task = tokio::spawn(run_pose_publisher(receiver, publisher));

        sender.send_replace(PoseEstimate {
            pose: Pose2d::new((1.0, 2.0), 0.5),
            timestamp: 0.02,
            ..Default::default()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(sender);
        task.await.unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published.last().map(|estimate| estimate.timestamp), Some(0.02));
    }
}
