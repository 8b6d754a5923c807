use config::Config;
use serde::Deserialize;
use std::{path::PathBuf, str};
use tracing::*;

use crate::{driver::BusConfig, drivetrain::DrivetrainConfig, error::ErrorWrapper};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub drivetrain: DrivetrainConfig,
    /// serial module bus, the binary simulates the hardware when absent
    #[serde(default)]
    pub bus: Option<BusConfig>,
    #[serde(default)]
    pub zenoh: SwerveZenohConfig,
}

impl AppConfig {
    pub fn load_config(config: &Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = if let Some(config) = config {
            info!("Using configuration from {:?}", config);
            Config::builder()
                .add_source(config::Environment::with_prefix("APP"))
                .add_source(config::File::with_name(
                    config
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
                ))
                .build()?
        } else {
            info!("Using dev configuration");
            Config::builder()
                .add_source(config::Environment::with_prefix("APP"))
                .add_source(config::File::with_name("config/settings"))
                .add_source(config::File::with_name("config/dev_settings").required(false))
                .build()?
        };

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SwerveZenohConfig {
    #[serde(default)]
    pub connect: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub listen: Vec<zenoh_config::EndPoint>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "swerve".to_owned()
}

impl Default for SwerveZenohConfig {
    fn default() -> Self {
        Self {
            connect: Vec::new(),
            listen: Vec::new(),
            config_path: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl SwerveZenohConfig {
    pub fn get_zenoh_config(&self) -> anyhow::Result<zenoh::config::Config> {
        let mut config = if let Some(conf_file) = &self.config_path {
            zenoh::config::Config::from_file(conf_file).map_err(ErrorWrapper::ZenohError)?
        } else {
            zenoh::config::Config::default()
        };
        if !self.connect.is_empty() {
            config.connect.endpoints.clone_from(&self.connect);
        }
        if !self.listen.is_empty() {
            config.listen.endpoints.clone_from(&self.listen);
        }
        Ok(config)
    }

    /// Full key for `topic` under the configured prefix.
    pub fn key(&self, topic: &str) -> String {
        format!("{}/{}", self.key_prefix.trim_end_matches('/'), topic)
    }
}
