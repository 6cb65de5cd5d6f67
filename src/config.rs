use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::backoff::{
    DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_RECONNECT_THRESHOLD,
};
use crate::ingest::{IngestSettings, RetryPolicy};

/// MQTT is always built; ZeroMQ endpoints need the `transport-zmq` feature.
const DEFAULT_SUBSCRIBE_ENDPOINT: &str = "mqtt://localhost:1883/slam/frames";
const DEFAULT_CALIBRATION_PATH: &str = "calib.txt";
const DEFAULT_STRIDE: u32 = 1;
const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    subscribe: Option<SubscribeConfigFile>,
    publish: Option<PublishConfigFile>,
    retry: Option<RetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SubscribeConfigFile {
    endpoint: Option<String>,
    calibration_path: Option<PathBuf>,
    stride: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    endpoint: Option<String>,
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    reconnect_threshold: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub subscribe: SubscribeSettings,
    pub publish: PublishSettings,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct SubscribeSettings {
    pub endpoint: String,
    pub calibration_path: PathBuf,
    pub stride: u32,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// No endpoint means the publish side is disabled.
    pub endpoint: Option<String>,
    pub interval: Duration,
}

impl BridgeConfig {
    /// File named by `SLAM_BRIDGE_CONFIG` (optional), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SLAM_BRIDGE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Self {
        let subscribe = file.subscribe.unwrap_or_default();
        let publish = file.publish.unwrap_or_default();
        let retry = file.retry.unwrap_or_default();

        Self {
            subscribe: SubscribeSettings {
                endpoint: subscribe
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_SUBSCRIBE_ENDPOINT.to_string()),
                calibration_path: subscribe
                    .calibration_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_CALIBRATION_PATH)),
                stride: subscribe.stride.unwrap_or(DEFAULT_STRIDE),
            },
            publish: PublishSettings {
                endpoint: publish.endpoint.filter(|e| !e.trim().is_empty()),
                interval: Duration::from_millis(
                    publish.interval_ms.unwrap_or(DEFAULT_PUBLISH_INTERVAL_MS),
                ),
            },
            retry: RetryPolicy {
                initial_delay: retry
                    .initial_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_INITIAL_DELAY),
                max_delay: retry
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_MAX_DELAY),
                reconnect_threshold: retry
                    .reconnect_threshold
                    .unwrap_or(DEFAULT_RECONNECT_THRESHOLD),
                ..RetryPolicy::default()
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("SLAM_BRIDGE_SUBSCRIBE_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.subscribe.endpoint = endpoint;
            }
        }
        if let Ok(path) = std::env::var("SLAM_BRIDGE_CALIBRATION") {
            if !path.trim().is_empty() {
                self.subscribe.calibration_path = PathBuf::from(path);
            }
        }
        if let Ok(stride) = std::env::var("SLAM_BRIDGE_STRIDE") {
            self.subscribe.stride = stride
                .trim()
                .parse()
                .map_err(|_| anyhow!("SLAM_BRIDGE_STRIDE must be a positive integer"))?;
        }
        if let Ok(endpoint) = std::env::var("SLAM_BRIDGE_PUBLISH_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.publish.endpoint = Some(endpoint);
            }
        }
        if let Ok(interval) = std::env::var("SLAM_BRIDGE_PUBLISH_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("SLAM_BRIDGE_PUBLISH_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.publish.interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscribe.stride == 0 {
            return Err(anyhow!("stride must be at least 1"));
        }
        if self.retry.initial_delay.is_zero() {
            return Err(anyhow!("retry initial delay must be greater than zero"));
        }
        if self.retry.max_delay < self.retry.initial_delay {
            return Err(anyhow!(
                "retry max delay ({:?}) is below the initial delay ({:?})",
                self.retry.max_delay,
                self.retry.initial_delay
            ));
        }
        if self.retry.reconnect_threshold == 0 {
            return Err(anyhow!("reconnect threshold must be at least 1"));
        }
        if self.publish.interval.is_zero() {
            return Err(anyhow!("publish interval must be greater than zero"));
        }
        Ok(())
    }

    /// Ingestor settings derived from this config.
    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            stride: self.subscribe.stride,
            retry: self.retry,
            ..IngestSettings::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
