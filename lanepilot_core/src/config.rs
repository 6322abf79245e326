//! Process configuration, loaded once at startup from a JSON file.
//!
//! The handshake secret is deliberately not part of the file; see
//! `discovery::SharedSecret::from_env`.

use crate::actuator::ActuatorConfig;
use crate::command_channel::ChannelConfig;
use crate::discovery::DiscoveryConfig;
use crate::normalization::NormalizationMode;
use crate::proximity_graph::GraphConfig;
use crate::vehicle_tracking::TrackerConfig;
use crate::video::VideoConfig;
use lanepilot_env::{Fault, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

impl From<ConfigError> for Fault {
    fn from(err: ConfigError) -> Self {
        Fault::configuration(err.to_string())
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub discovery_port: u16,
    pub command_port: u16,

    #[serde(default = "default_broadcast")]
    pub broadcast_address: IpAddr,

    #[serde(default = "default_bind")]
    pub bind_address: IpAddr,

    /// Own address, to ignore broadcast echoes
    #[serde(default)]
    pub self_address: Option<IpAddr>,

    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,

    #[serde(default = "default_true")]
    pub stop_on_response: bool,

    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    #[serde(default = "default_reply_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl NetworkConfig {
    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.discovery_port,
            broadcast_address: self.broadcast_address,
            bind_address: self.bind_address,
            self_address: self.self_address,
            timeout: Duration::from_millis(self.discovery_timeout_ms),
            attempts: self.discovery_attempts,
            stop_on_response: self.stop_on_response,
        }
    }

    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Vertical field of view in degrees
    pub fov_deg: f64,

    /// `[width, height]` in pixels
    pub resolution: [u32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleConfig {
    pub height_cm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub num_lanes: usize,

    #[serde(default = "default_normalization")]
    pub normalization_mode: NormalizationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

fn default_broadcast() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_discovery_timeout_ms() -> u64 {
    10_000
}

fn default_discovery_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_liveness_interval_ms() -> u64 {
    30_000
}

fn default_reply_timeout_ms() -> u64 {
    5_000
}

fn default_normalization() -> NormalizationMode {
    NormalizationMode::MinMax
}

fn default_cleanup_interval_ms() -> u64 {
    5_000
}

fn default_cleanup_timeout_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

// ============================================================================
// ROOT
// ============================================================================

/// Read-only settings shared by every component of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanePilotConfig {
    pub network: NetworkConfig,
    pub camera: CameraConfig,
    pub vehicle: VehicleConfig,
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    pub graph: GraphConfig,
    pub actuator: ActuatorConfig,

    #[serde(default)]
    pub video: VideoConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl LanePilotConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.environment.num_lanes == 0 {
            return invalid("environment.num_lanes must be at least 1");
        }
        if !(self.camera.fov_deg > 0.0 && self.camera.fov_deg < 180.0) {
            return invalid("camera.fov_deg must be in (0, 180)");
        }
        if self.camera.resolution.contains(&0) {
            return invalid("camera.resolution must be non-zero");
        }
        if !(self.vehicle.height_cm > 0.0) {
            return invalid("vehicle.height_cm must be positive");
        }
        if self.graph.lane_tolerance < 0 || !(self.graph.max_distance_cm >= 0.0) {
            return invalid("graph.lane_tolerance and graph.max_distance_cm must be non-negative");
        }
        if !(0..=180).contains(&self.actuator.turning_degree) {
            return invalid("actuator.turning_degree must be in 0..=180");
        }
        if self.network.discovery_attempts == 0 {
            return invalid("network.discovery_attempts must be at least 1");
        }
        if self.network.liveness_interval_ms == 0 || self.network.reply_timeout_ms == 0 {
            return invalid("network intervals must be non-zero");
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            camera_fov_deg: self.camera.fov_deg,
            image_width_px: self.camera.resolution[0] as f64,
            image_height_px: self.camera.resolution[1] as f64,
            vehicle_height_cm: self.vehicle.height_cm,
            num_lanes: self.environment.num_lanes,
            normalization: self.environment.normalization_mode,
            cleanup_interval: Duration::from_millis(self.tracking.cleanup_interval_ms),
            cleanup_timeout: Duration::from_millis(self.tracking.cleanup_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proximity_graph::EdgeWeighting;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "network": { "discovery_port": 5000, "command_port": 5555 },
            "camera": { "fov_deg": 62.2, "resolution": [1280, 720] },
            "vehicle": { "height_cm": 6.0 },
            "environment": { "num_lanes": 3, "normalization_mode": "z_score" },
            "graph": { "lane_tolerance": 1, "max_distance_cm": 10.0, "weighting": "inverse" },
            "actuator": { "turning_degree": 30, "lane_servos": { "0": [1], "1": [2], "2": [3] } }
        })
    }

    #[test]
    fn test_minimal_config_with_defaults() {
        let config = LanePilotConfig::from_json(&sample().to_string()).unwrap();

        assert_eq!(config.graph.weighting, EdgeWeighting::Inverse);
        assert!(config.graph.bidirectional);
        assert_eq!(config.actuator.lane_servos[&2], vec![3]);
        assert_eq!(config.retry.policy().max_attempts, 5);
        assert_eq!(config.network.discovery().timeout, Duration::from_secs(10));
        assert_eq!(config.network.channel().liveness_interval, Duration::from_secs(30));

        let tracker = config.tracker_config();
        assert_eq!(tracker.image_height_px, 720.0);
        assert_eq!(tracker.normalization, NormalizationMode::ZScore);
        assert_eq!(tracker.cleanup_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_weighting_is_required() {
        let mut value = sample();
        value["graph"].as_object_mut().unwrap().remove("weighting");
        let err = LanePilotConfig::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(matches!(Fault::from(err), Fault::Configuration(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut value = sample();
        value["environment"]["num_lanes"] = json!(0);
        assert!(matches!(
            LanePilotConfig::from_json(&value.to_string()),
            Err(ConfigError::Invalid(_))
        ));

        let mut value = sample();
        value["actuator"]["turning_degree"] = json!(270);
        assert!(LanePilotConfig::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = LanePilotConfig::from_json(include_str!("../../config/lanepilot.json")).unwrap();
        assert_eq!(config.network.command_port, 5555);
        assert_eq!(config.actuator.lane_servos[&2], vec![3, 4]);
        assert!(!config.video.enabled);
    }

    #[test]
    fn test_missing_file() {
        let err = LanePilotConfig::load("/nonexistent/lanepilot.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
