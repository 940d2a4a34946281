use crate::mediamtx::path::RecordFormat;
use anyhow::{Context, Error, ensure};
use serde::Deserialize;
use serde_with::{DurationSecondsWithFrac, serde_as};
use std::{path::PathBuf, time::Duration};

/// Immutable process-wide configuration snapshot, deserialised once at
/// startup. Hot reload is out of scope.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    pub recordings: RecordingsConfig,
    pub snapshots: SnapshotsConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
}
impl Config {
    pub async fn load(path: &std::path::Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.context("read")?;
        let config = serde_json::from_str::<Self>(&contents).context("parse")?;
        config.validate().context("validate")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.server.api_base_url.starts_with("http://")
                || self.server.api_base_url.starts_with("https://"),
            "server.api_base_url must be http(s)"
        );
        ensure!(
            self.server.rtsp_base_url.starts_with("rtsp://"),
            "server.rtsp_base_url must be rtsp"
        );
        ensure!(
            self.recordings.root.is_absolute(),
            "recordings.root must be absolute"
        );
        ensure!(
            self.snapshots.root.is_absolute(),
            "snapshots.root must be absolute"
        );
        ensure!(
            self.health.failure_threshold > 0,
            "health.failure_threshold must be positive"
        );
        if let Some(segment_duration) = self.recordings.segment_duration {
            ensure!(
                segment_duration >= Duration::from_secs(1),
                "recordings.segment_duration below 1s"
            );
        }

        Ok(())
    }

    /// Recording defaults required before `StartRecording` is offered.
    /// Absent defaults are a configuration decision, not something to
    /// guess at runtime.
    pub fn recording_defaults(&self) -> Option<(RecordFormat, Duration)> {
        Some((
            self.recordings.format?,
            self.recordings.segment_duration?,
        ))
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub api_base_url: String,
    #[serde(default = "ServerConfig::health_path_default")]
    pub health_path: String,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "ServerConfig::request_timeout_default")]
    pub request_timeout: Duration,
    #[serde(default = "ServerConfig::retry_attempts_default")]
    pub retry_attempts: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "ServerConfig::retry_base_delay_default")]
    pub retry_base_delay: Duration,

    pub rtsp_base_url: String,
    #[serde(default)]
    pub hls_base_url: Option<String>,
    #[serde(default)]
    pub webrtc_base_url: Option<String>,
}
impl ServerConfig {
    fn health_path_default() -> String {
        "/v3/paths/list".to_owned()
    }
    fn request_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn retry_attempts_default() -> u32 {
        3
    }
    fn retry_base_delay_default() -> Duration {
        Duration::from_millis(500)
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "HealthConfig::enabled_default")]
    pub enabled: bool,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "HealthConfig::check_interval_default")]
    pub check_interval: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "HealthConfig::probe_timeout_default")]
    pub probe_timeout: Duration,
    #[serde(default = "HealthConfig::failure_threshold_default")]
    pub failure_threshold: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "HealthConfig::recovery_timeout_default")]
    pub recovery_timeout: Duration,
}
impl HealthConfig {
    fn enabled_default() -> bool {
        true
    }
    fn check_interval_default() -> Duration {
        Duration::from_secs(5)
    }
    fn probe_timeout_default() -> Duration {
        Duration::from_secs(5)
    }
    fn failure_threshold_default() -> u32 {
        3
    }
    fn recovery_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
}
impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: Self::enabled_default(),
            check_interval: Self::check_interval_default(),
            probe_timeout: Self::probe_timeout_default(),
            failure_threshold: Self::failure_threshold_default(),
            recovery_timeout: Self::recovery_timeout_default(),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StreamsConfig {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "StreamsConfig::on_demand_close_after_default")]
    pub on_demand_close_after: Duration,
    #[serde(default = "StreamsConfig::on_demand_restart_default")]
    pub on_demand_restart: bool,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "StreamsConfig::activation_timeout_default")]
    pub activation_timeout: Duration,
}
impl StreamsConfig {
    fn on_demand_close_after_default() -> Duration {
        Duration::from_secs(10)
    }
    fn on_demand_restart_default() -> bool {
        true
    }
    fn activation_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
}
impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            on_demand_close_after: Self::on_demand_close_after_default(),
            on_demand_restart: Self::on_demand_restart_default(),
            activation_timeout: Self::activation_timeout_default(),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RecordingsConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub format: Option<RecordFormat>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub segment_duration: Option<Duration>,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SnapshotsConfig {
    pub root: PathBuf,
    #[serde(default = "SnapshotsConfig::min_size_bytes_default")]
    pub min_size_bytes: u64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "SnapshotsConfig::tier_hardware_timeout_default")]
    pub tier_hardware_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "SnapshotsConfig::tier_transcoder_timeout_default")]
    pub tier_transcoder_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "SnapshotsConfig::tier_stream_timeout_default")]
    pub tier_stream_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "SnapshotsConfig::tier_activation_timeout_default")]
    pub tier_activation_timeout: Duration,
    #[serde(default)]
    pub retention: RetentionConfig,
}
impl SnapshotsConfig {
    fn min_size_bytes_default() -> u64 {
        1024
    }
    fn tier_hardware_timeout_default() -> Duration {
        Duration::from_secs(1)
    }
    fn tier_transcoder_timeout_default() -> Duration {
        Duration::from_secs(3)
    }
    fn tier_stream_timeout_default() -> Duration {
        Duration::from_secs(3)
    }
    fn tier_activation_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "RetentionConfig::sweep_interval_default")]
    pub sweep_interval: Duration,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub max_count: Option<usize>,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
}
impl RetentionConfig {
    fn sweep_interval_default() -> Duration {
        Duration::from_secs(600)
    }
}
impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Self::sweep_interval_default(),
            max_age: None,
            max_count: None,
            max_size_bytes: None,
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OperationsConfig {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "OperationsConfig::recording_start_timeout_default")]
    pub recording_start_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "OperationsConfig::stream_start_timeout_default")]
    pub stream_start_timeout: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "OperationsConfig::stop_timeout_default")]
    pub stop_timeout: Duration,
}
impl OperationsConfig {
    fn recording_start_timeout_default() -> Duration {
        Duration::from_secs(2)
    }
    fn stream_start_timeout_default() -> Duration {
        Duration::from_secs(3)
    }
    fn stop_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
}
impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            recording_start_timeout: Self::recording_start_timeout_default(),
            stream_start_timeout: Self::stream_start_timeout_default(),
            stop_timeout: Self::stop_timeout_default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TranscoderConfig {
    #[serde(default = "TranscoderConfig::ffmpeg_path_default")]
    pub ffmpeg_path: PathBuf,
}
impl TranscoderConfig {
    fn ffmpeg_path_default() -> PathBuf {
        PathBuf::from("/usr/bin/ffmpeg")
    }
}
impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: Self::ffmpeg_path_default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EventsConfig {
    #[serde(default = "EventsConfig::queue_capacity_default")]
    pub queue_capacity: usize,
}
impl EventsConfig {
    fn queue_capacity_default() -> usize {
        64
    }
}
impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::queue_capacity_default(),
        }
    }
}

#[serde_as]
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "DiscoveryConfig::scan_interval_default")]
    pub scan_interval: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    #[serde(default = "DiscoveryConfig::probe_timeout_default")]
    pub probe_timeout: Duration,
    /// IPv4 addresses or `a.b.c.d-e` final-octet ranges to scan.
    #[serde(default)]
    pub address_ranges: Vec<String>,
    /// Vendor-specific addresses probed in addition to the ranges.
    #[serde(default = "DiscoveryConfig::skydio_addresses_default")]
    pub skydio_addresses: Vec<String>,
    /// Stream paths attempted per candidate address.
    #[serde(default = "DiscoveryConfig::rtsp_paths_default")]
    pub rtsp_paths: Vec<String>,
    #[serde(default = "DiscoveryConfig::rtsp_port_default")]
    pub rtsp_port: u16,
}
impl DiscoveryConfig {
    fn scan_interval_default() -> Duration {
        Duration::from_secs(60)
    }
    fn probe_timeout_default() -> Duration {
        Duration::from_secs(3)
    }
    fn skydio_addresses_default() -> Vec<String> {
        vec!["192.168.42.1".to_owned()]
    }
    fn rtsp_paths_default() -> Vec<String> {
        vec!["/subject".to_owned(), "/live".to_owned()]
    }
    fn rtsp_port_default() -> u16 {
        554
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use std::time::Duration;

    fn minimal_config_json() -> serde_json::Value {
        serde_json::json!({
            "server": {
                "api_base_url": "http://127.0.0.1:9997",
                "rtsp_base_url": "rtsp://127.0.0.1:8554",
            },
            "recordings": {
                "root": "/var/lib/camera-orchestrator/recordings",
                "format": "fmp4",
                "segment_duration": 60,
            },
            "snapshots": {
                "root": "/var/lib/camera-orchestrator/snapshots",
            },
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config =
            serde_json::from_value::<Config>(minimal_config_json()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.health.check_interval, Duration::from_secs(5));
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.server.retry_attempts, 3);
        assert_eq!(config.snapshots.min_size_bytes, 1024);
        assert!(config.discovery.is_none());

        let (format, segment_duration) = config.recording_defaults().unwrap();
        assert_eq!(format.to_string(), "fmp4");
        assert_eq!(segment_duration, Duration::from_secs(60));
    }

    #[test]
    fn recording_defaults_require_both_fields() {
        let mut raw = minimal_config_json();
        raw["recordings"]
            .as_object_mut()
            .unwrap()
            .remove("segment_duration");

        let config = serde_json::from_value::<Config>(raw).unwrap();
        assert!(config.recording_defaults().is_none());
    }

    #[test]
    fn validate_rejects_relative_roots() {
        let mut raw = minimal_config_json();
        raw["recordings"]["root"] = serde_json::json!("relative/path");

        let config = serde_json::from_value::<Config>(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
