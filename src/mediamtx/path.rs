use anyhow::{Context, Error, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, time::Duration};

/// Container format for server-side recording.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordFormat {
    #[serde(rename = "fmp4")]
    Fmp4,
    #[serde(rename = "mp4")]
    Mp4,
}
impl RecordFormat {
    /// Extension of segment files the server produces for this format.
    /// The fmp4 container is written into `.mp4` files.
    pub fn segment_extension(&self) -> &'static str {
        "mp4"
    }
}
impl fmt::Display for RecordFormat {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            RecordFormat::Fmp4 => write!(f, "fmp4"),
            RecordFormat::Mp4 => write!(f, "mp4"),
        }
    }
}
impl std::str::FromStr for RecordFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fmp4" => Ok(RecordFormat::Fmp4),
            "mp4" => Ok(RecordFormat::Mp4),
            _ => bail!("unknown record format: {:?}", value),
        }
    }
}

/// Declarative path description sent to the media server. Every field is
/// optional; `add` sends the fields that are set, `patch` performs a
/// partial update. Keys this orchestrator does not model are carried in
/// `extra` verbatim, so a read-modify-write cycle never sheds them.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on_demand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on_demand_restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on_demand_close_after: Option<GoDuration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_format: Option<RecordFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_segment_duration: Option<GoDuration>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Discriminated reference to a stream endpoint (publisher or reader) as
/// reported by the server runtime API.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PathEndpoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// Observed state of one path. Derived, never authoritative; the strictly
/// typed schema is deliberate, unexpected shapes are reported by
/// [`runtime_state_parse`].
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathRuntimeState {
    pub name: String,
    #[serde(default)]
    pub conf_name: Option<String>,
    #[serde(default)]
    pub source: Option<PathEndpoint>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub readers: Vec<PathEndpoint>,
}

const RUNTIME_STATE_KEYS: &[&str] = &[
    "name",
    "confName",
    "source",
    "ready",
    "readyTime",
    "tracks",
    "bytesReceived",
    "bytesSent",
    "readers",
];

/// Parses a runtime path object, logging a warning for keys outside the
/// adopted schema instead of failing on them.
pub fn runtime_state_parse(value: serde_json::Value) -> Result<PathRuntimeState, Error> {
    if let Some(object) = value.as_object() {
        let known = RUNTIME_STATE_KEYS.iter().copied().collect::<HashSet<_>>();
        let unknown = object
            .keys()
            .filter(|key| !known.contains(key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            log::warn!(
                "path runtime state carries keys outside the adopted schema: {:?}",
                unknown
            );
        }
    }

    let state = serde_json::from_value::<PathRuntimeState>(value).context("from_value")?;

    Ok(state)
}

/// One page of a server list response.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ItemsPage<T> {
    #[serde(default)]
    pub item_count: u64,
    #[serde(default)]
    pub page_count: u64,
    pub items: Vec<T>,
}

/// Duration in the server's wire format (Go `time.Duration` strings like
/// `10s` or `1m30s`).
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(try_from = "GoDurationSerde")]
#[serde(into = "GoDurationSerde")]
pub struct GoDuration {
    inner: Duration,
}
impl GoDuration {
    pub fn new(inner: Duration) -> Self {
        Self { inner }
    }
    pub fn get(&self) -> Duration {
        self.inner
    }

    fn encode(&self) -> String {
        let millis = self.inner.as_millis();
        if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        }
    }
    fn parse(value: &str) -> Result<Self, Error> {
        static PATTERN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
            regex::Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?(?:(\d+)ms)?$").unwrap()
        });

        let captures = match PATTERN.captures(value) {
            Some(captures) => captures,
            None => bail!("malformed duration: {:?}", value),
        };
        if captures
            .iter()
            .skip(1)
            .all(|capture| capture.is_none())
        {
            bail!("malformed duration: {:?}", value);
        }

        let mut total = Duration::ZERO;
        if let Some(hours) = captures.get(1) {
            total += Duration::from_secs(hours.as_str().parse::<u64>()? * 3600);
        }
        if let Some(minutes) = captures.get(2) {
            total += Duration::from_secs(minutes.as_str().parse::<u64>()? * 60);
        }
        if let Some(seconds) = captures.get(3) {
            total += Duration::from_secs_f64(seconds.as_str().parse::<f64>()?);
        }
        if let Some(millis) = captures.get(4) {
            total += Duration::from_millis(millis.as_str().parse::<u64>()?);
        }

        Ok(Self { inner: total })
    }
}
impl From<Duration> for GoDuration {
    fn from(inner: Duration) -> Self {
        Self::new(inner)
    }
}
impl fmt::Display for GoDuration {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl TryFrom<GoDurationSerde> for GoDuration {
    type Error = Error;

    fn try_from(value: GoDurationSerde) -> Result<Self, Self::Error> {
        match value {
            GoDurationSerde::Text(text) => Self::parse(&text),
            GoDurationSerde::Nanoseconds(nanoseconds) => {
                Ok(Self::new(Duration::from_nanos(nanoseconds)))
            }
        }
    }
}
impl From<GoDuration> for GoDurationSerde {
    fn from(value: GoDuration) -> Self {
        GoDurationSerde::Text(value.encode())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GoDurationSerde {
    Text(String),
    Nanoseconds(u64),
}

#[cfg(test)]
mod tests_path_configuration {
    use super::PathConfiguration;

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = PathConfiguration {
            record: Some(true),
            record_path: Some("/var/recordings/camera0/%Y-%m-%d_%H-%M-%S-%f".to_owned()),
            ..Default::default()
        };

        let serialized = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            serialized,
            serde_json::json!({
                "record": true,
                "recordPath": "/var/recordings/camera0/%Y-%m-%d_%H-%M-%S-%f",
            })
        );
    }

    #[test]
    fn unknown_keys_survive_roundtrip() {
        let raw = serde_json::json!({
            "source": "rtsp://10.0.0.2/stream",
            "record": false,
            "sourceOnDemand": true,
            "maxReaders": 4,
        });

        let configuration: PathConfiguration = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(configuration.extra.len(), 2);

        let roundtripped = serde_json::to_value(&configuration).unwrap();
        assert_eq!(roundtripped, raw);
    }
}

#[cfg(test)]
mod tests_runtime_state {
    use super::runtime_state_parse;

    #[test]
    fn parses_strict_schema() {
        let state = runtime_state_parse(serde_json::json!({
            "name": "camera0",
            "confName": "camera0",
            "source": {"type": "rtspSession", "id": "abc"},
            "ready": true,
            "readyTime": "2025-06-01T12:00:00Z",
            "tracks": ["H264"],
            "bytesReceived": 1024,
            "bytesSent": 2048,
            "readers": [{"type": "rtspSession", "id": "def"}],
        }))
        .unwrap();

        assert_eq!(state.name, "camera0");
        assert!(state.ready);
        assert_eq!(state.source.as_ref().unwrap().kind, "rtspSession");
        assert_eq!(state.readers.len(), 1);
    }

    #[test]
    fn tolerates_unknown_keys() {
        let state = runtime_state_parse(serde_json::json!({
            "name": "camera1",
            "ready": false,
            "someFutureField": 42,
        }))
        .unwrap();

        assert_eq!(state.name, "camera1");
        assert!(!state.ready);
        assert!(state.ready_time.is_none());
    }
}
