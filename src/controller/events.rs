use super::health::HealthStatus;
use crate::{datatypes::camera_id::CameraId, util::event_bus};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Events fanned out to subscribers. Delivery is best-effort with
/// per-subscriber bounded queues; per-topic ordering is preserved per
/// subscriber.
#[derive(Clone, Debug)]
pub enum Event {
    CameraConnected {
        camera_id: CameraId,
        timestamp: DateTime<Utc>,
    },
    CameraDisconnected {
        camera_id: CameraId,
        timestamp: DateTime<Utc>,
    },
    RecordingStarted {
        camera_id: CameraId,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    RecordingStopped {
        camera_id: CameraId,
        session_id: String,
        duration: Duration,
        files: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    RecordingFailed {
        camera_id: CameraId,
        session_id: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SnapshotTaken {
        camera_id: CameraId,
        snapshot_id: String,
        file_name: String,
        size_bytes: u64,
        tier_used: u8,
        timestamp: DateTime<Utc>,
    },
    HealthChanged {
        status: HealthStatus,
        details: String,
        timestamp: DateTime<Utc>,
    },
}
impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::CameraConnected { .. } => "camera.connected",
            Event::CameraDisconnected { .. } => "camera.disconnected",
            Event::RecordingStarted { .. } => "recording.start",
            Event::RecordingStopped { .. } => "recording.stop",
            Event::RecordingFailed { .. } => "recording.error",
            Event::SnapshotTaken { .. } => "snapshot.taken",
            Event::HealthChanged { .. } => "system.health",
        }
    }
}

pub type Bus = event_bus::Bus<Event>;
pub type Subscriber = event_bus::Subscriber<Event>;

#[cfg(test)]
mod tests {
    use super::Event;
    use crate::datatypes::camera_id::CameraId;

    #[test]
    fn topics_match_wire_names() {
        let event = Event::CameraConnected {
            camera_id: CameraId::new(0),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.topic(), "camera.connected");

        let event = Event::RecordingFailed {
            camera_id: CameraId::new(1),
            session_id: None,
            reason: "device_disconnected".to_owned(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.topic(), "recording.error");
    }
}
