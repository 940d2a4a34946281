pub mod discovery;
pub mod error;
pub mod events;
pub mod health;
pub mod paths;
pub mod recording;
pub mod retention;
pub mod snapshot;
pub mod streams;

use crate::{
    config::Config,
    datatypes::{camera_id::CameraId, rtsp_url::RtspUrl},
    hardware::{self, HardwareEvent},
    mediamtx::api,
    transcoder::Transcoder,
    util::{
        async_flag,
        backoff::Backoff,
        fs::FileInfo,
        runnable::{Exited, Runnable},
    },
};
use anyhow::{Context as _, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error::OperationError;
use futures::{
    future::{Either, FutureExt},
    join, select,
    stream::StreamExt,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// One camera as shown to clients: identifier, source kind and per
/// transport URLs. Device paths never appear here.
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub camera_id: CameraId,
    pub source_kind: String,
    pub urls: streams::StreamUrls,
    pub hardware_snapshot_capable: bool,
}

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamStatusKind {
    #[display("IDLE")]
    Idle,
    #[display("READY_ON_DEMAND")]
    ReadyOnDemand,
    #[display("ACTIVE")]
    Active,
}

#[derive(Clone, Debug)]
pub struct StreamStatus {
    pub status: StreamStatusKind,
    pub url: Option<String>,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub readers: usize,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Clone, Debug)]
pub struct CameraStatus {
    pub info: CameraInfo,
    pub stream: StreamStatus,
    pub recording: Option<recording::Session>,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct StorageRootInfo {
    pub file_count: usize,
    pub size_bytes_total: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}
impl StorageRootInfo {
    fn from_files(files: &[FileInfo]) -> Self {
        Self {
            file_count: files.len(),
            size_bytes_total: files.iter().map(|file| file.size_bytes).sum(),
            oldest: files.iter().map(|file| file.modified).min(),
            newest: files.iter().map(|file| file.modified).max(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StorageInfo {
    pub recordings: StorageRootInfo,
    pub snapshots: StorageRootInfo,
}

#[derive(Clone, Debug)]
pub struct Metrics {
    pub health: health::StateSnapshot,
    pub cameras_bound: usize,
    pub paths_created: usize,
    pub path_mutations_total: u64,
    pub http_retries_total: u64,
    pub recordings_started_total: u64,
    pub recordings_stopped_total: u64,
    pub recordings_failed_total: u64,
    pub autostops_fired_total: u64,
    pub active_recordings: usize,
    pub snapshot_tier_hits: [u64; 4],
    pub snapshot_failures_total: u64,
    pub keepalives_active: usize,
    pub keepalives_started_total: u64,
    pub uptime: Duration,
}

#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub api_base_url: String,
    pub health: health::StateSnapshot,
    pub paths_total: usize,
}

/// Sole entry point for higher layers. Owns every subsystem, exposes the
/// camera-identifier-only API and the progressive-readiness contract:
/// operations before readiness fail with `NotReady`, never block.
pub struct Controller {
    config: Config,

    api: Arc<api::Client>,
    events: Arc<events::Bus>,

    health: Arc<health::Monitor>,
    paths: Arc<paths::Manager>,
    streams: Arc<streams::Manager>,
    recording: Arc<recording::Manager>,
    snapshot: Arc<snapshot::Manager>,
    discovery: Option<Arc<discovery::Manager>>,
    hardware: Arc<hardware::monitor::Monitor>,

    ready: AtomicBool,
    readiness_sender: async_flag::Sender,

    started_at: Instant,
}
impl Controller {
    pub fn new(config: Config) -> Result<Self, Error> {
        let api = api::Client::new(
            config.server.api_base_url.clone(),
            config.server.health_path.clone(),
            config.server.request_timeout,
            config.server.retry_attempts,
            Backoff::with_base(config.server.retry_base_delay),
        )
        .context("api")?;
        let api = Arc::new(api);

        let transcoder = Transcoder::new(&config.transcoder);
        let transcoder = Arc::new(transcoder);

        let events = events::Bus::new(config.events.queue_capacity);
        let events = Arc::new(events);

        let health = health::Monitor::new(config.health.clone(), api.clone(), events.clone());
        let health = Arc::new(health);

        let paths = paths::Manager::new(
            api.clone(),
            health.clone(),
            transcoder.clone(),
            config.server.rtsp_base_url.clone(),
            config.streams.clone(),
            config.health.check_interval,
        );
        let paths = Arc::new(paths);

        let streams = streams::Manager::new(
            paths.clone(),
            transcoder.clone(),
            config.server.hls_base_url.clone(),
            config.server.webrtc_base_url.clone(),
        );
        let streams = Arc::new(streams);

        let recording = recording::Manager::new(
            config.recordings.clone(),
            paths.clone(),
            streams.clone(),
            events.clone(),
        );
        let recording = Arc::new(recording);

        let snapshot = snapshot::Manager::new(
            config.snapshots.clone(),
            paths.clone(),
            transcoder.clone(),
            events.clone(),
        );
        let snapshot = Arc::new(snapshot);

        let discovery = config.discovery.clone().map(|discovery_config| {
            Arc::new(discovery::Manager::new(
                discovery_config,
                paths.clone(),
                transcoder.clone(),
            ))
        });

        let hardware = hardware::monitor::Monitor::new();
        let hardware = Arc::new(hardware);

        let readiness_sender = async_flag::Sender::new();

        Ok(Self {
            config,

            api,
            events,

            health,
            paths,
            streams,
            recording,
            snapshot,
            discovery,
            hardware,

            ready: AtomicBool::new(false),
            readiness_sender,

            started_at: Instant::now(),
        })
    }

    // readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
    fn ready_guard(&self) -> Result<(), OperationError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(OperationError::NotReady)
        }
    }
    /// One-shot notification fired on the NOT_READY → READY transition.
    pub fn readiness_subscribe(&self) -> async_flag::Receiver {
        self.readiness_sender.receiver()
    }

    pub fn events_subscribe(&self) -> events::Subscriber {
        self.events.subscribe()
    }

    async fn with_deadline<T>(
        &self,
        deadline: Duration,
        operation: impl Future<Output = Result<T, OperationError>>,
    ) -> Result<T, OperationError> {
        match tokio::time::timeout(deadline, operation).await {
            Ok(result) => result,
            Err(_) => Err(OperationError::Cancelled),
        }
    }

    // recording operations
    pub async fn recording_start(
        &self,
        camera_id: CameraId,
        options: recording::StartOptions,
    ) -> Result<recording::Session, OperationError> {
        self.ready_guard()?;

        self.with_deadline(
            self.config.operations.recording_start_timeout,
            self.recording.start(camera_id, options),
        )
        .await
    }
    pub async fn recording_stop(
        &self,
        camera_id: CameraId,
    ) -> Result<recording::StopOutcome, OperationError> {
        self.ready_guard()?;

        self.with_deadline(
            self.config.operations.stop_timeout,
            self.recording.stop(camera_id),
        )
        .await
    }
    pub async fn recording_status(
        &self,
        camera_id: CameraId,
    ) -> Result<Option<recording::Session>, OperationError> {
        self.recording.status(camera_id).await
    }
    pub async fn recordings_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<recording::RecordingInfo>, OperationError> {
        self.recording.recordings_list(limit, offset).await
    }
    pub async fn recording_info(
        &self,
        file_name: &str,
    ) -> Result<recording::RecordingInfo, OperationError> {
        self.recording.recording_info(file_name).await
    }
    pub async fn recording_delete(
        &self,
        file_name: &str,
    ) -> Result<(), OperationError> {
        self.recording.recording_delete(file_name).await
    }

    // snapshot operation
    pub async fn snapshot_take(
        &self,
        camera_id: CameraId,
        options: snapshot::Options,
    ) -> Result<snapshot::Snapshot, OperationError> {
        self.ready_guard()?;

        self.snapshot.take(camera_id, options).await
    }

    // streaming operations
    pub async fn streaming_start(
        &self,
        camera_id: CameraId,
    ) -> Result<streams::StreamUrls, OperationError> {
        self.ready_guard()?;

        self.with_deadline(
            self.config.operations.stream_start_timeout,
            self.streams.stream_start(camera_id),
        )
        .await
    }
    pub async fn streaming_stop(
        &self,
        camera_id: CameraId,
    ) -> Result<(), OperationError> {
        self.ready_guard()?;

        self.paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let path_name = camera_id.path_name();
        self.streams
            .keepalive_release(&path_name, streams::KeepaliveReason::Streaming)
            .await;

        // leave the path alone while a recording still depends on it
        let recording_active = self
            .recording
            .status(camera_id)
            .await?
            .is_some_and(|session| session.state == recording::SessionState::Recording);
        if !recording_active && self.streams.keepalive_count(&path_name).await == 0 {
            self.paths.path_delete(&path_name).await?;
        }

        Ok(())
    }
    pub async fn stream_status(
        &self,
        camera_id: CameraId,
    ) -> Result<StreamStatus, OperationError> {
        self.paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let path_name = camera_id.path_name();
        let runtime = self.paths.path_runtime_get(&path_name).await?;

        let status = match &runtime {
            None => StreamStatus {
                status: StreamStatusKind::Idle,
                url: None,
                ready: false,
                ready_time: None,
                readers: 0,
                bytes_received: 0,
                bytes_sent: 0,
            },
            Some(state) => StreamStatus {
                status: if state.ready {
                    StreamStatusKind::Active
                } else {
                    StreamStatusKind::ReadyOnDemand
                },
                url: Some(self.paths.rtsp_url_build(&path_name)),
                ready: state.ready,
                ready_time: state.ready_time,
                readers: state.readers.len(),
                bytes_received: state.bytes_received,
                bytes_sent: state.bytes_sent,
            },
        };

        Ok(status)
    }

    // camera views
    fn camera_info_build(
        &self,
        camera_id: CameraId,
        source: &paths::CameraSource,
    ) -> CameraInfo {
        CameraInfo {
            camera_id,
            source_kind: source.kind().to_owned(),
            urls: self.streams.stream_urls_build(&camera_id.path_name()),
            hardware_snapshot_capable: source.is_local(),
        }
    }

    pub fn camera_list(&self) -> Vec<CameraInfo> {
        self.paths
            .cameras_list()
            .into_iter()
            .map(|(camera_id, source)| self.camera_info_build(camera_id, &source))
            .collect()
    }

    pub async fn camera_status(
        &self,
        camera_id: CameraId,
    ) -> Result<CameraStatus, OperationError> {
        let source = self
            .paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let info = self.camera_info_build(camera_id, &source);
        let stream = self.stream_status(camera_id).await?;
        let recording = self.recording.status(camera_id).await?;

        Ok(CameraStatus {
            info,
            stream,
            recording,
        })
    }

    // status views
    pub fn health_get(&self) -> health::StateSnapshot {
        self.health.snapshot()
    }
    pub fn health_subscribe(&self) -> crate::util::event_bus::Subscriber<health::StateSnapshot> {
        self.health.subscribe()
    }

    pub async fn metrics_get(&self) -> Metrics {
        let (started, stopped, failed, autostops) = self.recording.counters();

        Metrics {
            health: self.health.snapshot(),
            cameras_bound: self.paths.cameras_count(),
            paths_created: self.paths.created_paths_count(),
            path_mutations_total: self.paths.mutations_total(),
            http_retries_total: self.api.retries_total(),
            recordings_started_total: started,
            recordings_stopped_total: stopped,
            recordings_failed_total: failed,
            autostops_fired_total: autostops,
            active_recordings: self.recording.active_sessions_count(),
            snapshot_tier_hits: self.snapshot.tier_hits(),
            snapshot_failures_total: self.snapshot.failures_total(),
            keepalives_active: self.streams.keepalives_active().await,
            keepalives_started_total: self.streams.keepalives_started_total(),
            uptime: self.started_at.elapsed(),
        }
    }

    pub async fn storage_info_get(&self) -> Result<StorageInfo, OperationError> {
        let recordings = self.recording.storage_files().await?;
        let snapshots = self.snapshot.storage_files().await?;

        Ok(StorageInfo {
            recordings: StorageRootInfo::from_files(&recordings),
            snapshots: StorageRootInfo::from_files(&snapshots),
        })
    }

    pub async fn server_info_get(&self) -> Result<ServerInfo, OperationError> {
        let paths_total = self.paths.paths_runtime_list().await?.len();

        Ok(ServerInfo {
            api_base_url: self.api.base_url().to_owned(),
            health: self.health.snapshot(),
            paths_total,
        })
    }

    // external streams
    pub async fn external_streams_discover(&self) -> Result<usize, OperationError> {
        self.ready_guard()?;

        let discovery = self
            .discovery
            .as_ref()
            .ok_or(OperationError::NotConfigured)?;

        discovery
            .scan_once()
            .await
            .map_err(|source| OperationError::Internal { source })
    }
    pub async fn external_stream_add(
        &self,
        name: String,
        url: RtspUrl,
        kind: String,
    ) -> Result<discovery::ExternalStream, OperationError> {
        self.ready_guard()?;

        let discovery = self
            .discovery
            .as_ref()
            .ok_or(OperationError::NotConfigured)?;

        discovery.stream_add(name, url, kind).await
    }
    pub async fn external_stream_remove(
        &self,
        url: &str,
    ) -> Result<(), OperationError> {
        self.ready_guard()?;

        let discovery = self
            .discovery
            .as_ref()
            .ok_or(OperationError::NotConfigured)?;

        discovery.stream_remove(url).await
    }
    /// Unlike the mutating operations this one degrades to an empty list
    /// when discovery is absent.
    pub fn external_streams_get(&self) -> Vec<discovery::ExternalStream> {
        match &self.discovery {
            Some(discovery) => discovery.streams_list(),
            None => Vec::new(),
        }
    }

    // lifecycle
    async fn startup(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Result<(), Exited> {
        const ERROR_DELAY: Duration = Duration::from_secs(5);

        // storage roots; retried, nothing else works without them
        loop {
            let result: Result<(), Error> = async {
                tokio::fs::create_dir_all(&self.config.recordings.root)
                    .await
                    .context("recordings root")?;
                tokio::fs::create_dir_all(&self.config.snapshots.root)
                    .await
                    .context("snapshots root")?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => break,
                Err(error) => log::error!("{}: storage preparation: {:?}", self, error),
            }

            select! {
                () = tokio::time::sleep(ERROR_DELAY).fuse() => {},
                () = exit_flag => return Err(Exited),
            }
        }

        // seed the camera directory from present hardware
        match self.hardware.initial_scan().await {
            Ok(devices) => {
                for device_path in devices {
                    let camera_id = self.paths.camera_register_local(&device_path);
                    self.events.publish(events::Event::CameraConnected {
                        camera_id,
                        timestamp: Utc::now(),
                    });
                }
            }
            Err(error) => log::warn!("{}: hardware scan failed: {:?}", self, error),
        }

        // adopt server-side paths; the server being down must not block
        // readiness, the health monitor will surface it
        match self.paths.reconcile().await {
            Ok(adopted) => {
                for (camera_id, configuration) in adopted {
                    self.recording
                        .reconcile_from_configuration(camera_id, &configuration);
                }
            }
            Err(error) => log::warn!("{}: server reconciliation failed: {}", self, error),
        }

        Ok(())
    }

    async fn hardware_events_run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        let mut receiver = self.hardware.event_receiver_take();

        loop {
            let event = select! {
                event = receiver.next() => match event {
                    Some(event) => event,
                    None => break,
                },
                () = exit_flag => break,
            };

            match event {
                HardwareEvent::Connected { device_path } => {
                    let camera_id = self.paths.camera_register_local(&device_path);
                    self.events.publish(events::Event::CameraConnected {
                        camera_id,
                        timestamp: Utc::now(),
                    });
                }
                HardwareEvent::Disconnected { device_path } => {
                    let camera_id = match self.paths.camera_for_device(&device_path) {
                        Some(camera_id) => camera_id,
                        None => continue,
                    };

                    self.recording.device_disconnected(camera_id).await;

                    let path_name = camera_id.path_name();
                    self.streams
                        .keepalive_release(&path_name, streams::KeepaliveReason::Recording)
                        .await;
                    if let Err(error) = self.paths.path_delete(&path_name).await {
                        log::warn!("{}: path removal for {}: {}", self, camera_id, error);
                    }
                    self.paths.camera_unregister(camera_id);

                    self.events.publish(events::Event::CameraDisconnected {
                        camera_id,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        Exited
    }

    /// Releases server-side artifacts this instance owns: active
    /// recordings are stopped, keepalives torn down, created paths
    /// deleted. Best-effort within the configured stop deadline.
    async fn shutdown_cleanup(&self) {
        for session in self.recording.sessions_snapshot() {
            if session.state != recording::SessionState::Recording {
                continue;
            }
            match self.recording.stop(session.camera_id).await {
                Ok(_) => {}
                Err(OperationError::NotRecording { .. }) => {}
                Err(error) => {
                    log::warn!(
                        "{}: failed to stop recording on {}: {}",
                        self,
                        session.camera_id,
                        error
                    );
                }
            }
        }

        self.streams.keepalive_teardown_all().await;
        self.paths.shutdown_cleanup().await;
    }

    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        if self.startup(exit_flag.clone()).await.is_err() {
            return Exited;
        }

        self.ready.store(true, Ordering::SeqCst);
        self.readiness_sender.signal();
        log::info!("{}: ready", self);

        let health_runner = Runnable::run(self.health.as_ref(), exit_flag.clone());
        let hardware_runner = Runnable::run(self.hardware.as_ref(), exit_flag.clone());
        let recording_runner = Runnable::run(self.recording.as_ref(), exit_flag.clone());
        let snapshot_runner = Runnable::run(self.snapshot.as_ref(), exit_flag.clone());
        let discovery_runner = match &self.discovery {
            Some(discovery) => Either::Left(Runnable::run(discovery.as_ref(), exit_flag.clone())),
            None => Either::Right(exit_flag.clone().map(|()| Exited)),
        };
        let events_runner = self.hardware_events_run(exit_flag.clone());

        let _: (Exited, Exited, Exited, Exited, Exited, Exited) = join!(
            health_runner,
            hardware_runner,
            recording_runner,
            snapshot_runner,
            discovery_runner,
            events_runner,
        );

        self.ready.store(false, Ordering::SeqCst);

        match tokio::time::timeout(self.config.operations.stop_timeout, self.shutdown_cleanup())
            .await
        {
            Ok(()) => log::info!("{}: shutdown cleanup complete", self),
            Err(_) => log::warn!(
                "{}: shutdown deadline expired, remaining cleanup abandoned",
                self
            ),
        }

        Exited
    }
}
#[async_trait]
impl Runnable for Controller {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for Controller {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Controller")
    }
}

#[cfg(test)]
mod tests {
    use super::{Controller, StreamStatusKind, error::OperationError};
    use crate::{config::Config, datatypes::camera_id::CameraId};

    fn config_build() -> Config {
        serde_json::from_value(serde_json::json!({
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
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn operations_before_readiness_fail_typed() {
        let controller = Controller::new(config_build()).unwrap();

        assert!(!controller.is_ready());
        let error = controller
            .recording_start(CameraId::new(0), Default::default())
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::NotReady));
        assert_eq!(error.code(), "NOT_READY");
    }

    #[tokio::test]
    async fn external_operations_without_discovery() {
        let controller = Controller::new(config_build()).unwrap();

        // reads degrade gracefully even when not configured
        assert!(controller.external_streams_get().is_empty());

        // mutations are gated by readiness first, then configuration;
        // bypass readiness via the internal flag for the check
        controller
            .ready
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let error = controller
            .external_stream_add(
                "x".to_owned(),
                "rtsp://h/s".parse().unwrap(),
                "generic".to_owned(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::NotConfigured));
    }

    #[test]
    fn stream_status_kinds_render() {
        assert_eq!(StreamStatusKind::Idle.to_string(), "IDLE");
        assert_eq!(StreamStatusKind::ReadyOnDemand.to_string(), "READY_ON_DEMAND");
        assert_eq!(StreamStatusKind::Active.to_string(), "ACTIVE");
    }

    #[test]
    fn camera_list_shows_identifiers_never_devices() {
        let controller = Controller::new(config_build()).unwrap();

        controller.paths.camera_register_local("/dev/video0");
        controller.paths.camera_register_local("/dev/video2");

        let cameras = controller.camera_list();
        assert_eq!(cameras.len(), 2);

        assert_eq!(cameras[0].camera_id, CameraId::new(0));
        assert_eq!(cameras[0].source_kind, "local");
        assert!(cameras[0].hardware_snapshot_capable);
        assert_eq!(cameras[0].urls.rtsp, "rtsp://127.0.0.1:8554/camera0");
        assert!(cameras[0].urls.hls.is_none());

        assert_eq!(cameras[1].camera_id, CameraId::new(2));

        // the device locator stays internal to the path manager
        assert_eq!(
            controller.paths.camera_for_device("/dev/video0"),
            Some(CameraId::new(0))
        );
    }

    #[tokio::test]
    async fn readiness_notification_fires_on_subscribe_after_ready() {
        use futures::FutureExt;

        let controller = Controller::new(config_build()).unwrap();

        let receiver = controller.readiness_subscribe();
        assert!(receiver.now_or_never().is_none());

        controller.readiness_sender.signal();
        let receiver = controller.readiness_subscribe();
        assert!(receiver.now_or_never().is_some());
    }
}
