use super::{
    error::OperationError,
    events::{Bus as EventBus, Event},
    paths,
    retention::{CleanupOutcome, RetentionPolicy, deletion_plan},
    streams::{self, KeepaliveReason},
};
use crate::{
    config::RecordingsConfig,
    datatypes::camera_id::CameraId,
    mediamtx::path::RecordFormat,
    util::{
        async_flag, event_bus,
        fs::{FileInfo, directory_dirs_scan, directory_files_scan, path_inside_root},
        runnable::{Exited, Runnable},
        token_generate,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    future::{Either, FutureExt},
    join, pin_mut, select,
    stream::StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    #[display("RECORDING")]
    Recording,
    #[display("STOPPED")]
    Stopped,
    #[display("ERROR")]
    Error,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionOrigin {
    Fresh,
    Reconciled,
}

/// In-memory recording handle. The server's `record` flag stays
/// authoritative; this record carries identifiers and timing only.
#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: String,
    pub camera_id: CameraId,
    pub path_name: String,
    pub state: SessionState,
    pub origin: SessionOrigin,
    pub started_at: DateTime<Utc>,
    pub duration_limit: Option<Duration>,
    pub format: RecordFormat,
    pub segment_duration: Duration,
    pub record_path_template: String,
}

#[derive(Clone, Default, Debug)]
pub struct StartOptions {
    pub format: Option<RecordFormat>,
    pub segment_duration: Option<Duration>,
    /// Auto-stop after this much recording time. `None` records until an
    /// explicit stop.
    pub duration: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct StopOutcome {
    pub session: Session,
    pub duration: Duration,
    pub files: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RecordingInfo {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug)]
struct Autostop {
    camera_id: CameraId,
    deadline: tokio::time::Instant,
}

/// Recording lifecycle without local durable state. Stop conditions:
/// explicit stop, auto-stop timer, device disconnect.
pub struct Manager {
    config: RecordingsConfig,
    paths: Arc<paths::Manager>,
    streams: Arc<streams::Manager>,
    events: Arc<EventBus>,

    sessions: Mutex<HashMap<CameraId, Session>>,
    operation_locks: Mutex<HashMap<CameraId, Arc<tokio::sync::Mutex<()>>>>,

    autostops: Mutex<HashMap<String, Autostop>>,
    autostop_nudge: event_bus::Bus<()>,

    started_total: AtomicU64,
    stopped_total: AtomicU64,
    failed_total: AtomicU64,
    autostops_fired_total: AtomicU64,
}
impl Manager {
    pub fn new(
        config: RecordingsConfig,
        paths: Arc<paths::Manager>,
        streams: Arc<streams::Manager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            paths,
            streams,
            events,

            sessions: Mutex::new(HashMap::new()),
            operation_locks: Mutex::new(HashMap::new()),

            autostops: Mutex::new(HashMap::new()),
            autostop_nudge: event_bus::Bus::new(4),

            started_total: AtomicU64::new(0),
            stopped_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            autostops_fired_total: AtomicU64::new(0),
        }
    }

    fn operation_lock(
        &self,
        camera_id: CameraId,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.operation_locks
            .lock()
            .entry(camera_id)
            .or_default()
            .clone()
    }

    fn record_path_template_build(
        &self,
        path_name: &str,
    ) -> String {
        format!(
            "{}/{}/%Y-%m-%d_%H-%M-%S-%f",
            self.config.root.display(),
            path_name
        )
    }

    // lifecycle
    pub async fn start(
        &self,
        camera_id: CameraId,
        options: StartOptions,
    ) -> Result<Session, OperationError> {
        let lock = self.operation_lock(camera_id);
        let _guard = lock.lock().await;

        self.paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let format = options.format.or(self.config.format).ok_or_else(|| {
            OperationError::InvalidFormat {
                message: "no format requested and no default configured".to_owned(),
            }
        })?;
        let segment_duration = options
            .segment_duration
            .or(self.config.segment_duration)
            .ok_or_else(|| OperationError::InvalidFormat {
                message: "no segment duration requested and no default configured".to_owned(),
            })?;

        if self
            .sessions
            .lock()
            .get(&camera_id)
            .is_some_and(|session| session.state == SessionState::Recording)
        {
            return Err(OperationError::AlreadyRecording { camera_id });
        }

        let path_name = self.paths.path_ensure(camera_id).await?;

        // the server is authoritative; a path already recording means a
        // previous instance (or operator) started it
        let server_configuration = self.paths.path_config_get(&path_name).await?;
        if server_configuration.is_some_and(|configuration| configuration.record == Some(true)) {
            self.session_adopt_reconciled(camera_id, &path_name, format, segment_duration);
            return Err(OperationError::AlreadyRecording { camera_id });
        }

        let record_path_template = self.record_path_template_build(&path_name);
        self.streams
            .recording_enable(
                &path_name,
                record_path_template.clone(),
                format,
                segment_duration,
            )
            .await?;

        // recording alone is not a consumer; the keepalive makes the
        // server fire its on-demand publisher
        self.streams
            .keepalive_acquire(&path_name, KeepaliveReason::Recording)
            .await;

        let session = Session {
            session_id: token_generate(),
            camera_id,
            path_name: path_name.clone(),
            state: SessionState::Recording,
            origin: SessionOrigin::Fresh,
            started_at: Utc::now(),
            duration_limit: options.duration,
            format,
            segment_duration,
            record_path_template,
        };
        self.sessions.lock().insert(camera_id, session.clone());

        if let Some(duration) = options.duration
            && !duration.is_zero()
        {
            self.autostop_schedule(session.session_id.clone(), camera_id, duration);
        }

        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::RecordingStarted {
            camera_id,
            session_id: session.session_id.clone(),
            timestamp: session.started_at,
        });
        log::info!("{}: {} started ({})", self, camera_id, session.session_id);

        Ok(session)
    }

    pub async fn stop(
        &self,
        camera_id: CameraId,
    ) -> Result<StopOutcome, OperationError> {
        let lock = self.operation_lock(camera_id);
        let _guard = lock.lock().await;

        self.paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let path_name = camera_id.path_name();

        let server_recording = self
            .paths
            .path_config_get(&path_name)
            .await?
            .is_some_and(|configuration| configuration.record == Some(true));
        let session_active = self
            .sessions
            .lock()
            .get(&camera_id)
            .is_some_and(|session| session.state == SessionState::Recording);

        if !server_recording && !session_active {
            return Err(OperationError::NotRecording { camera_id });
        }

        // recording started outside this process: adopt before stopping so
        // the outcome has a session to report
        if !session_active {
            let format = self.config.format.unwrap_or(RecordFormat::Fmp4);
            let segment_duration = self
                .config
                .segment_duration
                .unwrap_or(Duration::from_secs(60));
            self.session_adopt_reconciled(camera_id, &path_name, format, segment_duration);
        }

        self.streams.recording_disable(&path_name).await?;

        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&camera_id).unwrap();
            session.state = SessionState::Stopped;
            session.clone()
        };

        self.autostop_cancel(&session.session_id);
        self.streams
            .keepalive_release(&path_name, KeepaliveReason::Recording)
            .await;

        let files = match self
            .session_segments_scan(&path_name, session.started_at)
            .await
        {
            Ok(files) => files,
            Err(error) => {
                log::warn!("{}: segment enumeration failed: {}", self, error);
                Vec::new()
            }
        };

        let duration = (Utc::now() - session.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        self.stopped_total.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::RecordingStopped {
            camera_id,
            session_id: session.session_id.clone(),
            duration,
            files: files.clone(),
            timestamp: Utc::now(),
        });
        log::info!("{}: {} stopped ({})", self, camera_id, session.session_id);

        Ok(StopOutcome {
            session,
            duration,
            files,
        })
    }

    /// Displayed state is reconciled with the server's live `record`
    /// flag on every query.
    pub async fn status(
        &self,
        camera_id: CameraId,
    ) -> Result<Option<Session>, OperationError> {
        let session = match self.sessions.lock().get(&camera_id).cloned() {
            Some(session) => session,
            None => return Ok(None),
        };

        if session.state != SessionState::Recording {
            return Ok(Some(session));
        }

        let server_recording = self
            .paths
            .path_config_get(&session.path_name)
            .await?
            .is_some_and(|configuration| configuration.record == Some(true));

        if server_recording {
            return Ok(Some(session));
        }

        // stopped behind our back; align the local view
        let session = {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&camera_id).unwrap();
            session.state = SessionState::Stopped;
            session.clone()
        };
        self.autostop_cancel(&session.session_id);

        Ok(Some(session))
    }

    pub fn sessions_snapshot(&self) -> Vec<Session> {
        let mut sessions = self.sessions.lock().values().cloned().collect::<Vec<_>>();
        sessions.sort_by_key(|session| session.camera_id);
        sessions
    }
    pub fn active_sessions_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.state == SessionState::Recording)
            .count()
    }

    fn session_adopt_reconciled(
        &self,
        camera_id: CameraId,
        path_name: &str,
        format: RecordFormat,
        segment_duration: Duration,
    ) -> Session {
        let session = Session {
            session_id: token_generate(),
            camera_id,
            path_name: path_name.to_owned(),
            state: SessionState::Recording,
            origin: SessionOrigin::Reconciled,
            started_at: Utc::now(),
            duration_limit: None,
            format,
            segment_duration,
            record_path_template: self.record_path_template_build(path_name),
        };
        self.sessions.lock().insert(camera_id, session.clone());
        log::info!(
            "{}: adopted server-side recording on {} as {}",
            self,
            camera_id,
            session.session_id
        );
        session
    }

    /// Startup reconciliation entry: a server path with `record=true` gets
    /// a reconciled session so explicit stop works across restarts.
    pub fn reconcile_from_configuration(
        &self,
        camera_id: CameraId,
        configuration: &crate::mediamtx::path::PathConfiguration,
    ) {
        if configuration.record != Some(true) {
            return;
        }

        let format = configuration
            .record_format
            .or(self.config.format)
            .unwrap_or(RecordFormat::Fmp4);
        let segment_duration = configuration
            .record_segment_duration
            .map(|duration| duration.get())
            .or(self.config.segment_duration)
            .unwrap_or(Duration::from_secs(60));

        self.session_adopt_reconciled(camera_id, &camera_id.path_name(), format, segment_duration);
    }

    /// Device vanished under an active session: fail the session and turn
    /// the server flag off best-effort.
    pub async fn device_disconnected(
        &self,
        camera_id: CameraId,
    ) {
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&camera_id) {
                Some(session) if session.state == SessionState::Recording => {
                    session.state = SessionState::Error;
                    session.clone()
                }
                _ => return,
            }
        };

        self.autostop_cancel(&session.session_id);

        if let Err(error) = self.streams.recording_disable(&session.path_name).await {
            log::warn!(
                "{}: failed to clear record flag for {}: {}",
                self,
                camera_id,
                error
            );
        }
        self.streams
            .keepalive_release(&session.path_name, KeepaliveReason::Recording)
            .await;

        self.failed_total.fetch_add(1, Ordering::Relaxed);
        self.events.publish(Event::RecordingFailed {
            camera_id,
            session_id: Some(session.session_id.clone()),
            reason: "device_disconnected".to_owned(),
            timestamp: Utc::now(),
        });
        log::warn!(
            "{}: {} failed, device disconnected ({})",
            self,
            camera_id,
            session.session_id
        );
    }

    // auto-stop timers
    fn autostop_schedule(
        &self,
        session_id: String,
        camera_id: CameraId,
        after: Duration,
    ) {
        let autostop = Autostop {
            camera_id,
            deadline: tokio::time::Instant::now() + after,
        };
        self.autostops.lock().insert(session_id, autostop);
        self.autostop_nudge.publish(());
    }
    fn autostop_cancel(
        &self,
        session_id: &str,
    ) {
        if self.autostops.lock().remove(session_id).is_some() {
            self.autostop_nudge.publish(());
        }
    }

    async fn autostop_run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        let mut nudges = self.autostop_nudge.subscribe();

        loop {
            let next_deadline = self
                .autostops
                .lock()
                .values()
                .map(|autostop| autostop.deadline)
                .min();

            let sleeper = match next_deadline {
                Some(deadline) => Either::Left(tokio::time::sleep_until(deadline)),
                None => Either::Right(futures::future::pending::<()>()),
            };
            pin_mut!(sleeper);
            let mut sleeper = sleeper.fuse();

            select! {
                () = sleeper => {
                    let now = tokio::time::Instant::now();
                    let due = {
                        let mut autostops = self.autostops.lock();
                        let due = autostops
                            .iter()
                            .filter(|(_, autostop)| autostop.deadline <= now)
                            .map(|(session_id, autostop)| {
                                (session_id.clone(), autostop.camera_id)
                            })
                            .collect::<Vec<_>>();
                        for (session_id, _) in due.iter() {
                            autostops.remove(session_id);
                        }
                        due
                    };

                    for (session_id, camera_id) in due {
                        self.autostops_fired_total.fetch_add(1, Ordering::Relaxed);
                        log::info!("{}: auto-stop for {} ({})", self, camera_id, session_id);
                        match self.stop(camera_id).await {
                            Ok(_) => {}
                            Err(OperationError::NotRecording { .. }) => {}
                            Err(error) => {
                                log::error!("{}: auto-stop failed for {}: {}", self, camera_id, error);
                            }
                        }
                    }
                },
                _ = nudges.next() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }

    // filesystem views
    async fn files_all_scan(&self) -> Result<Vec<FileInfo>, OperationError> {
        let mut files = Vec::new();

        let camera_directories = directory_dirs_scan(&self.config.root)
            .await
            .map_err(|error| OperationError::Filesystem {
                message: format!("{error:#}"),
            })?;
        for directory in camera_directories {
            let mut directory_files = directory_files_scan(&directory).await.map_err(|error| {
                OperationError::Filesystem {
                    message: format!("{error:#}"),
                }
            })?;
            files.append(&mut directory_files);
        }

        Ok(files)
    }

    fn file_name_relative(
        &self,
        file: &FileInfo,
    ) -> String {
        file.path
            .strip_prefix(&self.config.root)
            .unwrap_or(&file.path)
            .to_string_lossy()
            .into_owned()
    }

    async fn session_segments_scan(
        &self,
        path_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, OperationError> {
        let directory = self.config.root.join(path_name);
        let mut files = directory_files_scan(&directory).await.map_err(|error| {
            OperationError::Filesystem {
                message: format!("{error:#}"),
            }
        })?;

        files.retain(|file| file.modified >= since);
        files.sort_by_key(|file| file.modified);

        Ok(files
            .iter()
            .map(|file| self.file_name_relative(file))
            .collect())
    }

    pub async fn recordings_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordingInfo>, OperationError> {
        let mut files = self.files_all_scan().await?;
        files.sort_by_key(|file| std::cmp::Reverse(file.modified));

        Ok(files
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|file| RecordingInfo {
                file_name: self.file_name_relative(&file),
                size_bytes: file.size_bytes,
                modified: file.modified,
            })
            .collect())
    }

    pub async fn recording_info(
        &self,
        file_name: &str,
    ) -> Result<RecordingInfo, OperationError> {
        let path = path_inside_root(&self.config.root, file_name).map_err(|error| {
            OperationError::InvalidOptions {
                message: format!("{error:#}"),
            }
        })?;

        let metadata =
            tokio::fs::metadata(&path)
                .await
                .map_err(|error| OperationError::Filesystem {
                    message: format!("{file_name}: {error}"),
                })?;
        if !metadata.is_file() {
            return Err(OperationError::Filesystem {
                message: format!("{file_name}: not a file"),
            });
        }

        Ok(RecordingInfo {
            file_name: file_name.to_owned(),
            size_bytes: metadata.len(),
            modified: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub async fn recording_delete(
        &self,
        file_name: &str,
    ) -> Result<(), OperationError> {
        let path = path_inside_root(&self.config.root, file_name).map_err(|error| {
            OperationError::InvalidOptions {
                message: format!("{error:#}"),
            }
        })?;

        tokio::fs::remove_file(&path)
            .await
            .map_err(|error| OperationError::Filesystem {
                message: format!("{file_name}: {error}"),
            })?;

        Ok(())
    }

    pub async fn storage_files(&self) -> Result<Vec<FileInfo>, OperationError> {
        self.files_all_scan().await
    }

    pub async fn cleanup_run(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<CleanupOutcome, OperationError> {
        let files = self.files_all_scan().await?;
        let plan = deletion_plan(&files, Utc::now(), policy);

        let mut outcome = CleanupOutcome::default();
        for file in plan {
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    outcome.files_removed += 1;
                    outcome.bytes_freed += file.size_bytes;
                }
                Err(error) => {
                    log::warn!("{}: cleanup failed for {:?}: {}", self, file.path, error);
                }
            }
        }

        Ok(outcome)
    }

    async fn retention_run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        let policy = RetentionPolicy {
            max_age: self.config.retention.max_age,
            max_count: self.config.retention.max_count,
            max_size_bytes: self.config.retention.max_size_bytes,
        };

        loop {
            select! {
                () = tokio::time::sleep(self.config.retention.sweep_interval).fuse() => {},
                () = exit_flag => break,
            }

            if policy.is_unbounded() {
                continue;
            }

            match self.cleanup_run(&policy).await {
                Ok(outcome) if outcome.files_removed > 0 => {
                    log::info!(
                        "{}: retention removed {} files ({} bytes)",
                        self,
                        outcome.files_removed,
                        outcome.bytes_freed
                    );
                }
                Ok(_) => {}
                Err(error) => log::error!("{}: retention sweep failed: {}", self, error),
            }
        }

        Exited
    }

    // metrics
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.started_total.load(Ordering::Relaxed),
            self.stopped_total.load(Ordering::Relaxed),
            self.failed_total.load(Ordering::Relaxed),
            self.autostops_fired_total.load(Ordering::Relaxed),
        )
    }

    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        let autostop_runner = self.autostop_run(exit_flag.clone());
        let retention_runner = self.retention_run(exit_flag.clone());
        let _: (Exited, Exited) = join!(autostop_runner, retention_runner);

        Exited
    }
}
#[async_trait]
impl Runnable for Manager {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "recording::Manager")
    }
}

#[cfg(test)]
mod tests {
    use super::{Manager, SessionOrigin, SessionState, StartOptions};
    use crate::{
        config::{
            HealthConfig, RecordingsConfig, RetentionConfig, StreamsConfig, TranscoderConfig,
        },
        controller::{error::OperationError, events, health, paths, streams},
        datatypes::camera_id::CameraId,
        mediamtx::{
            api,
            path::{PathConfiguration, RecordFormat},
        },
        transcoder::Transcoder,
        util::backoff::Backoff,
    };
    use std::{path::PathBuf, sync::Arc, time::Duration};

    fn manager_build(
        format: Option<RecordFormat>,
        segment_duration: Option<Duration>,
    ) -> (Arc<paths::Manager>, Manager) {
        let api = Arc::new(
            api::Client::new(
                "http://127.0.0.1:9997".to_owned(),
                "/v3/paths/list".to_owned(),
                Duration::from_secs(1),
                0,
                Backoff::with_base(Duration::from_millis(100)),
            )
            .unwrap(),
        );
        let events = Arc::new(events::Bus::new(8));
        let health = Arc::new(health::Monitor::new(
            HealthConfig::default(),
            api.clone(),
            events.clone(),
        ));
        let transcoder = Arc::new(Transcoder::new(&TranscoderConfig::default()));
        let paths = Arc::new(paths::Manager::new(
            api,
            health,
            transcoder.clone(),
            "rtsp://127.0.0.1:8554".to_owned(),
            StreamsConfig::default(),
            Duration::from_secs(5),
        ));
        let streams = Arc::new(streams::Manager::new(paths.clone(), transcoder, None, None));

        let config = RecordingsConfig {
            root: PathBuf::from("/var/lib/camera-orchestrator/recordings"),
            format,
            segment_duration,
            retention: RetentionConfig::default(),
        };
        let manager = Manager::new(config, paths.clone(), streams, events);

        (paths, manager)
    }

    #[test]
    fn record_path_template_shape() {
        let (_, manager) = manager_build(Some(RecordFormat::Fmp4), Some(Duration::from_secs(60)));

        assert_eq!(
            manager.record_path_template_build("camera0"),
            "/var/lib/camera-orchestrator/recordings/camera0/%Y-%m-%d_%H-%M-%S-%f"
        );
    }

    #[tokio::test]
    async fn start_rejects_unknown_camera() {
        let (_, manager) = manager_build(Some(RecordFormat::Fmp4), Some(Duration::from_secs(60)));

        let error = manager
            .start(CameraId::new(0), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::CameraUnknown { .. }));
    }

    #[tokio::test]
    async fn start_refuses_without_configured_defaults() {
        let (paths, manager) = manager_build(None, None);
        paths.camera_register_local("/dev/video0");

        let error = manager
            .start(CameraId::new(0), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::InvalidFormat { .. }));
        assert_eq!(error.code(), "INVALID_FORMAT");
    }

    #[test]
    fn reconciliation_adopts_recording_paths_only() {
        let (paths, manager) = manager_build(Some(RecordFormat::Fmp4), Some(Duration::from_secs(60)));
        paths.camera_register_local("/dev/video0");
        paths.camera_register_local("/dev/video1");

        let recording_configuration = PathConfiguration {
            record: Some(true),
            record_format: Some(RecordFormat::Mp4),
            ..Default::default()
        };
        manager.reconcile_from_configuration(CameraId::new(0), &recording_configuration);

        let idle_configuration = PathConfiguration {
            record: Some(false),
            ..Default::default()
        };
        manager.reconcile_from_configuration(CameraId::new(1), &idle_configuration);

        let sessions = manager.sessions_snapshot();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].camera_id, CameraId::new(0));
        assert_eq!(sessions[0].state, SessionState::Recording);
        assert_eq!(sessions[0].origin, SessionOrigin::Reconciled);
        assert_eq!(sessions[0].format, RecordFormat::Mp4);
        assert_eq!(manager.active_sessions_count(), 1);
    }

    fn manager_build_with_root(root: PathBuf) -> Manager {
        let (_, manager) = manager_build(Some(RecordFormat::Fmp4), Some(Duration::from_secs(60)));
        Manager {
            config: RecordingsConfig {
                root,
                format: Some(RecordFormat::Fmp4),
                segment_duration: Some(Duration::from_secs(60)),
                retention: RetentionConfig::default(),
            },
            ..manager
        }
    }

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!(
            "camera-orchestrator-test-{}",
            crate::util::token_generate()
        ))
    }

    #[tokio::test]
    async fn file_views_over_a_real_root() {
        use crate::controller::retention::RetentionPolicy;

        let root = scratch_root();
        let manager = manager_build_with_root(root.clone());

        tokio::fs::create_dir_all(root.join("camera0")).await.unwrap();
        tokio::fs::write(root.join("camera0/old.mp4"), vec![0u8; 600])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::fs::write(root.join("camera0/new.mp4"), vec![0u8; 600])
            .await
            .unwrap();

        // newest first
        let listed = manager.recordings_list(10, 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].file_name, "camera0/new.mp4");
        assert_eq!(listed[1].file_name, "camera0/old.mp4");

        let listed = manager.recordings_list(1, 1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_name, "camera0/old.mp4");

        let info = manager.recording_info("camera0/new.mp4").await.unwrap();
        assert_eq!(info.size_bytes, 600);

        let error = manager
            .recording_info("../outside.mp4")
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::InvalidOptions { .. }));

        // size-bounded cleanup removes the oldest file only
        let outcome = manager
            .cleanup_run(&RetentionPolicy {
                max_size_bytes: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.files_removed, 1);
        assert_eq!(outcome.bytes_freed, 600);
        assert!(manager.recording_info("camera0/old.mp4").await.is_err());
        assert!(manager.recording_info("camera0/new.mp4").await.is_ok());

        manager.recording_delete("camera0/new.mp4").await.unwrap();
        assert!(manager.recordings_list(10, 0).await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_on_same_camera_is_rejected_locally() {
        let (paths, manager) = manager_build(Some(RecordFormat::Fmp4), Some(Duration::from_secs(60)));
        paths.camera_register_local("/dev/video0");

        // a session in RECORDING state blocks further starts before any
        // server round-trip
        let configuration = PathConfiguration {
            record: Some(true),
            ..Default::default()
        };
        manager.reconcile_from_configuration(CameraId::new(0), &configuration);

        let error = manager
            .start(CameraId::new(0), StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, OperationError::AlreadyRecording { .. }));
    }
}
