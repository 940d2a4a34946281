use super::{
    error::{OperationError, TierFailure},
    events::{Bus as EventBus, Event},
    paths::{self, CameraSource},
    retention::{CleanupOutcome, RetentionPolicy, deletion_plan},
};
use crate::{
    config::SnapshotsConfig,
    datatypes::camera_id::CameraId,
    hardware,
    transcoder::Transcoder,
    util::{
        async_flag,
        fs::{FileInfo, directory_files_scan, move_file},
        runnable::{Exited, Runnable},
        token_generate,
    },
};
use anyhow::{Context as _, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future::FutureExt, select};
use image::codecs::{
    jpeg::JpegEncoder,
    png::{CompressionType, FilterType, PngEncoder},
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapshotFormat {
    Jpg,
    Png,
}
impl SnapshotFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SnapshotFormat::Jpg => "jpg",
            SnapshotFormat::Png => "png",
        }
    }
}
impl fmt::Display for SnapshotFormat {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.extension())
    }
}

/// Capture options. Validation is strict: out-of-range or contradictory
/// values are rejected, nothing is silently coerced.
#[derive(Clone, Debug)]
pub struct Options {
    pub format: SnapshotFormat,
    pub quality: Option<u8>,
    pub compression: Option<u8>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub auto_resize: bool,
}
impl Default for Options {
    fn default() -> Self {
        Self {
            format: SnapshotFormat::Jpg,
            quality: None,
            compression: None,
            max_width: None,
            max_height: None,
            auto_resize: false,
        }
    }
}
impl Options {
    pub fn validate(&self) -> Result<(), OperationError> {
        let invalid = |message: String| OperationError::InvalidOptions { message };

        if let Some(quality) = self.quality {
            if self.format != SnapshotFormat::Jpg {
                return Err(invalid("quality applies to jpg only".to_owned()));
            }
            if !(1..=100).contains(&quality) {
                return Err(invalid(format!("quality out of range [1, 100]: {quality}")));
            }
        }
        if let Some(compression) = self.compression {
            if self.format != SnapshotFormat::Png {
                return Err(invalid("compression applies to png only".to_owned()));
            }
            if compression > 9 {
                return Err(invalid(format!(
                    "compression out of range [0, 9]: {compression}"
                )));
            }
        }
        if self.max_width == Some(0) || self.max_height == Some(0) {
            return Err(invalid("max dimensions must be positive".to_owned()));
        }
        if self.auto_resize && self.max_width.is_none() && self.max_height.is_none() {
            return Err(invalid(
                "auto_resize requires max_width or max_height".to_owned(),
            ));
        }

        Ok(())
    }

    fn needs_reencode(
        &self,
        captured: SnapshotFormat,
    ) -> bool {
        self.format != captured
            || self.quality.is_some()
            || self.compression.is_some()
            || (self.auto_resize && (self.max_width.is_some() || self.max_height.is_some()))
    }
}

/// Result record. The file on disk is the durable artifact; this record
/// carries its identifiers and capture metadata.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub camera_id: CameraId,
    pub file_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub format: SnapshotFormat,
    pub tier_used: u8,
    pub latency: Duration,
    pub metadata: HashMap<String, String>,
}

fn file_name_build(
    camera_id: CameraId,
    now: DateTime<Utc>,
    extension: &str,
) -> String {
    format!(
        "{}_{}.{}",
        camera_id,
        now.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
        extension
    )
}

fn png_compression_map(compression: Option<u8>) -> CompressionType {
    match compression {
        Some(0..=2) => CompressionType::Fast,
        Some(7..=9) => CompressionType::Best,
        _ => CompressionType::Default,
    }
}

const RECENT_CAPACITY: usize = 256;
const TIER_COUNT: usize = 4;

/// Single-image capture with ordered fallback. Tiers 0 and 1 grab from
/// the local device, 2 from an already-ready server path, 3 activates
/// the path first. Per-camera capture is serialised; distinct cameras
/// run in parallel.
pub struct Manager {
    config: SnapshotsConfig,
    paths: Arc<paths::Manager>,
    transcoder: Arc<Transcoder>,
    events: Arc<EventBus>,

    camera_locks: Mutex<HashMap<CameraId, Arc<tokio::sync::Mutex<()>>>>,
    recent: Mutex<VecDeque<Snapshot>>,

    tier_hits: [AtomicU64; TIER_COUNT],
    failures_total: AtomicU64,
}
impl Manager {
    pub fn new(
        config: SnapshotsConfig,
        paths: Arc<paths::Manager>,
        transcoder: Arc<Transcoder>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            paths,
            transcoder,
            events,

            camera_locks: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),

            tier_hits: Default::default(),
            failures_total: AtomicU64::new(0),
        }
    }

    fn camera_lock(
        &self,
        camera_id: CameraId,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.camera_locks
            .lock()
            .entry(camera_id)
            .or_default()
            .clone()
    }

    fn temp_path_build(
        &self,
        extension: &str,
    ) -> PathBuf {
        self.config
            .root
            .join(format!(".tmp_{}.{}", token_generate(), extension))
    }

    pub async fn take(
        &self,
        camera_id: CameraId,
        options: Options,
    ) -> Result<Snapshot, OperationError> {
        options.validate()?;

        let source = self
            .paths
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let lock = self.camera_lock(camera_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.config.root)
            .await
            .map_err(|error| OperationError::Filesystem {
                message: format!("{error}"),
            })?;

        let started = Instant::now();

        let tiers: &[u8] = if source.is_local() {
            &[0, 1, 2, 3]
        } else {
            &[2, 3]
        };

        let mut failures = Vec::new();
        for &tier in tiers {
            let attempt = self.tier_attempt(tier, camera_id, &source, &options).await;

            let (temp_path, captured_format) = match attempt {
                Ok(capture) => capture,
                Err(error) => {
                    log::debug!("{}: {} tier {} failed: {:#}", self, camera_id, tier, error);
                    failures.push(TierFailure {
                        tier,
                        message: format!("{error:#}"),
                    });
                    continue;
                }
            };

            match self
                .finalize(camera_id, temp_path, captured_format, &options, tier, started)
                .await
            {
                Ok(snapshot) => {
                    self.tier_hits[tier as usize].fetch_add(1, Ordering::Relaxed);
                    self.events.publish(Event::SnapshotTaken {
                        camera_id,
                        snapshot_id: snapshot.snapshot_id.clone(),
                        file_name: snapshot.file_name.clone(),
                        size_bytes: snapshot.size_bytes,
                        tier_used: tier,
                        timestamp: snapshot.created_at,
                    });
                    log::info!(
                        "{}: {} captured via tier {} ({})",
                        self,
                        camera_id,
                        tier,
                        snapshot.file_name
                    );

                    let mut recent = self.recent.lock();
                    if recent.len() >= RECENT_CAPACITY {
                        recent.pop_front();
                    }
                    recent.push_back(snapshot.clone());

                    return Ok(snapshot);
                }
                Err(error) => {
                    failures.push(TierFailure {
                        tier,
                        message: format!("{error:#}"),
                    });
                }
            }
        }

        self.failures_total.fetch_add(1, Ordering::Relaxed);
        Err(OperationError::AllTiersFailed { failures })
    }

    async fn tier_attempt(
        &self,
        tier: u8,
        camera_id: CameraId,
        source: &CameraSource,
        options: &Options,
    ) -> Result<(PathBuf, SnapshotFormat), Error> {
        match tier {
            0 => {
                let device_path = match source {
                    CameraSource::LocalDevice { device_path } => device_path,
                    CameraSource::External { .. } => anyhow::bail!("not a local device"),
                };

                let frame = hardware::capture::frame_grab_jpeg(
                    device_path,
                    self.config.tier_hardware_timeout,
                )
                .await
                .context("frame_grab_jpeg")?;

                let temp_path = self.temp_path_build("jpg");
                tokio::fs::write(&temp_path, &frame)
                    .await
                    .context("write")?;

                Ok((temp_path, SnapshotFormat::Jpg))
            }
            1 => {
                let device_path = match source {
                    CameraSource::LocalDevice { device_path } => device_path,
                    CameraSource::External { .. } => anyhow::bail!("not a local device"),
                };

                let temp_path = self.temp_path_build(options.format.extension());
                self.transcoder
                    .frame_from_device(
                        device_path,
                        &temp_path,
                        self.config.tier_transcoder_timeout,
                    )
                    .await
                    .context("frame_from_device")?;

                Ok((temp_path, options.format))
            }
            2 => {
                let path_name = camera_id.path_name();

                let runtime = self
                    .paths
                    .path_runtime_get(&path_name)
                    .await
                    .map_err(|error| anyhow::anyhow!("{error}"))?;
                match runtime {
                    Some(state) if state.ready => {}
                    Some(_) => anyhow::bail!("path not ready"),
                    None => anyhow::bail!("path does not exist"),
                }

                let temp_path = self.temp_path_build(options.format.extension());
                self.transcoder
                    .frame_from_rtsp(
                        &self.paths.rtsp_url_build(&path_name),
                        &temp_path,
                        self.config.tier_stream_timeout,
                    )
                    .await
                    .context("frame_from_rtsp")?;

                Ok((temp_path, options.format))
            }
            3 => {
                let deadline = Instant::now() + self.config.tier_activation_timeout;

                let path_name = self
                    .paths
                    .path_ensure(camera_id)
                    .await
                    .map_err(|error| anyhow::anyhow!("{error}"))?;

                let remaining = deadline.saturating_duration_since(Instant::now());
                self.paths
                    .path_publisher_activate(&path_name, remaining)
                    .await
                    .map_err(|error| anyhow::anyhow!("activate: {error}"))?;

                let remaining = deadline.saturating_duration_since(Instant::now());
                self.paths
                    .path_ready_wait(&path_name, remaining)
                    .await
                    .map_err(|error| anyhow::anyhow!("ready wait: {error}"))?;

                let remaining = deadline
                    .saturating_duration_since(Instant::now())
                    .max(Duration::from_secs(1));
                let temp_path = self.temp_path_build(options.format.extension());
                self.transcoder
                    .frame_from_rtsp(
                        &self.paths.rtsp_url_build(&path_name),
                        &temp_path,
                        remaining,
                    )
                    .await
                    .context("frame_from_rtsp")?;

                Ok((temp_path, options.format))
            }
            _ => unreachable!(),
        }
    }

    async fn finalize(
        &self,
        camera_id: CameraId,
        temp_path: PathBuf,
        captured_format: SnapshotFormat,
        options: &Options,
        tier: u8,
        started: Instant,
    ) -> Result<Snapshot, Error> {
        if options.needs_reencode(captured_format) {
            self.reencode(&temp_path, options).await.context("reencode")?;
        }

        let created_at = Utc::now();
        let file_name = file_name_build(camera_id, created_at, options.format.extension());
        let file_path = self.config.root.join(&file_name);

        move_file(&temp_path, &file_path)
            .await
            .context("move_file")?;

        let metadata = tokio::fs::metadata(&file_path).await.context("metadata")?;
        if metadata.len() < self.config.min_size_bytes {
            let _ = tokio::fs::remove_file(&file_path).await;
            anyhow::bail!(
                "snapshot below minimum size: {} < {}",
                metadata.len(),
                self.config.min_size_bytes
            );
        }

        let latency = started.elapsed();
        let mut snapshot_metadata = HashMap::new();
        snapshot_metadata.insert("tier".to_owned(), tier.to_string());
        snapshot_metadata.insert("latency_ms".to_owned(), latency.as_millis().to_string());
        snapshot_metadata.insert("format".to_owned(), options.format.to_string());

        Ok(Snapshot {
            snapshot_id: token_generate(),
            camera_id,
            file_path,
            file_name,
            size_bytes: metadata.len(),
            created_at,
            format: options.format,
            tier_used: tier,
            latency,
            metadata: snapshot_metadata,
        })
    }

    /// Decode, optionally downscale preserving aspect, re-encode with the
    /// requested format parameters, atomically replacing `path`.
    async fn reencode(
        &self,
        path: &std::path::Path,
        options: &Options,
    ) -> Result<(), Error> {
        let contents = tokio::fs::read(path).await.context("read")?;
        let mut decoded = image::load_from_memory(&contents).context("load_from_memory")?;

        if options.auto_resize {
            let max_width = options.max_width.unwrap_or(u32::MAX);
            let max_height = options.max_height.unwrap_or(u32::MAX);
            if decoded.width() > max_width || decoded.height() > max_height {
                decoded = decoded.thumbnail(max_width, max_height);
            }
        }

        let mut encoded = Vec::new();
        match options.format {
            SnapshotFormat::Jpg => {
                let encoder = JpegEncoder::new_with_quality(
                    &mut encoded,
                    options.quality.unwrap_or(90),
                );
                decoded.write_with_encoder(encoder).context("jpeg encode")?;
            }
            SnapshotFormat::Png => {
                let encoder = PngEncoder::new_with_quality(
                    &mut encoded,
                    png_compression_map(options.compression),
                    FilterType::Adaptive,
                );
                decoded.write_with_encoder(encoder).context("png encode")?;
            }
        }

        tokio::fs::write(path, &encoded).await.context("write")?;

        Ok(())
    }

    // views
    pub fn recent_list(&self) -> Vec<Snapshot> {
        self.recent.lock().iter().cloned().collect()
    }
    pub fn tier_hits(&self) -> [u64; TIER_COUNT] {
        std::array::from_fn(|index| self.tier_hits[index].load(Ordering::Relaxed))
    }
    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    async fn files_scan(&self) -> Result<Vec<FileInfo>, OperationError> {
        let mut files = directory_files_scan(&self.config.root).await.map_err(|error| {
            OperationError::Filesystem {
                message: format!("{error:#}"),
            }
        })?;

        // in-flight temp files are not subject to listing or retention
        files.retain(|file| {
            file.path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'))
        });

        Ok(files)
    }

    pub async fn cleanup_run(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<CleanupOutcome, OperationError> {
        let files = self.files_scan().await?;
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

    pub async fn storage_files(&self) -> Result<Vec<FileInfo>, OperationError> {
        self.files_scan().await
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
}
#[async_trait]
impl Runnable for Manager {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.retention_run(exit_flag).await
    }
}
impl fmt::Display for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "snapshot::Manager")
    }
}

#[cfg(test)]
mod tests_options {
    use super::{Options, SnapshotFormat};

    #[test]
    fn defaults_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn quality_bounds() {
        let mut options = Options {
            quality: Some(85),
            ..Options::default()
        };
        options.validate().unwrap();

        options.quality = Some(0);
        assert!(options.validate().is_err());
        options.quality = Some(101);
        assert!(options.validate().is_err());
    }

    #[test]
    fn quality_requires_jpg() {
        let options = Options {
            format: SnapshotFormat::Png,
            quality: Some(85),
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn compression_bounds_and_format() {
        let mut options = Options {
            format: SnapshotFormat::Png,
            compression: Some(9),
            ..Options::default()
        };
        options.validate().unwrap();

        options.compression = Some(10);
        assert!(options.validate().is_err());

        let options = Options {
            compression: Some(3),
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_dimensions_rejected() {
        let options = Options {
            max_width: Some(0),
            ..Options::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn auto_resize_needs_bounds() {
        let options = Options {
            auto_resize: true,
            ..Options::default()
        };
        assert!(options.validate().is_err());

        let options = Options {
            auto_resize: true,
            max_width: Some(640),
            ..Options::default()
        };
        options.validate().unwrap();
    }

    #[test]
    fn reencode_detection() {
        let options = Options::default();
        assert!(!options.needs_reencode(SnapshotFormat::Jpg));
        assert!(options.needs_reencode(SnapshotFormat::Png));

        let options = Options {
            quality: Some(50),
            ..Options::default()
        };
        assert!(options.needs_reencode(SnapshotFormat::Jpg));
    }
}

#[cfg(test)]
mod tests_storage {
    use super::Manager;
    use crate::{
        config::{HealthConfig, SnapshotsConfig, StreamsConfig, TranscoderConfig},
        controller::{events, health, paths, retention::RetentionPolicy},
        mediamtx::api,
        transcoder::Transcoder,
        util::backoff::Backoff,
    };
    use std::{path::PathBuf, sync::Arc, time::Duration};

    fn manager_build(root: PathBuf) -> Manager {
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

        let config = serde_json::from_value::<SnapshotsConfig>(serde_json::json!({
            "root": root,
        }))
        .unwrap();

        Manager::new(config, paths, transcoder, events)
    }

    #[tokio::test]
    async fn storage_scan_skips_in_flight_temp_files() {
        let root = std::env::temp_dir().join(format!(
            "camera-orchestrator-test-{}",
            crate::util::token_generate()
        ));
        let manager = manager_build(root.clone());

        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("camera0_2025-06-01T12-00-00.000Z.jpg"), vec![0u8; 2048])
            .await
            .unwrap();
        tokio::fs::write(root.join(".tmp_deadbeef.jpg"), vec![0u8; 128])
            .await
            .unwrap();

        let files = manager.storage_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(
            files[0]
                .path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("camera0_")
        );

        let outcome = manager
            .cleanup_run(&RetentionPolicy {
                max_count: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.files_removed, 1);
        assert!(manager.storage_files().await.unwrap().is_empty());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}

#[cfg(test)]
mod tests_file_name {
    use super::file_name_build;
    use crate::datatypes::camera_id::CameraId;

    #[test]
    fn file_names_follow_the_scheme() {
        let file_name = file_name_build(CameraId::new(0), chrono::Utc::now(), "jpg");

        assert!(file_name.starts_with("camera0_"));
        assert!(file_name.ends_with(".jpg"));
        assert!(!file_name.contains(':'));
        assert!(!file_name.contains('/'));
    }
}
