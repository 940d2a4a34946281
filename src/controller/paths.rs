use super::{error::OperationError, health};
use crate::{
    config::StreamsConfig,
    datatypes::{camera_id::CameraId, rtsp_url::RtspUrl},
    mediamtx::{
        api::{self, ApiError},
        path::{GoDuration, PathConfiguration, PathRuntimeState},
    },
    transcoder::Transcoder,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Where a camera's media comes from. Internal; the controller API only
/// ever shows the kind, never the locator.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CameraSource {
    LocalDevice { device_path: String },
    External { url: RtspUrl, kind: String },
}
impl CameraSource {
    pub fn kind(&self) -> &str {
        match self {
            CameraSource::LocalDevice { .. } => "local",
            CameraSource::External { kind, .. } => kind,
        }
    }
    pub fn is_local(&self) -> bool {
        matches!(self, CameraSource::LocalDevice { .. })
    }

    /// Key in the reverse (device → camera) directory.
    fn directory_key(&self) -> String {
        match self {
            CameraSource::LocalDevice { device_path } => device_path.clone(),
            CameraSource::External { url, .. } => url.to_string(),
        }
    }
}

/// Bidirectional CameraId ↔ source binding. The single source of truth
/// for the mapping; other components query, never cache.
#[derive(Debug, Default)]
struct Directory {
    sources_by_camera: HashMap<CameraId, CameraSource>,
    cameras_by_key: HashMap<String, CameraId>,
}
impl Directory {
    fn index_free(
        &self,
        preferred: Option<usize>,
    ) -> usize {
        if let Some(preferred) = preferred
            && !self.sources_by_camera.contains_key(&CameraId::new(preferred))
        {
            return preferred;
        }

        (0..)
            .find(|index| !self.sources_by_camera.contains_key(&CameraId::new(*index)))
            .unwrap()
    }

    fn register(
        &mut self,
        preferred: Option<usize>,
        source: CameraSource,
    ) -> CameraId {
        let key = source.directory_key();
        if let Some(existing) = self.cameras_by_key.get(&key) {
            return *existing;
        }

        let camera_id = CameraId::new(self.index_free(preferred));
        self.sources_by_camera.insert(camera_id, source);
        self.cameras_by_key.insert(key, camera_id);
        camera_id
    }

    fn register_at(
        &mut self,
        camera_id: CameraId,
        source: CameraSource,
    ) -> bool {
        if self.sources_by_camera.contains_key(&camera_id) {
            return false;
        }
        let key = source.directory_key();
        if self.cameras_by_key.contains_key(&key) {
            return false;
        }

        self.sources_by_camera.insert(camera_id, source);
        self.cameras_by_key.insert(key, camera_id);
        true
    }

    fn unregister(
        &mut self,
        camera_id: CameraId,
    ) -> Option<CameraSource> {
        let source = self.sources_by_camera.remove(&camera_id)?;
        self.cameras_by_key.remove(&source.directory_key());
        Some(source)
    }
}

fn device_index_parse(device_path: &str) -> Option<usize> {
    static PATTERN: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"/video(\d+)$").unwrap());

    PATTERN
        .captures(device_path)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

fn publish_device_parse(run_on_demand: &str) -> Option<String> {
    static PATTERN: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"-f\s+v4l2\s+-i\s+(\S+)").unwrap());

    Some(
        PATTERN
            .captures(run_on_demand)?
            .get(1)?
            .as_str()
            .to_owned(),
    )
}

/// Idempotent management of server-side path configurations plus the
/// camera directory. Per-path mutations are serialised by a per-name
/// lock; reads go straight to the server.
pub struct Manager {
    api: Arc<api::Client>,
    health: Arc<health::Monitor>,
    transcoder: Arc<Transcoder>,

    rtsp_base_url: String,
    streams_config: StreamsConfig,
    ready_poll_interval: Duration,

    directory: RwLock<Directory>,

    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    created_paths: Mutex<BTreeSet<String>>,

    mutations_total: AtomicU64,
}
impl Manager {
    const READY_POLL_INTERVAL_CAP: Duration = Duration::from_secs(30);

    pub fn new(
        api: Arc<api::Client>,
        health: Arc<health::Monitor>,
        transcoder: Arc<Transcoder>,
        rtsp_base_url: String,
        streams_config: StreamsConfig,
        ready_poll_interval: Duration,
    ) -> Self {
        let rtsp_base_url = rtsp_base_url.trim_end_matches('/').to_owned();

        Self {
            api,
            health,
            transcoder,

            rtsp_base_url,
            streams_config,
            ready_poll_interval,

            directory: RwLock::new(Directory::default()),

            path_locks: Mutex::new(HashMap::new()),
            created_paths: Mutex::new(BTreeSet::new()),

            mutations_total: AtomicU64::new(0),
        }
    }

    // camera directory
    pub fn camera_register_local(
        &self,
        device_path: &str,
    ) -> CameraId {
        let preferred = device_index_parse(device_path);
        let camera_id = self.directory.write().register(
            preferred,
            CameraSource::LocalDevice {
                device_path: device_path.to_owned(),
            },
        );
        log::info!("{}: {} bound", self, camera_id);
        camera_id
    }
    pub fn camera_register_external(
        &self,
        url: RtspUrl,
        kind: String,
    ) -> CameraId {
        let camera_id = self
            .directory
            .write()
            .register(None, CameraSource::External { url, kind });
        log::info!("{}: {} bound (external)", self, camera_id);
        camera_id
    }
    pub fn camera_unregister(
        &self,
        camera_id: CameraId,
    ) -> Option<CameraSource> {
        let source = self.directory.write().unregister(camera_id);
        if source.is_some() {
            log::info!("{}: {} unbound", self, camera_id);
        }
        source
    }

    pub fn camera_source_get(
        &self,
        camera_id: CameraId,
    ) -> Option<CameraSource> {
        self.directory
            .read()
            .sources_by_camera
            .get(&camera_id)
            .cloned()
    }
    pub fn camera_for_device(
        &self,
        device_path: &str,
    ) -> Option<CameraId> {
        self.directory
            .read()
            .cameras_by_key
            .get(device_path)
            .copied()
    }
    pub fn cameras_list(&self) -> Vec<(CameraId, CameraSource)> {
        let mut cameras = self
            .directory
            .read()
            .sources_by_camera
            .iter()
            .map(|(camera_id, source)| (*camera_id, source.clone()))
            .collect::<Vec<_>>();
        cameras.sort_by_key(|(camera_id, _)| *camera_id);
        cameras
    }
    pub fn cameras_count(&self) -> usize {
        self.directory.read().sources_by_camera.len()
    }

    // urls
    pub fn rtsp_url_build(
        &self,
        path_name: &str,
    ) -> String {
        format!("{}/{}", self.rtsp_base_url, path_name)
    }

    fn source_configuration_build(
        &self,
        path_name: &str,
        source: &CameraSource,
    ) -> PathConfiguration {
        match source {
            CameraSource::LocalDevice { device_path } => PathConfiguration {
                run_on_demand: Some(
                    self.transcoder
                        .publish_command_build(device_path, &self.rtsp_url_build(path_name)),
                ),
                run_on_demand_restart: Some(self.streams_config.on_demand_restart),
                run_on_demand_close_after: Some(GoDuration::new(
                    self.streams_config.on_demand_close_after,
                )),
                ..Default::default()
            },
            CameraSource::External { url, .. } => PathConfiguration {
                source: Some(url.to_string()),
                ..Default::default()
            },
        }
    }

    fn path_lock(
        &self,
        path_name: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.path_locks
            .lock()
            .entry(path_name.to_owned())
            .or_default()
            .clone()
    }

    // server-side mutations
    pub async fn path_create(
        &self,
        path_name: &str,
        source: &CameraSource,
    ) -> Result<(), OperationError> {
        let lock = self.path_lock(path_name);
        let _guard = lock.lock().await;

        self.health.server_guard()?;

        let configuration = self.source_configuration_build(path_name, source);
        match self.api.config_path_add(path_name, &configuration).await {
            Ok(()) => {
                self.created_paths.lock().insert(path_name.to_owned());
            }
            // create of an existing path is success, not an error
            Err(ApiError::AlreadyExists) => {}
            Err(error) => return Err(OperationError::from_api(error)),
        }
        self.mutations_total.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    pub async fn path_patch(
        &self,
        path_name: &str,
        partial: &PathConfiguration,
    ) -> Result<(), OperationError> {
        let lock = self.path_lock(path_name);
        let _guard = lock.lock().await;

        self.health.server_guard()?;

        self.api
            .config_path_patch(path_name, partial)
            .await
            .map_err(OperationError::from_api)?;
        self.mutations_total.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    pub async fn path_delete(
        &self,
        path_name: &str,
    ) -> Result<(), OperationError> {
        let lock = self.path_lock(path_name);
        let _guard = lock.lock().await;

        self.health.server_guard()?;

        match self.api.config_path_delete(path_name).await {
            Ok(()) => {}
            // absent path is not an error
            Err(ApiError::NotFound) => {}
            Err(error) => return Err(OperationError::from_api(error)),
        }
        self.mutations_total.fetch_add(1, Ordering::Relaxed);
        self.created_paths.lock().remove(path_name);

        Ok(())
    }

    /// Lazily creates the camera's path. Safe to call on every operation.
    pub async fn path_ensure(
        &self,
        camera_id: CameraId,
    ) -> Result<String, OperationError> {
        let source = self
            .camera_source_get(camera_id)
            .ok_or(OperationError::CameraUnknown { camera_id })?;

        let path_name = camera_id.path_name();
        self.path_create(&path_name, &source).await?;

        Ok(path_name)
    }

    // server-side reads
    pub async fn path_config_get(
        &self,
        path_name: &str,
    ) -> Result<Option<PathConfiguration>, OperationError> {
        self.health.server_guard()?;

        match self.api.config_path_get(path_name).await {
            Ok(configuration) => Ok(Some(configuration)),
            Err(ApiError::NotFound) => Ok(None),
            Err(error) => Err(OperationError::from_api(error)),
        }
    }
    pub async fn path_runtime_get(
        &self,
        path_name: &str,
    ) -> Result<Option<PathRuntimeState>, OperationError> {
        self.health.server_guard()?;

        match self.api.path_runtime_get(path_name).await {
            Ok(state) => Ok(Some(state)),
            Err(ApiError::NotFound) => Ok(None),
            Err(error) => Err(OperationError::from_api(error)),
        }
    }
    pub async fn paths_runtime_list(&self) -> Result<Vec<PathRuntimeState>, OperationError> {
        self.health.server_guard()?;

        self.api
            .paths_runtime_list()
            .await
            .map_err(OperationError::from_api)
    }
    pub async fn paths_config_list(&self) -> Result<Vec<PathConfiguration>, OperationError> {
        self.health.server_guard()?;

        self.api
            .config_paths_list()
            .await
            .map_err(OperationError::from_api)
    }

    /// Polls runtime state until `ready` or the deadline. Poll cadence
    /// starts at the health check interval and doubles up to 30 s.
    pub async fn path_ready_wait(
        &self,
        path_name: &str,
        timeout: Duration,
    ) -> Result<PathRuntimeState, OperationError> {
        let deadline = Instant::now() + timeout;
        let mut poll_interval = self.ready_poll_interval;

        loop {
            if let Some(state) = self.path_runtime_get(path_name).await?
                && state.ready
            {
                return Ok(state);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OperationError::Cancelled);
            }

            tokio::time::sleep(poll_interval.min(remaining)).await;
            poll_interval = (poll_interval * 2).min(Self::READY_POLL_INTERVAL_CAP);
        }
    }

    /// Triggers on-demand activation by attaching a transient consumer
    /// that exits after the first media frame.
    pub async fn path_publisher_activate(
        &self,
        path_name: &str,
        timeout: Duration,
    ) -> Result<(), OperationError> {
        self.health.server_guard()?;

        let url = self.rtsp_url_build(path_name);
        self.transcoder
            .consume_first_frame(&url, timeout)
            .await
            .map_err(|source| OperationError::Internal { source })?;

        Ok(())
    }

    /// Adopts server-side paths whose names follow the camera scheme.
    /// Returns the adopted bindings with their configurations, so the
    /// caller can reconcile recording sessions.
    pub async fn reconcile(&self) -> Result<Vec<(CameraId, PathConfiguration)>, OperationError> {
        let configurations = self.paths_config_list().await?;

        let mut adopted = Vec::new();
        for configuration in configurations {
            let name = match configuration.name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            let camera_id = match name.parse::<CameraId>() {
                Ok(camera_id) => camera_id,
                Err(_) => continue,
            };
            let source = match Self::source_from_configuration(&configuration) {
                Some(source) => source,
                None => continue,
            };

            if self.directory.write().register_at(camera_id, source) {
                log::info!("{}: adopted {} from server", self, camera_id);
                adopted.push((camera_id, configuration));
            }
        }

        Ok(adopted)
    }

    fn source_from_configuration(configuration: &PathConfiguration) -> Option<CameraSource> {
        if let Some(source) = configuration.source.as_deref()
            && let Ok(url) = source.parse::<RtspUrl>()
        {
            return Some(CameraSource::External {
                url,
                kind: "generic".to_owned(),
            });
        }

        if let Some(run_on_demand) = configuration.run_on_demand.as_deref()
            && let Some(device_path) = publish_device_parse(run_on_demand)
        {
            return Some(CameraSource::LocalDevice { device_path });
        }

        None
    }

    /// Deletes every path this instance created. Best-effort: failures are
    /// logged, not surfaced.
    pub async fn shutdown_cleanup(&self) {
        let created_paths = std::mem::take(&mut *self.created_paths.lock());

        for path_name in created_paths {
            match self.path_delete(&path_name).await {
                Ok(()) => log::info!("{}: removed {}", self, path_name),
                Err(error) => {
                    log::warn!("{}: failed to remove {}: {}", self, path_name, error);
                }
            }
        }
    }

    pub fn created_paths_count(&self) -> usize {
        self.created_paths.lock().len()
    }
    pub fn mutations_total(&self) -> u64 {
        self.mutations_total.load(Ordering::Relaxed)
    }
}
impl fmt::Display for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "paths::Manager")
    }
}

#[cfg(test)]
mod tests_directory {
    use super::{CameraSource, Directory, device_index_parse, publish_device_parse};
    use crate::datatypes::camera_id::CameraId;

    fn local(device_path: &str) -> CameraSource {
        CameraSource::LocalDevice {
            device_path: device_path.to_owned(),
        }
    }

    #[test]
    fn device_index_follows_node_number() {
        let mut directory = Directory::default();

        let camera_id = directory.register(device_index_parse("/dev/video2"), local("/dev/video2"));
        assert_eq!(camera_id, CameraId::new(2));

        let camera_id = directory.register(device_index_parse("/dev/video0"), local("/dev/video0"));
        assert_eq!(camera_id, CameraId::new(0));
    }

    #[test]
    fn clashing_index_takes_next_free() {
        let mut directory = Directory::default();

        directory.register(Some(0), local("/dev/video0"));
        let camera_id = directory.register(Some(0), local("/dev/other0"));
        assert_eq!(camera_id, CameraId::new(1));
    }

    #[test]
    fn register_is_idempotent_per_device() {
        let mut directory = Directory::default();

        let first = directory.register(Some(0), local("/dev/video0"));
        let second = directory.register(Some(0), local("/dev/video0"));
        assert_eq!(first, second);
        assert_eq!(directory.sources_by_camera.len(), 1);
    }

    #[test]
    fn unregister_round_trips() {
        use maplit::hashmap;

        let mut directory = Directory::default();

        let camera_id = directory.register(Some(3), local("/dev/video3"));
        assert_eq!(
            directory.cameras_by_key,
            hashmap! {"/dev/video3".to_owned() => CameraId::new(3)}
        );

        let source = directory.unregister(camera_id).unwrap();
        assert_eq!(source, local("/dev/video3"));
        assert!(directory.unregister(camera_id).is_none());
        assert!(directory.cameras_by_key.is_empty());
    }

    #[test]
    fn register_at_refuses_conflicts() {
        let mut directory = Directory::default();

        assert!(directory.register_at(CameraId::new(0), local("/dev/video0")));
        assert!(!directory.register_at(CameraId::new(0), local("/dev/video9")));
        assert!(!directory.register_at(CameraId::new(5), local("/dev/video0")));
    }

    #[test]
    fn publish_command_device_extraction() {
        assert_eq!(
            publish_device_parse(
                "/usr/bin/ffmpeg -hide_banner -loglevel error -f v4l2 -i /dev/video0 -c:v libx264"
            ),
            Some("/dev/video0".to_owned())
        );
        assert_eq!(publish_device_parse("ffmpeg -i rtsp://host/stream"), None);
    }

    #[test]
    fn device_index_parse_variants() {
        assert_eq!(device_index_parse("/dev/video0"), Some(0));
        assert_eq!(device_index_parse("/dev/video42"), Some(42));
        assert_eq!(device_index_parse("/dev/media0"), None);
    }
}
