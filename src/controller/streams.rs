use super::{error::OperationError, paths};
use crate::{
    datatypes::camera_id::CameraId,
    mediamtx::path::{GoDuration, PathConfiguration, RecordFormat},
    transcoder::Transcoder,
    util::{async_flag, drop_guard::DropGuard},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Why a keepalive consumer is held open. Counted independently so a
/// recording ending does not tear down a consumer an explicit stream
/// still needs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeepaliveReason {
    Recording,
    Streaming,
}

#[derive(Debug)]
struct KeepaliveEntry {
    recording_count: usize,
    streaming_count: usize,

    exit_flag_sender: async_flag::Sender,
    join_handle: tokio::task::JoinHandle<()>,
    teardown_guard: DropGuard,
}
impl KeepaliveEntry {
    fn count_mut(
        &mut self,
        reason: KeepaliveReason,
    ) -> &mut usize {
        match reason {
            KeepaliveReason::Recording => &mut self.recording_count,
            KeepaliveReason::Streaming => &mut self.streaming_count,
        }
    }
    fn total(&self) -> usize {
        self.recording_count + self.streaming_count
    }
}

/// Per-transport client URLs for one stream.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StreamUrls {
    pub rtsp: String,
    pub hls: Option<String>,
    pub webrtc: Option<String>,
}

/// Canonical stream name for a camera. The use-case suffix is empty in
/// the single-path design but kept in the signature; multi-path layouts
/// would derive distinct names from it.
pub fn stream_name_build(
    camera_id: CameraId,
    use_case: &str,
) -> String {
    format!("{}{}", camera_id, use_case)
}

/// Stream naming, client URL composition and keepalive lifecycle. The
/// underlying consumer process lives while any reason count is non-zero.
pub struct Manager {
    paths: Arc<paths::Manager>,
    transcoder: Arc<Transcoder>,

    hls_base_url: Option<String>,
    webrtc_base_url: Option<String>,

    keepalives: tokio::sync::Mutex<HashMap<String, KeepaliveEntry>>,

    keepalives_started_total: AtomicU64,
}
impl Manager {
    pub fn new(
        paths: Arc<paths::Manager>,
        transcoder: Arc<Transcoder>,
        hls_base_url: Option<String>,
        webrtc_base_url: Option<String>,
    ) -> Self {
        let hls_base_url = hls_base_url.map(|url| url.trim_end_matches('/').to_owned());
        let webrtc_base_url = webrtc_base_url.map(|url| url.trim_end_matches('/').to_owned());

        Self {
            paths,
            transcoder,

            hls_base_url,
            webrtc_base_url,

            keepalives: tokio::sync::Mutex::new(HashMap::new()),

            keepalives_started_total: AtomicU64::new(0),
        }
    }

    pub fn stream_urls_build(
        &self,
        path_name: &str,
    ) -> StreamUrls {
        StreamUrls {
            rtsp: self.paths.rtsp_url_build(path_name),
            hls: self
                .hls_base_url
                .as_ref()
                .map(|base| format!("{}/{}", base, path_name)),
            webrtc: self
                .webrtc_base_url
                .as_ref()
                .map(|base| format!("{}/{}", base, path_name)),
        }
    }

    /// Ensures the path exists and returns client URLs. Does not wait for
    /// readiness; the server starts the publisher on first reader.
    pub async fn stream_start(
        &self,
        camera_id: CameraId,
    ) -> Result<StreamUrls, OperationError> {
        self.paths.path_ensure(camera_id).await?;

        let stream_name = stream_name_build(camera_id, "");
        Ok(self.stream_urls_build(&stream_name))
    }

    // recording flag plumbing
    pub async fn recording_enable(
        &self,
        path_name: &str,
        record_path_template: String,
        format: RecordFormat,
        segment_duration: Duration,
    ) -> Result<(), OperationError> {
        let partial = PathConfiguration {
            record: Some(true),
            record_path: Some(record_path_template),
            record_format: Some(format),
            record_segment_duration: Some(GoDuration::new(segment_duration)),
            ..Default::default()
        };

        self.paths.path_patch(path_name, &partial).await
    }
    pub async fn recording_disable(
        &self,
        path_name: &str,
    ) -> Result<(), OperationError> {
        let partial = PathConfiguration {
            record: Some(false),
            ..Default::default()
        };

        self.paths.path_patch(path_name, &partial).await
    }

    // keepalives
    pub async fn keepalive_acquire(
        &self,
        path_name: &str,
        reason: KeepaliveReason,
    ) {
        let mut keepalives = self.keepalives.lock().await;

        if let Some(entry) = keepalives.get_mut(path_name) {
            *entry.count_mut(reason) += 1;
            return;
        }

        let (exit_flag_sender, exit_flag_receiver) = async_flag::pair();

        let transcoder = self.transcoder.clone();
        let url = self.paths.rtsp_url_build(path_name);
        let join_handle = tokio::spawn(async move {
            let _ = transcoder.keepalive_run(&url, exit_flag_receiver).await;
        });

        let mut entry = KeepaliveEntry {
            recording_count: 0,
            streaming_count: 0,

            exit_flag_sender,
            join_handle,
            teardown_guard: DropGuard::new("keepalive"),
        };
        *entry.count_mut(reason) += 1;
        keepalives.insert(path_name.to_owned(), entry);

        self.keepalives_started_total.fetch_add(1, Ordering::Relaxed);
        log::debug!("{}: keepalive started for {}", self, path_name);
    }

    /// Decrement for `reason`; tears the consumer down when the total
    /// reaches zero. Releasing an unheld keepalive is a no-op.
    pub async fn keepalive_release(
        &self,
        path_name: &str,
        reason: KeepaliveReason,
    ) {
        let entry = {
            let mut keepalives = self.keepalives.lock().await;

            let entry = match keepalives.get_mut(path_name) {
                Some(entry) => entry,
                None => return,
            };

            let count = entry.count_mut(reason);
            if *count == 0 {
                return;
            }
            *count -= 1;

            if entry.total() > 0 {
                return;
            }
            keepalives.remove(path_name).unwrap()
        };

        entry.exit_flag_sender.signal();
        let _ = entry.join_handle.await;
        entry.teardown_guard.disarm();
        log::debug!("{}: keepalive stopped for {}", self, path_name);
    }

    pub async fn keepalive_count(
        &self,
        path_name: &str,
    ) -> usize {
        self.keepalives
            .lock()
            .await
            .get(path_name)
            .map(|entry| entry.total())
            .unwrap_or(0)
    }
    pub async fn keepalives_active(&self) -> usize {
        self.keepalives.lock().await.len()
    }
    pub fn keepalives_started_total(&self) -> u64 {
        self.keepalives_started_total.load(Ordering::Relaxed)
    }

    /// Stops every keepalive. Shutdown path.
    pub async fn keepalive_teardown_all(&self) {
        let entries = {
            let mut keepalives = self.keepalives.lock().await;
            std::mem::take(&mut *keepalives)
        };

        for (path_name, entry) in entries {
            entry.exit_flag_sender.signal();
            let _ = entry.join_handle.await;
            entry.teardown_guard.disarm();
            log::debug!("{}: keepalive stopped for {}", self, path_name);
        }
    }
}
impl fmt::Display for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "streams::Manager")
    }
}

#[cfg(test)]
mod tests {
    use super::stream_name_build;
    use crate::datatypes::camera_id::CameraId;

    #[test]
    fn stream_names_are_canonical() {
        assert_eq!(stream_name_build(CameraId::new(0), ""), "camera0");
        assert_eq!(stream_name_build(CameraId::new(7), ""), "camera7");
    }

    #[test]
    fn use_case_suffix_appends() {
        assert_eq!(
            stream_name_build(CameraId::new(1), "_preview"),
            "camera1_preview"
        );
    }
}
