use super::{error::OperationError, paths};
use crate::{
    config::DiscoveryConfig,
    datatypes::rtsp_url::RtspUrl,
    transcoder::Transcoder,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use anyhow::{Context as _, Error, ensure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future::FutureExt, select, stream::StreamExt};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, net::Ipv4Addr, sync::Arc};

/// A known external RTSP source.
#[derive(Clone, Debug)]
pub struct ExternalStream {
    pub name: String,
    pub url: RtspUrl,
    pub kind: String,
    pub last_validated: Option<DateTime<Utc>>,
    pub healthy: bool,
}

/// One address to probe during a scan.
#[derive(Clone, PartialEq, Eq, Debug)]
struct Candidate {
    url: String,
    kind: String,
}

/// Expands `a.b.c.d` or `a.b.c.d-e` (final-octet range) into addresses.
fn address_range_expand(range: &str) -> Result<Vec<Ipv4Addr>, Error> {
    match range.split_once('-') {
        None => {
            let address = range.parse::<Ipv4Addr>().context("parse")?;
            Ok(vec![address])
        }
        Some((start, end_octet)) => {
            let start = start.parse::<Ipv4Addr>().context("parse start")?;
            let end_octet = end_octet.parse::<u8>().context("parse end")?;
            let start_octets = start.octets();
            ensure!(
                end_octet >= start_octets[3],
                "descending range: {:?}",
                range
            );

            Ok((start_octets[3]..=end_octet)
                .map(|octet| {
                    Ipv4Addr::new(start_octets[0], start_octets[1], start_octets[2], octet)
                })
                .collect())
        }
    }
}

fn candidates_build(config: &DiscoveryConfig) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for range in &config.address_ranges {
        let addresses = match address_range_expand(range) {
            Ok(addresses) => addresses,
            Err(error) => {
                log::warn!("discovery: bad address range {:?}: {:#}", range, error);
                continue;
            }
        };
        for address in addresses {
            for path in &config.rtsp_paths {
                candidates.push(Candidate {
                    url: format!("rtsp://{}:{}{}", address, config.rtsp_port, path),
                    kind: "generic".to_owned(),
                });
            }
        }
    }

    for address in &config.skydio_addresses {
        for path in &config.rtsp_paths {
            candidates.push(Candidate {
                url: format!("rtsp://{}:{}{}", address, config.rtsp_port, path),
                kind: "skydio".to_owned(),
            });
        }
    }

    candidates
}

const SCAN_CONCURRENCY: usize = 4;

/// Optional periodic scan for UAV/RTSP sources on configured ranges.
/// Reachable candidates are registered as external cameras and get a
/// server path created with `source=<url>`.
pub struct Manager {
    config: DiscoveryConfig,
    paths: Arc<paths::Manager>,
    transcoder: Arc<Transcoder>,

    registry: Mutex<HashMap<String, ExternalStream>>,
}
impl Manager {
    pub fn new(
        config: DiscoveryConfig,
        paths: Arc<paths::Manager>,
        transcoder: Arc<Transcoder>,
    ) -> Self {
        Self {
            config,
            paths,
            transcoder,

            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn streams_list(&self) -> Vec<ExternalStream> {
        let mut streams = self.registry.lock().values().cloned().collect::<Vec<_>>();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }

    /// Registers a stream supplied by the caller and creates its path.
    pub async fn stream_add(
        &self,
        name: String,
        url: RtspUrl,
        kind: String,
    ) -> Result<ExternalStream, OperationError> {
        let camera_id = self
            .paths
            .camera_register_external(url.clone(), kind.clone());

        let source = self.paths.camera_source_get(camera_id).unwrap();
        self.paths
            .path_create(&camera_id.path_name(), &source)
            .await?;

        let stream = ExternalStream {
            name,
            url: url.clone(),
            kind,
            last_validated: None,
            healthy: false,
        };
        self.registry.lock().insert(url.to_string(), stream.clone());

        Ok(stream)
    }

    /// Removes a stream by URL: registry entry, camera binding and server
    /// path. Unknown URLs are a no-op.
    pub async fn stream_remove(
        &self,
        url: &str,
    ) -> Result<(), OperationError> {
        self.registry.lock().remove(url);

        if let Some(camera_id) = self.paths.camera_for_device(url) {
            let path_name = camera_id.path_name();
            self.paths.path_delete(&path_name).await?;
            self.paths.camera_unregister(camera_id);
        }

        Ok(())
    }

    /// One scan pass: probe every candidate, register newcomers, flag
    /// known streams that stopped answering.
    pub async fn scan_once(&self) -> Result<usize, Error> {
        let candidates = candidates_build(&self.config);

        let outcomes = futures::stream::iter(candidates)
            .map(|candidate| async move {
                let reachable = self
                    .transcoder
                    .rtsp_probe(&candidate.url, self.config.probe_timeout)
                    .await
                    .is_ok();
                (candidate, reachable)
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut discovered = 0usize;
        for (candidate, reachable) in outcomes {
            let known = self.registry.lock().contains_key(&candidate.url);

            match (reachable, known) {
                (true, false) => {
                    let url = match candidate.url.parse::<RtspUrl>() {
                        Ok(url) => url,
                        Err(_) => continue,
                    };
                    let name = format!("{}-{}", candidate.kind, url.host());
                    match self.stream_add(name, url, candidate.kind.clone()).await {
                        Ok(_) => {
                            discovered += 1;
                            let mut registry = self.registry.lock();
                            if let Some(stream) = registry.get_mut(&candidate.url) {
                                stream.healthy = true;
                                stream.last_validated = Some(Utc::now());
                            }
                            log::info!("{}: discovered {}", self, candidate.url);
                        }
                        Err(error) => {
                            log::warn!(
                                "{}: failed to register {}: {}",
                                self,
                                candidate.url,
                                error
                            );
                        }
                    }
                }
                (true, true) => {
                    let mut registry = self.registry.lock();
                    if let Some(stream) = registry.get_mut(&candidate.url) {
                        stream.healthy = true;
                        stream.last_validated = Some(Utc::now());
                    }
                }
                (false, true) => {
                    let mut registry = self.registry.lock();
                    if let Some(stream) = registry.get_mut(&candidate.url) {
                        stream.healthy = false;
                    }
                }
                (false, false) => {}
            }
        }

        Ok(discovered)
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        loop {
            match self.scan_once().await {
                Ok(discovered) if discovered > 0 => {
                    log::info!("{}: scan found {} new streams", self, discovered);
                }
                Ok(_) => {}
                Err(error) => log::error!("{}: scan failed: {:?}", self, error),
            }

            select! {
                () = tokio::time::sleep(self.config.scan_interval).fuse() => {},
                () = exit_flag => break,
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
        self.run(exit_flag).await
    }
}
impl fmt::Display for Manager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "discovery::Manager")
    }
}

#[cfg(test)]
mod tests {
    use super::{address_range_expand, candidates_build};
    use crate::config::DiscoveryConfig;
    use std::net::Ipv4Addr;

    #[test]
    fn single_address_expands_to_itself() {
        assert_eq!(
            address_range_expand("192.168.1.50").unwrap(),
            vec![Ipv4Addr::new(192, 168, 1, 50)]
        );
    }

    #[test]
    fn final_octet_range_expands() {
        assert_eq!(
            address_range_expand("10.0.0.1-3").unwrap(),
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ]
        );
    }

    #[test]
    fn malformed_ranges_error() {
        assert!(address_range_expand("not-an-ip").is_err());
        assert!(address_range_expand("10.0.0.9-1").is_err());
    }

    #[test]
    fn candidates_cover_ranges_and_vendor_tables() {
        let config = serde_json::from_value::<DiscoveryConfig>(serde_json::json!({
            "address_ranges": ["10.0.0.1-2"],
            "rtsp_paths": ["/live"],
        }))
        .unwrap();

        let candidates = candidates_build(&config);
        let urls = candidates
            .iter()
            .map(|candidate| candidate.url.as_str())
            .collect::<Vec<_>>();

        assert!(urls.contains(&"rtsp://10.0.0.1:554/live"));
        assert!(urls.contains(&"rtsp://10.0.0.2:554/live"));
        // default vendor table entry
        assert!(urls.contains(&"rtsp://192.168.42.1:554/live"));

        let skydio = candidates
            .iter()
            .find(|candidate| candidate.url.contains("192.168.42.1"))
            .unwrap();
        assert_eq!(skydio.kind, "skydio");
    }

    #[test]
    fn malformed_range_error_in_expand() {
        assert!(address_range_expand("10.0.0").is_err());
    }
}
