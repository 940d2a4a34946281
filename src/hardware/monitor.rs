use super::HardwareEvent;
use crate::util::{
    async_flag,
    runnable::{Exited, Runnable},
};
use anyhow::{Context as _, Error};
use async_trait::async_trait;
use atomic_refcell::AtomicRefCell;
use futures::{channel::mpsc, future::FutureExt, select};
use parking_lot::Mutex;
use std::{collections::BTreeSet, fmt, time::Duration};

#[cfg(target_os = "linux")]
use futures::{pin_mut, stream::StreamExt};

const DEV_DIRECTORY: &str = "/dev";

/// Watches for V4L2 capture nodes appearing and disappearing and feeds
/// connect/disconnect events to the controller. On non-Linux targets the
/// monitor is inert: no devices, no events.
#[derive(Debug)]
pub struct Monitor {
    event_sender: mpsc::UnboundedSender<HardwareEvent>,
    event_receiver: AtomicRefCell<Option<mpsc::UnboundedReceiver<HardwareEvent>>>,

    known_devices: Mutex<BTreeSet<String>>,
}
impl Monitor {
    pub fn new() -> Self {
        let (event_sender, event_receiver) = mpsc::unbounded::<HardwareEvent>();
        let event_receiver = AtomicRefCell::new(Some(event_receiver));

        let known_devices = BTreeSet::new();
        let known_devices = Mutex::new(known_devices);

        Self {
            event_sender,
            event_receiver,

            known_devices,
        }
    }

    /// The single consumer end of the event feed. Panics on second take.
    pub fn event_receiver_take(&self) -> mpsc::UnboundedReceiver<HardwareEvent> {
        self.event_receiver.borrow_mut().take().unwrap()
    }

    /// Device node path for a `/dev` entry name, if it is a capture node.
    /// Returns the node's numeric index for ordering.
    fn device_name_parse(name: &str) -> Option<(usize, String)> {
        let index = name.strip_prefix("video")?;
        if index.is_empty() || !index.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let index = index.parse::<usize>().ok()?;

        Some((index, format!("{}/{}", DEV_DIRECTORY, name)))
    }

    /// Enumerates currently present capture nodes, ordered ascending by
    /// device integer then lexicographically by path, and marks them
    /// known. Run once before the watch loop starts.
    pub async fn initial_scan(&self) -> Result<Vec<String>, Error> {
        let mut devices: Vec<(usize, String)> = Vec::new();

        let mut entries = match tokio::fs::read_dir(DEV_DIRECTORY).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(error).context("read_dir"),
        };
        while let Some(entry) = entries.next_entry().await.context("next_entry")? {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some((index, device_path)) = Self::device_name_parse(name) {
                devices.push((index, device_path));
            }
        }

        devices.sort();
        let devices = devices
            .into_iter()
            .map(|(_, device_path)| device_path)
            .collect::<Vec<_>>();

        *self.known_devices.lock() = devices.iter().cloned().collect();

        Ok(devices)
    }

    fn device_appeared(
        &self,
        device_path: String,
    ) {
        if !self.known_devices.lock().insert(device_path.clone()) {
            return;
        }
        let _ = self
            .event_sender
            .unbounded_send(HardwareEvent::Connected { device_path });
    }
    fn device_disappeared(
        &self,
        device_path: String,
    ) {
        if !self.known_devices.lock().remove(&device_path) {
            return;
        }
        let _ = self
            .event_sender
            .unbounded_send(HardwareEvent::Disconnected { device_path });
    }

    #[cfg(target_os = "linux")]
    async fn watch_run_once(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Result<Exited, Error> {
        use inotify::{Inotify, WatchMask};

        let mut inotify_instance = Inotify::init().context("inotify_instance")?;
        inotify_instance
            .watches()
            .add(DEV_DIRECTORY, WatchMask::CREATE | WatchMask::DELETE | WatchMask::ATTRIB)
            .context("add")?;

        const INOTIFY_BUFFER_SIZE: usize = 1024;
        let buffer = bytes::BytesMut::zeroed(INOTIFY_BUFFER_SIZE);

        let event_stream = inotify_instance
            .into_event_stream(buffer)
            .context("event_stream")?;
        pin_mut!(event_stream);
        let mut event_stream = event_stream.fuse();

        loop {
            select! {
                event = event_stream.next() => {
                    let event = match event {
                        Some(event) => event.context("event")?,
                        None => anyhow::bail!("event stream closed"),
                    };

                    let name = match event.name.as_ref().and_then(|name| name.to_str()) {
                        Some(name) => name,
                        None => continue,
                    };
                    let (_, device_path) = match Self::device_name_parse(name) {
                        Some(parsed) => parsed,
                        None => continue,
                    };

                    if event.mask.contains(inotify::EventMask::DELETE) {
                        self.device_disappeared(device_path);
                    } else {
                        self.device_appeared(device_path);
                    }
                },
                () = exit_flag => break,
            }
        }

        Ok(Exited)
    }
    #[cfg(not(target_os = "linux"))]
    async fn watch_run_once(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Result<Exited, Error> {
        exit_flag.await;

        Ok(Exited)
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        const ERROR_DELAY: Duration = Duration::from_secs(5);

        loop {
            let error = match self
                .watch_run_once(exit_flag.clone())
                .await
                .context("watch_run_once")
            {
                Ok(Exited) => break,
                Err(error) => error,
            };
            log::error!("{}: {:?}", self, error);

            select! {
                () = tokio::time::sleep(ERROR_DELAY).fuse() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for Monitor {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for Monitor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "hardware::Monitor")
    }
}

#[cfg(test)]
mod tests {
    use super::Monitor;

    #[test]
    fn device_names_parse() {
        assert_eq!(
            Monitor::device_name_parse("video0"),
            Some((0, "/dev/video0".to_owned()))
        );
        assert_eq!(
            Monitor::device_name_parse("video12"),
            Some((12, "/dev/video12".to_owned()))
        );
        assert_eq!(Monitor::device_name_parse("video"), None);
        assert_eq!(Monitor::device_name_parse("video1a"), None);
        assert_eq!(Monitor::device_name_parse("sda1"), None);
    }

    #[test]
    fn events_deduplicate() {
        use super::HardwareEvent;
        use futures::{FutureExt, StreamExt};

        let monitor = Monitor::new();
        let mut receiver = monitor.event_receiver_take();

        monitor.device_appeared("/dev/video0".to_owned());
        monitor.device_appeared("/dev/video0".to_owned());
        monitor.device_disappeared("/dev/video0".to_owned());
        monitor.device_disappeared("/dev/video0".to_owned());

        assert_eq!(
            receiver.next().now_or_never().unwrap(),
            Some(HardwareEvent::Connected {
                device_path: "/dev/video0".to_owned()
            })
        );
        assert_eq!(
            receiver.next().now_or_never().unwrap(),
            Some(HardwareEvent::Disconnected {
                device_path: "/dev/video0".to_owned()
            })
        );
        assert!(receiver.next().now_or_never().is_none());
    }
}
