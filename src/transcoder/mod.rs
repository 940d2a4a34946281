use crate::{
    config::TranscoderConfig,
    util::{
        async_flag,
        runnable::Exited,
    },
};
use anyhow::{Context, Error, anyhow, ensure};
use futures::{future::FutureExt, pin_mut, select, stream::StreamExt};
use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

/// Composes and supervises ffmpeg subprocesses: the on-demand publish
/// command installed on server paths, one-shot frame grabs, and the
/// keepalive readers that hold on-demand paths active.
#[derive(Debug)]
pub struct Transcoder {
    ffmpeg_path: PathBuf,
}
impl Transcoder {
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }

    /// Shell command the media server runs on first consumer of a local
    /// device path. Publishes the device to the path over RTSP.
    pub fn publish_command_build(
        &self,
        device_path: &str,
        target_url: &str,
    ) -> String {
        format!(
            "{} -hide_banner -loglevel error -f v4l2 -i {} \
             -c:v libx264 -preset ultrafast -tune zerolatency -g 30 \
             -f rtsp -rtsp_transport tcp {}",
            self.ffmpeg_path.display(),
            device_path,
            target_url,
        )
    }

    fn command_base(&self) -> Command {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .env_clear()
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args(["-loglevel", "error"])
            .arg("-hide_banner")
            .arg("-nostats")
            .arg("-nostdin");
        command
    }

    // one-shots
    async fn run_one_shot(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut child = command.spawn().context("spawn")?;

        let stderr = child.stderr.take().unwrap();
        let stderr_collect = async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
            collected
        };

        let outcome = tokio::time::timeout(
            timeout,
            futures::future::join(child.wait(), stderr_collect),
        )
        .await;

        let (exit_status, stderr_lines) = match outcome {
            Ok((exit_status, stderr_lines)) => (exit_status.context("wait")?, stderr_lines),
            Err(_) => {
                child.start_kill().context("start_kill")?;
                let _ = child.wait().await;
                return Err(anyhow!("timed out after {:?}", timeout));
            }
        };

        ensure!(
            exit_status.success(),
            "ffmpeg exited with {}: {}",
            exit_status,
            stderr_lines.join(" | "),
        );

        Ok(())
    }

    /// Single frame from a local V4L2 device node into `output`.
    pub async fn frame_from_device(
        &self,
        device_path: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut command = self.command_base();
        command
            .args(["-f", "v4l2"])
            .args(["-i", device_path])
            .args(["-frames:v", "1"])
            .args(["-q:v", "2"])
            .arg("-y")
            .arg(output.as_os_str());

        self.run_one_shot(command, timeout)
            .await
            .context("run_one_shot")?;

        Ok(())
    }

    /// Single frame from an RTSP source into `output`.
    pub async fn frame_from_rtsp(
        &self,
        url: &str,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut command = self.command_base();
        command
            .args(["-rtsp_transport", "tcp"])
            .args(["-i", url])
            .args(["-frames:v", "1"])
            .args(["-q:v", "2"])
            .arg("-y")
            .arg(output.as_os_str());

        self.run_one_shot(command, timeout)
            .await
            .context("run_one_shot")?;

        Ok(())
    }

    /// Transient consumer: connects, decodes one frame into a null sink
    /// and exits. Connecting is what makes the server fire its on-demand
    /// publisher; the single frame bounds the session length.
    pub async fn consume_first_frame(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut command = self.command_base();
        command
            .args(["-rtsp_transport", "tcp"])
            .args(["-i", url])
            .args(["-frames:v", "1"])
            .args(["-f", "null", "-"]);

        self.run_one_shot(command, timeout)
            .await
            .context("run_one_shot")?;

        Ok(())
    }

    // keepalive
    fn keepalive_command_build(
        &self,
        url: &str,
    ) -> Command {
        let mut command = self.command_base();
        command
            .args(["-rtsp_transport", "tcp"])
            .args(["-i", url])
            .args(["-map", "0:v:0"])
            .args(["-codec", "copy"])
            .args(["-f", "null", "-"]);
        command
    }
    async fn keepalive_run_once(
        &self,
        url: &str,
        mut exit_flag: async_flag::Receiver,
    ) -> Result<Exited, Error> {
        let mut command = self.keepalive_command_build(url);
        let mut child = command.spawn().context("spawn")?;

        let stderr = tokio_stream::wrappers::LinesStream::new(
            BufReader::new(child.stderr.take().unwrap()).lines(),
        )
        .for_each(|item| async move {
            match item {
                Ok(line) => log::warn!("{}: keepalive stderr: {}", self, line),
                Err(error) => {
                    log::error!("{}: error while reading keepalive stderr: {:?}", self, error)
                }
            }
        });
        pin_mut!(stderr);
        let mut stderr = stderr.fuse();

        let mut pid = child.id();

        let child_exit_future = child.wait();
        pin_mut!(child_exit_future);
        let mut child_exit_future = child_exit_future.fuse();

        let result = select! {
            child_exit = child_exit_future => {
                pid.take();

                match child_exit {
                    Ok(exit_status) => Err(anyhow!("keepalive exited with {}", exit_status)),
                    Err(error) => Err(anyhow!("keepalive child error: {:?}", error)),
                }
            },
            _ = stderr => Err(anyhow!("stderr exited")),
            () = exit_flag => Ok(Exited),
        };

        #[cfg(target_os = "linux")]
        if let Some(pid) = pid {
            unsafe { libc::kill(pid as i32, libc::SIGINT) };
        }
        #[cfg(not(target_os = "linux"))]
        let _ = pid;

        let _ = child_exit_future.await;

        result
    }
    /// Persistent reader that holds the path active. Restarts with a
    /// fixed delay on subprocess failure, returns on `exit_flag` only.
    pub async fn keepalive_run(
        &self,
        url: &str,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        const ERROR_DELAY: Duration = Duration::from_secs(5);

        loop {
            let error = match self
                .keepalive_run_once(url, exit_flag.clone())
                .await
                .context("keepalive_run_once")
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

    /// RTSP reachability probe used by external stream discovery.
    pub async fn rtsp_probe(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.consume_first_frame(url, timeout)
            .await
            .context("consume_first_frame")?;

        Ok(())
    }
}
impl fmt::Display for Transcoder {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Transcoder ({})", self.ffmpeg_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::Transcoder;
    use crate::config::TranscoderConfig;

    #[test]
    fn publish_command_shape() {
        let transcoder = Transcoder::new(&TranscoderConfig::default());

        let command = transcoder
            .publish_command_build("/dev/video0", "rtsp://127.0.0.1:8554/camera0");

        assert!(command.starts_with("/usr/bin/ffmpeg"));
        assert!(command.contains("-f v4l2 -i /dev/video0"));
        assert!(command.ends_with("rtsp://127.0.0.1:8554/camera0"));
    }
}
