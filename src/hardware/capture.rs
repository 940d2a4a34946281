use anyhow::Error;
use std::time::Duration;

#[cfg(target_os = "linux")]
use anyhow::Context as _;

/// Direct in-process frame grab from a V4L2 capture node, returning one
/// JPEG-encoded frame. Only devices exposing an MJPG pixel format are
/// eligible; anything else falls through to the transcoder tier.
#[cfg(target_os = "linux")]
pub async fn frame_grab_jpeg(
    device_path: &str,
    timeout: Duration,
) -> Result<Vec<u8>, Error> {
    let device_path = device_path.to_owned();

    let grab = tokio::task::spawn_blocking(move || frame_grab_jpeg_blocking(&device_path));

    let frame = tokio::time::timeout(timeout, grab)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?}", timeout))?
        .context("spawn_blocking")?
        .context("frame_grab_jpeg_blocking")?;

    Ok(frame)
}

#[cfg(target_os = "linux")]
fn frame_grab_jpeg_blocking(device_path: &str) -> Result<Vec<u8>, Error> {
    use anyhow::ensure;
    use v4l::{
        FourCC,
        buffer::Type,
        io::traits::CaptureStream,
        prelude::*,
        video::Capture,
    };

    const JPEG_MAGIC: [u8; 2] = [0xff, 0xd8];

    let device = Device::with_path(device_path).context("with_path")?;

    let mut format = device.format().context("format")?;
    format.fourcc = FourCC::new(b"MJPG");
    let format = device.set_format(&format).context("set_format")?;
    ensure!(
        format.fourcc == FourCC::new(b"MJPG"),
        "device does not expose MJPG: {}",
        format.fourcc
    );

    let mut stream =
        MmapStream::with_buffers(&device, Type::VideoCapture, 2).context("with_buffers")?;

    // the first buffer frequently holds a stale or partial frame
    stream.next().context("next")?;
    let (buffer, metadata) = stream.next().context("next")?;

    let frame = buffer[..metadata.bytesused as usize].to_vec();
    ensure!(
        frame.len() >= JPEG_MAGIC.len() && frame[..2] == JPEG_MAGIC,
        "captured frame is not a jpeg"
    );

    Ok(frame)
}

#[cfg(not(target_os = "linux"))]
pub async fn frame_grab_jpeg(
    _device_path: &str,
    _timeout: Duration,
) -> Result<Vec<u8>, Error> {
    anyhow::bail!("direct hardware capture is only supported on linux")
}
