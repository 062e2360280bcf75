//! Stream decoding through an ffmpeg subprocess
//!
//! ffmpeg decodes the camera stream and writes scaled rgb24 frames to stdout,
//! one fixed-size frame after another. The reader thread pulls them with
//! blocking reads.

use image::RgbImage;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::CaptureError;

/// Decoder hint passed to ffmpeg ahead of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecHint {
    /// Let ffmpeg probe the stream
    Auto,
    H264,
    Hevc,
    Mjpeg,
}

impl CodecHint {
    /// Probe order when nothing is remembered for a camera
    pub const ALL: [CodecHint; 4] = [CodecHint::Auto, CodecHint::H264, CodecHint::Hevc, CodecHint::Mjpeg];

    /// ffmpeg decoder name, `None` for automatic probing
    pub fn decoder_name(&self) -> Option<&'static str> {
        match self {
            CodecHint::Auto => None,
            CodecHint::H264 => Some("h264"),
            CodecHint::Hevc => Some("hevc"),
            CodecHint::Mjpeg => Some("mjpeg"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.decoder_name().unwrap_or("auto")
    }
}

/// Handle that can tear down a decoder from outside the reader thread.
///
/// The reader owns the decoder and may be stuck in a blocking read; killing
/// the child through this handle closes its stdout and unblocks the read.
#[derive(Clone, Default)]
pub struct ReleaseHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl ReleaseHandle {
    fn install(&self, child: Child) {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut previous) = slot.replace(child) {
            let _ = previous.kill();
            let _ = previous.wait();
        }
    }

    /// Kill the underlying process, if any
    pub fn release(&self) {
        let child = self.child.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    pub fn is_active(&self) -> bool {
        self.child.lock().map(|c| c.is_some()).unwrap_or(false)
    }
}

/// A blocking decoder the reader thread drives.
pub trait StreamDecoder: Send + 'static {
    /// Open the stream using the given codec hint
    fn open(&mut self, url: &str, hint: CodecHint) -> Result<(), CaptureError>;

    /// Block until the next frame is decoded
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;

    /// Release the underlying stream
    fn release(&mut self);

    /// Handle for forced release from another thread
    fn release_handle(&self) -> ReleaseHandle;
}

/// Decoder backed by an `ffmpeg` child process.
pub struct FfmpegDecoder {
    ffmpeg: PathBuf,
    width: u32,
    height: u32,
    handle: ReleaseHandle,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
}

impl FfmpegDecoder {
    /// Frames are scaled to `width`x`height` by ffmpeg
    pub fn new(ffmpeg: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            width,
            height,
            handle: ReleaseHandle::default(),
            stdout: None,
            buffer: vec![0; width as usize * height as usize * 3],
        }
    }
}

impl StreamDecoder for FfmpegDecoder {
    fn open(&mut self, url: &str, hint: CodecHint) -> Result<(), CaptureError> {
        self.release();

        let args = decode_args(url, hint, self.width, self.height);
        debug!("spawning ffmpeg decoder ({}): {:?}", hint.as_str(), args);

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CaptureError::Spawn {
                url: url.to_string(),
                source,
            })?;

        let stdout = child.stdout.take()
            .ok_or_else(|| CaptureError::StreamUnavailable("failed to open ffmpeg stdout".to_string()))?;

        self.stdout = Some(stdout);
        self.handle.install(child);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let stdout = self.stdout.as_mut().ok_or(CaptureError::NotOpen)?;

        if let Err(e) = stdout.read_exact(&mut self.buffer) {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CaptureError::StreamEnded,
                _ => CaptureError::Io(e),
            });
        }

        let expected = self.buffer.len();
        RgbImage::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or(CaptureError::InvalidFrame { expected, actual: expected })
    }

    fn release(&mut self) {
        self.stdout = None;
        self.handle.release();
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.handle.clone()
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Build the ffmpeg argument list for decoding `url` into raw rgb24 frames
pub fn decode_args(url: &str, hint: CodecHint, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

    if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    } else if !url.contains("://") {
        // Local files are paced like a live stream
        args.push("-re".into());
    }

    if let Some(decoder) = hint.decoder_name() {
        args.extend(["-c:v".into(), decoder.into()]);
    }

    args.extend([
        "-i".into(),
        url.into(),
        "-an".into(),
        "-vf".into(),
        format!("scale={}:{}", width, height),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-f".into(),
        "rawvideo".into(),
        "-".into(),
    ]);

    args
}
