//! Clip synthesis from buffered frames using FFmpeg
//!
//! Raw RGB frames are piped to FFmpeg stdin. Encoders are tried in order
//! (hardware H.264, software H.264, MPEG-4, MJPEG); if none works a looping
//! still-frame clip is attempted, and as a last resort the frames are
//! written as Motion-JPEG AVI in-process so the clip path always resolves.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProcessingError;

/// Encoder choices, in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderStrategy {
    Nvenc,
    X264,
    Mpeg4,
    Mjpeg,
}

impl EncoderStrategy {
    pub fn chain(use_hw_encoding: bool) -> Vec<EncoderStrategy> {
        let mut chain = Vec::with_capacity(4);
        if use_hw_encoding {
            chain.push(EncoderStrategy::Nvenc);
        }
        chain.extend([EncoderStrategy::X264, EncoderStrategy::Mpeg4, EncoderStrategy::Mjpeg]);
        chain
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderStrategy::Nvenc => "h264_nvenc",
            EncoderStrategy::X264 => "libx264",
            EncoderStrategy::Mpeg4 => "mpeg4",
            EncoderStrategy::Mjpeg => "mjpeg",
        }
    }

    fn codec_args(&self, quality: u32) -> Vec<String> {
        match self {
            EncoderStrategy::Nvenc => vec![
                "-c:v".into(), "h264_nvenc".into(),
                "-preset".into(), "p4".into(),
                "-rc".into(), "vbr".into(),
                "-cq".into(), quality.to_string(),
                "-pix_fmt".into(), "yuv420p".into(),
            ],
            EncoderStrategy::X264 => vec![
                "-c:v".into(), "libx264".into(),
                "-preset".into(), "veryfast".into(),
                "-crf".into(), quality.to_string(),
                "-pix_fmt".into(), "yuv420p".into(),
            ],
            EncoderStrategy::Mpeg4 => vec![
                "-c:v".into(), "mpeg4".into(),
                "-q:v".into(), "5".into(),
                "-pix_fmt".into(), "yuv420p".into(),
            ],
            EncoderStrategy::Mjpeg => vec![
                "-c:v".into(), "mjpeg".into(),
                "-q:v".into(), "5".into(),
                "-pix_fmt".into(), "yuvj420p".into(),
            ],
        }
    }
}

/// Result of one encoder in the chain
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeAttempt {
    Encoded { strategy: EncoderStrategy, path: PathBuf },
    Failed { strategy: EncoderStrategy, reason: String },
}

#[derive(Debug, Clone)]
pub struct ClipEncoderConfig {
    pub ffmpeg: PathBuf,
    pub use_hw_encoding: bool,
    /// CRF / CQ for the H.264 encoders
    pub quality: u32,
    pub timeout: Duration,
}

impl Default for ClipEncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            use_hw_encoding: false,
            quality: 26,
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct ClipEncoder {
    config: ClipEncoderConfig,
}

impl ClipEncoder {
    pub fn new(config: ClipEncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClipEncoderConfig {
        &self.config
    }

    /// Encode `frames` at `fps`, walking the fallback chain. Every attempt is
    /// reported; the last entry is `Encoded` on success.
    pub async fn encode_frames(&self, frames: &[RgbImage], fps: f32, output: &Path) -> Vec<EncodeAttempt> {
        let mut attempts = Vec::new();
        let Some(first) = frames.first() else {
            return attempts;
        };

        // yuv420p wants even dimensions
        let width = (first.width() & !1).max(2);
        let height = (first.height() & !1).max(2);
        let raw: Arc<Vec<Vec<u8>>> = Arc::new(
            frames
                .iter()
                .map(|f| {
                    if f.dimensions() == (width, height) {
                        f.as_raw().clone()
                    } else {
                        imageops::resize(f, width, height, FilterType::Triangle).into_raw()
                    }
                })
                .collect(),
        );

        for strategy in EncoderStrategy::chain(self.config.use_hw_encoding) {
            match self.encode_with(strategy, raw.clone(), width, height, fps, output).await {
                Ok(()) => {
                    info!("encoded clip {:?} with {}", output, strategy.as_str());
                    attempts.push(EncodeAttempt::Encoded { strategy, path: output.to_path_buf() });
                    return attempts;
                }
                Err(e) => {
                    warn!("{} failed, trying next encoder: {}", strategy.as_str(), e);
                    attempts.push(EncodeAttempt::Failed { strategy, reason: e.to_string() });
                }
            }
        }
        attempts
    }

    async fn encode_with(
        &self,
        strategy: EncoderStrategy,
        frames: Arc<Vec<Vec<u8>>>,
        width: u32,
        height: u32,
        fps: f32,
        output: &Path,
    ) -> Result<(), ProcessingError> {
        let mut cmd = Command::new(&self.config.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-y")
            .arg("-f").arg("rawvideo")
            .arg("-pix_fmt").arg("rgb24")
            .arg("-s").arg(format!("{}x{}", width, height))
            .arg("-r").arg(format!("{:.3}", fps.max(0.1)))
            .arg("-i").arg("-")
            .args(strategy.codec_args(self.config.quality))
            .arg("-movflags").arg("+faststart")
            .arg("-f").arg("mp4")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("spawning ffmpeg encoder: {:?}", cmd);
        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().ok_or(ProcessingError::Ffmpeg {
            stage: "encode",
            stderr: "stdin unavailable".to_string(),
        })?;

        // Feed stdin while waiting so a full stderr pipe can't stall ffmpeg
        let writer = tokio::spawn(async move {
            for frame in frames.iter() {
                stdin.write_all(frame).await?;
            }
            stdin.shutdown().await
        });

        let output_result = tokio::time::timeout(self.config.timeout, child.wait_with_output()).await;
        let write_result = writer.await;

        let output = match output_result {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProcessingError::Timeout {
                    stage: "encode",
                    secs: self.config.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(ProcessingError::Ffmpeg {
                stage: "encode",
                stderr: stderr_tail(&output.stderr),
            });
        }
        if let Ok(Err(e)) = write_result {
            debug!("encoder stdin closed early: {}", e);
        }
        Ok(())
    }

    /// A short clip looping one still frame
    pub async fn still_frame_clip(&self, frame: &RgbImage, output: &Path, seconds: u32) -> Result<(), ProcessingError> {
        let still = output.with_extension("still.jpg");
        write_jpeg(frame, &still)?;

        let args: Vec<String> = vec![
            "-hide_banner".into(), "-loglevel".into(), "error".into(), "-y".into(),
            "-loop".into(), "1".into(),
            "-i".into(), still.to_string_lossy().into_owned(),
            "-t".into(), seconds.max(1).to_string(),
            "-vf".into(), "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
            "-c:v".into(), "mpeg4".into(),
            "-pix_fmt".into(), "yuv420p".into(),
            "-f".into(), "mp4".into(),
            output.to_string_lossy().into_owned(),
        ];
        let result = run_ffmpeg(&self.config.ffmpeg, &args, "still", self.config.timeout).await;
        let _ = tokio::fs::remove_file(&still).await;
        result
    }
}

pub(crate) fn write_jpeg(image: &RgbImage, path: &Path) -> Result<(), ProcessingError> {
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, 85).encode_image(image)?;
    Ok(())
}

/// Run ffmpeg to completion; the process is killed on timeout
pub async fn run_ffmpeg(ffmpeg: &Path, args: &[String], stage: &'static str, timeout: Duration) -> Result<(), ProcessingError> {
    let child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(ProcessingError::Ffmpeg {
            stage,
            stderr: stderr_tail(&output.stderr),
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProcessingError::Timeout {
            stage,
            secs: timeout.as_secs(),
        }),
    }
}

/// ffmpeg is on the path and runs
pub async fn check_ffmpeg(ffmpeg: &Path) -> bool {
    match Command::new(ffmpeg).arg("-version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Which of the chain's encoders this ffmpeg build knows about
pub async fn available_encoders(ffmpeg: &Path) -> Result<Vec<EncoderStrategy>, ProcessingError> {
    let output = Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-encoders")
        .output()
        .await?;
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(parse_encoder_listing(&listing))
}

fn parse_encoder_listing(listing: &str) -> Vec<EncoderStrategy> {
    let names: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    EncoderStrategy::chain(true)
        .into_iter()
        .filter(|s| names.contains(&s.as_str()))
        .collect()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}
