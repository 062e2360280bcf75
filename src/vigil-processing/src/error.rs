//! Processing error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ffmpeg {stage} failed: {stderr}")]
    Ffmpeg { stage: &'static str, stderr: String },

    #[error("ffmpeg {stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("invalid time window: {0}")]
    InvalidWindow(String),

    #[error("no frames to render")]
    NoFrames,

    #[error("render limiter closed")]
    LimiterClosed,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
