//! Error types for detection

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    /// Inference backend failed or returned garbage
    #[error("inference error: {0}")]
    Inference(String),

    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid zone {id}: {reason}")]
    InvalidZone { id: String, reason: String },
}
