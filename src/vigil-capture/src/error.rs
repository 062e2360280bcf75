//! Capture error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn decoder for {url}: {source}")]
    Spawn {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("stream ended")]
    StreamEnded,

    #[error("decoder not open")]
    NotOpen,

    #[error("invalid frame buffer: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
}
