//! vigil-capture - Live camera stream ingestion for Vigil
//!
//! Decodes camera streams through an ffmpeg subprocess and exposes the
//! newest decoded frame per camera through a single overwrite-on-write slot.

pub mod decoder;
pub mod error;
pub mod frame;
pub mod source;

pub use decoder::{CodecHint, FfmpegDecoder, ReleaseHandle, StreamDecoder};
pub use error::CaptureError;
pub use frame::Frame;
pub use source::{CodecMemory, FrameSource, SourceConfig, SourceState};
