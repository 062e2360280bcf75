//! vigil-processing - Recording and event media for Vigil
//!
//! Always-on segmented recording per camera, clip extraction across segments,
//! and the bounded-concurrency renderer that turns a confirmed event into a
//! collage, an animated preview and a clip.

pub mod avi;
pub mod encoder;
pub mod error;
pub mod media;
pub mod recorder;
pub mod render;
pub mod ring_buffer;
pub mod segment;

pub use avi::{encode_mjpeg_avi, write_mjpeg_avi};
pub use encoder::{available_encoders, check_ffmpeg, ClipEncoder, ClipEncoderConfig, EncodeAttempt, EncoderStrategy};
pub use error::ProcessingError;
pub use media::{ArtifactSet, ClipArtifact, ClipSource, EventMedia, MediaConfig, MediaPipeline, RenderLimiter, RenderPermit};
pub use recorder::{ClipExtraction, ContinuousRecorder, RecorderConfig, RetentionReport, Unavailable};
pub use ring_buffer::{FrameRingBuffer, RingConfig, SampledFrame};
pub use segment::{list_segments, ExtractPlan, Segment};
