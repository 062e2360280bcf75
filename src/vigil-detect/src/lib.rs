//! vigil-detect - False-positive suppression for Vigil
//!
//! Cascaded filtering of camera frames: a cheap motion gate, modality-aware
//! preprocessing, the inference seam, geometric and temporal filters, zone
//! gating and the per-camera event debouncer.

pub mod debounce;
pub mod error;
pub mod filters;
pub mod inference;
pub mod motion;
pub mod preprocess;
pub mod zone;

pub use debounce::{ConfirmedEvent, DebounceConfig, DebounceOutcome, DebounceState, EventDebouncer};
pub use error::DetectError;
pub use filters::{filter_aspect_ratio, is_temporally_consistent, AspectPreset, AspectRatioBounds, DetectionHistory, TemporalConfig};
pub use inference::{best_detection, retain_class, BoundingBox, Detection, Detector, HttpDetector, NullDetector};
pub use motion::{MotionConfig, MotionGate, MotionReason, MotionState, MotionVerdict};
pub use preprocess::{preprocess, Modality};
pub use zone::{point_in_polygon, Point, Zone, ZoneFilter, ZoneInertia, ZoneMode};
