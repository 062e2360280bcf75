//! Geometric and temporal detection filters

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::inference::Detection;

/// Named aspect-ratio bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectPreset {
    Strict,
    #[default]
    Normal,
    Loose,
    Custom,
}

/// Accepted `width / height` range, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspectRatioBounds {
    pub min_ratio: f32,
    pub max_ratio: f32,
}

impl AspectRatioBounds {
    pub fn new(min_ratio: f32, max_ratio: f32) -> Self {
        Self { min_ratio, max_ratio }
    }

    /// Bounds for a preset; `Custom` falls back to `custom`
    pub fn from_preset(preset: AspectPreset, custom: Option<AspectRatioBounds>) -> Self {
        match preset {
            AspectPreset::Strict => Self::new(0.25, 0.9),
            AspectPreset::Normal => Self::new(0.2, 1.2),
            AspectPreset::Loose => Self::new(0.15, 1.6),
            AspectPreset::Custom => custom.unwrap_or_else(|| Self::new(0.2, 1.2)),
        }
    }

    pub fn contains(&self, ratio: f32) -> bool {
        ratio >= self.min_ratio && ratio <= self.max_ratio
    }
}

impl Default for AspectRatioBounds {
    fn default() -> Self {
        Self::from_preset(AspectPreset::Normal, None)
    }
}

/// Drop wide or flat boxes (foliage, fences, parked objects)
pub fn filter_aspect_ratio(detections: Vec<Detection>, bounds: &AspectRatioBounds) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| bounds.contains(d.bbox.aspect_ratio()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalConfig {
    /// Window length, current frame included
    pub min_consecutive_frames: usize,
    /// Frames without a detection tolerated inside the window
    pub max_gap_frames: usize,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            min_consecutive_frames: 3,
            max_gap_frames: 1,
        }
    }
}

/// Whether each of the previous sampled frames had a qualifying detection.
///
/// Fixed-size sliding window; the oldest entry falls off on push.
#[derive(Debug, Clone)]
pub struct DetectionHistory {
    frames: VecDeque<bool>,
    capacity: usize,
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, had_detection: bool) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(had_detection);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = bool> + '_ {
        self.frames.iter().copied()
    }
}

impl FromIterator<bool> for DetectionHistory {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let frames: VecDeque<bool> = iter.into_iter().collect();
        let capacity = frames.len().max(1);
        Self { frames, capacity }
    }
}

/// Temporal consistency over the last `min_consecutive_frames` frames
/// (history tail plus current).
///
/// A frame with no current detections always fails, as does a window that is
/// not yet full. Otherwise the window passes when its frames without a
/// detection number at most `max_gap_frames`.
pub fn is_temporally_consistent(current: &[Detection], history: &DetectionHistory, config: &TemporalConfig) -> bool {
    if current.is_empty() {
        return false;
    }

    let window = config.min_consecutive_frames.max(1);
    let needed_history = window - 1;
    if history.len() < needed_history {
        return false;
    }

    let gaps = history
        .iter()
        .rev()
        .take(needed_history)
        .filter(|had| !had)
        .count();

    gaps <= config.max_gap_frames
}
