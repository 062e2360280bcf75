//! Bounded, decimated per-camera frame buffer
//!
//! Holds the recent sampled frames (with their detections) that event media
//! is rendered from. Frames closer together than `min_interval` are dropped
//! and the oldest frame is evicted once `capacity` is reached.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use vigil_capture::Frame;
use vigil_detect::Detection;

/// A frame together with what the detector saw in it
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl SampledFrame {
    pub fn new(frame: Frame, detections: Vec<Detection>) -> Self {
        Self { frame, detections }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.frame.timestamp
    }

    pub fn peak_confidence(&self) -> Option<f32> {
        self.detections
            .iter()
            .map(|d| d.confidence)
            .max_by(|a, b| a.total_cmp(b))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    pub capacity: usize,
    pub min_interval: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            min_interval: Duration::from_millis(250),
        }
    }
}

struct Inner {
    frames: VecDeque<SampledFrame>,
    last_accepted: Option<DateTime<Utc>>,
}

pub struct FrameRingBuffer {
    config: RingConfig,
    inner: Mutex<Inner>,
}

impl FrameRingBuffer {
    pub fn new(config: RingConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            config: RingConfig { capacity, ..config },
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                last_accepted: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Offer a sample; returns false when it was decimated away
    pub fn push(&self, sample: SampledFrame) -> bool {
        let mut inner = self.lock();
        let ts = sample.timestamp();

        if let Some(last) = inner.last_accepted {
            let gap = (ts - last).to_std().unwrap_or(Duration::ZERO);
            if gap < self.config.min_interval {
                return false;
            }
        }

        if inner.frames.len() == self.config.capacity {
            inner.frames.pop_front();
        }
        inner.frames.push_back(sample);
        inner.last_accepted = Some(ts);
        true
    }

    /// Copy of every buffered sample, oldest first
    pub fn snapshot(&self) -> Vec<SampledFrame> {
        self.lock().frames.iter().cloned().collect()
    }

    /// Samples with `start <= timestamp <= end`
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SampledFrame> {
        self.lock()
            .frames
            .iter()
            .filter(|s| s.timestamp() >= start && s.timestamp() <= end)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<SampledFrame> {
        self.lock().frames.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.frames.clear();
        inner.last_accepted = None;
    }
}
