//! Motion gate
//!
//! Frame differencing at a small working resolution decides whether the scene
//! changed enough to be worth running inference on.

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use std::time::Duration;
use tracing::warn;

use crate::error::DetectError;

/// Motion gate settings
#[derive(Debug, Clone, PartialEq)]
pub struct MotionConfig {
    /// 1 (least sensitive) to 10 (most sensitive)
    pub sensitivity: u8,
    /// Changed pixels at working resolution needed to count as motion
    pub min_area: u32,
    /// Motion stays active this long after the last real movement
    pub cooldown: Duration,
    pub work_width: u32,
    pub work_height: u32,
    pub blur_sigma: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sensitivity: 5,
            min_area: 500,
            cooldown: Duration::from_secs(5),
            work_width: 320,
            work_height: 180,
            blur_sigma: 3.0,
        }
    }
}

impl MotionConfig {
    /// Per-pixel difference threshold derived from sensitivity
    pub fn threshold(&self) -> u8 {
        let sensitivity = self.sensitivity.clamp(1, 10) as i32;
        (60 - sensitivity * 5).max(10) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionReason {
    /// No previous frame to compare against
    Warmup,
    Movement,
    /// No new movement, but still inside the cooldown window
    Cooldown,
    Still,
    /// The gate failed internally and let the frame through
    FailOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionVerdict {
    pub active: bool,
    pub changed_pixels: u32,
    pub reason: MotionReason,
}

/// Per-camera gate state
#[derive(Debug, Default, Clone)]
pub struct MotionState {
    previous: Option<GrayImage>,
    last_motion: Option<DateTime<Utc>>,
}

impl MotionState {
    pub fn last_motion(&self) -> Option<DateTime<Utc>> {
        self.last_motion
    }
}

/// Compare `image` against the previous frame and update `state`
pub fn update(
    state: &mut MotionState,
    config: &MotionConfig,
    image: &RgbImage,
    now: DateTime<Utc>,
) -> Result<MotionVerdict, DetectError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(DetectError::InvalidFrame("empty frame".to_string()));
    }
    if config.work_width == 0 || config.work_height == 0 {
        return Err(DetectError::InvalidFrame("zero working resolution".to_string()));
    }

    let small = imageops::resize(image, config.work_width, config.work_height, FilterType::Triangle);
    let gray = imageops::grayscale(&small);
    let current = imageops::blur(&gray, config.blur_sigma);

    let previous = state.previous.replace(current);
    let Some(previous) = previous.filter(|p| p.dimensions() == (config.work_width, config.work_height)) else {
        return Ok(MotionVerdict {
            active: true,
            changed_pixels: 0,
            reason: MotionReason::Warmup,
        });
    };

    // `state.previous` now holds the current frame
    let current = state.previous.as_ref()
        .ok_or_else(|| DetectError::InvalidFrame("motion state lost".to_string()))?;
    let threshold = config.threshold();
    let changed_pixels = previous
        .as_raw()
        .iter()
        .zip(current.as_raw())
        .filter(|(a, b)| a.abs_diff(**b) > threshold)
        .count() as u32;

    if changed_pixels >= config.min_area {
        state.last_motion = Some(now);
        return Ok(MotionVerdict {
            active: true,
            changed_pixels,
            reason: MotionReason::Movement,
        });
    }

    let in_cooldown = state.last_motion.is_some_and(|last| {
        (now - last).to_std().map(|elapsed| elapsed < config.cooldown).unwrap_or(true)
    });

    Ok(MotionVerdict {
        active: in_cooldown,
        changed_pixels,
        reason: if in_cooldown { MotionReason::Cooldown } else { MotionReason::Still },
    })
}

/// Motion gate owning one camera's state
#[derive(Debug, Clone)]
pub struct MotionGate {
    config: MotionConfig,
    state: MotionState,
}

impl MotionGate {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            state: MotionState::default(),
        }
    }

    /// Swap settings; keeps the reference frame if the working size is unchanged
    pub fn set_config(&mut self, config: MotionConfig) {
        if (config.work_width, config.work_height) != (self.config.work_width, self.config.work_height) {
            self.state.previous = None;
        }
        self.config = config;
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Fail-open check: internal errors report motion as active
    pub fn check(&mut self, image: &RgbImage, now: DateTime<Utc>) -> MotionVerdict {
        match update(&mut self.state, &self.config, image, now) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("motion gate failed, passing frame through: {}", e);
                MotionVerdict {
                    active: true,
                    changed_pixels: 0,
                    reason: MotionReason::FailOpen,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = MotionState::default();
    }
}
