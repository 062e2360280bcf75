//! Decoded frame handed from the reader to downstream stages

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::Arc;

use crate::error::CaptureError;

/// A decoded RGB frame.
///
/// Pixels sit behind an `Arc` so the reader, the detector and the ring buffer
/// can all hold the same frame; nothing mutates a frame after it is published.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: Arc<str>,
    pub timestamp: DateTime<Utc>,
    image: Arc<RgbImage>,
}

impl Frame {
    /// Wrap an already decoded image
    pub fn from_image(camera_id: impl Into<Arc<str>>, timestamp: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            camera_id: camera_id.into(),
            timestamp,
            image: Arc::new(image),
        }
    }

    /// Build a frame from packed rgb24 bytes
    pub fn from_rgb(
        camera_id: impl Into<Arc<str>>,
        timestamp: DateTime<Utc>,
        width: u32,
        height: u32,
        data: Vec<u8>,
    ) -> Result<Self, CaptureError> {
        let expected = width as usize * height as usize * 3;
        let actual = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(CaptureError::InvalidFrame { expected, actual })?;
        Ok(Self::from_image(camera_id, timestamp, image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Raw rgb24 pixel bytes
    pub fn data(&self) -> &[u8] {
        self.image.as_raw()
    }
}
