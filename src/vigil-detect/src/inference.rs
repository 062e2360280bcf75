//! Inference seam
//!
//! The model itself lives outside Vigil: a `Detector` takes a frame and a
//! confidence threshold and returns bounding boxes.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::DetectError;

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// width / height; infinite for a zero-height box
    pub fn aspect_ratio(&self) -> f32 {
        let h = self.height();
        if h <= 0.0 {
            f32::INFINITY
        } else {
            self.width() / h
        }
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Center in [0,1] coordinates of a `width`x`height` frame
    pub fn normalized_center(&self, width: u32, height: u32) -> (f32, f32) {
        let (cx, cy) = self.center();
        (cx / width.max(1) as f32, cy / height.max(1) as f32)
    }
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }
}

/// Inference capability: frame in, boxes out.
///
/// Implementations block; callers run them on a blocking worker.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn infer(&self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>, DetectError>;
}

/// Keep only detections of the target class
pub fn retain_class(detections: Vec<Detection>, class: &str) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.label.eq_ignore_ascii_case(class))
        .collect()
}

/// Highest-confidence detection
pub fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Detector that never finds anything; used for recording-only deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &'static str {
        "null"
    }

    fn infer(&self, _image: &RgbImage, _confidence: f32) -> Result<Vec<Detection>, DetectError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    bbox: [f32; 4],
    confidence: f32,
    label: String,
}

/// Detector backed by an HTTP inference service.
///
/// Posts the frame as JPEG to `endpoint?confidence=<c>` and expects
/// `{"detections": [{"bbox": [x1, y1, x2, y2], "confidence": f, "label": s}]}`.
/// `infer` must be called from a tokio blocking worker (`spawn_blocking`).
pub struct HttpDetector {
    endpoint: String,
    client: reqwest::Client,
    jpeg_quality: u8,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            jpeg_quality: 85,
        })
    }

    async fn request(&self, body: Vec<u8>, confidence: f32) -> Result<Vec<Detection>, DetectError> {
        let resp = self.client
            .post(&self.endpoint)
            .query(&[("confidence", confidence)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(DetectError::Inference(format!("service returned {}", resp.status())));
        }

        let parsed: WireResponse = resp.json().await?;
        Ok(parsed.detections.into_iter().map(Into::into).collect())
    }
}

impl From<WireDetection> for Detection {
    fn from(w: WireDetection) -> Self {
        Detection::new(BoundingBox::new(w.bbox[0], w.bbox[1], w.bbox[2], w.bbox[3]), w.confidence, w.label)
    }
}

impl Detector for HttpDetector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn infer(&self, image: &RgbImage, confidence: f32) -> Result<Vec<Detection>, DetectError> {
        let mut body = Vec::new();
        JpegEncoder::new_with_quality(&mut body, self.jpeg_quality).encode_image(image)?;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DetectError::Inference(format!("no runtime for inference request: {}", e)))?;
        let detections = handle.block_on(self.request(body, confidence))?;

        debug!("inference returned {} detection(s)", detections.len());
        Ok(detections.into_iter().filter(|d| d.confidence >= confidence).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_geometry() {
        let b = BoundingBox::new(10.0, 20.0, 40.0, 100.0);
        assert_eq!(b.width(), 30.0);
        assert_eq!(b.height(), 80.0);
        assert!((b.aspect_ratio() - 0.375).abs() < 1e-6);
        assert_eq!(b.normalized_center(100, 200), (0.25, 0.3));
        assert!(BoundingBox::new(0.0, 5.0, 10.0, 5.0).aspect_ratio().is_infinite());
    }

    #[test]
    fn test_retain_class_and_best() {
        let dets = vec![
            Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 2.0), 0.4, "person"),
            Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 2.0), 0.9, "car"),
            Detection::new(BoundingBox::new(0.0, 0.0, 1.0, 2.0), 0.7, "Person"),
        ];
        let people = retain_class(dets, "person");
        assert_eq!(people.len(), 2);
        assert_eq!(best_detection(&people).map(|d| d.confidence), Some(0.7));
        assert!(best_detection(&[]).is_none());
    }

    #[test]
    fn test_wire_format_parses() {
        let json = r#"{"detections":[{"bbox":[1,2,3,4],"confidence":0.8,"label":"person"}]}"#;
        let parsed: WireResponse = serde_json::from_str(json).unwrap();
        let det: Detection = parsed.detections.into_iter().next().unwrap().into();
        assert_eq!(det.bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(det.label, "person");
    }

    #[test]
    fn test_null_detector() {
        let img = RgbImage::new(8, 8);
        assert!(NullDetector.infer(&img, 0.5).unwrap().is_empty());
    }
}
