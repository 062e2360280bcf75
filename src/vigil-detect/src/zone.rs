//! Zone gating
//!
//! Zones are polygons in normalized [0,1] frame coordinates. A detection is
//! inside a zone when its box center is.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::DetectError;
use crate::inference::Detection;

pub const MIN_ZONE_VERTICES: usize = 3;
pub const MAX_ZONE_VERTICES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneMode {
    #[default]
    Person,
    Motion,
    Both,
}

impl ZoneMode {
    pub fn includes_person(&self) -> bool {
        matches!(self, ZoneMode::Person | ZoneMode::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Zone {
    pub id: String,
    pub polygon: Vec<Point>,
    #[serde(default)]
    pub mode: ZoneMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Zone {
    pub fn validate(&self) -> Result<(), DetectError> {
        let invalid = |reason: String| DetectError::InvalidZone {
            id: self.id.clone(),
            reason,
        };

        let n = self.polygon.len();
        if !(MIN_ZONE_VERTICES..=MAX_ZONE_VERTICES).contains(&n) {
            return Err(invalid(format!(
                "{} vertices, expected {}-{}",
                n, MIN_ZONE_VERTICES, MAX_ZONE_VERTICES
            )));
        }
        if let Some(p) = self.polygon.iter().find(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y)) {
            return Err(invalid(format!("vertex ({}, {}) outside [0,1]", p.x, p.y)));
        }
        Ok(())
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        point_in_polygon(x, y, &self.polygon)
    }
}

/// Ray casting: count edge crossings of a horizontal ray from (x, y)
pub fn point_in_polygon(x: f32, y: f32, polygon: &[Point]) -> bool {
    if polygon.len() < MIN_ZONE_VERTICES {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > y) != (pj.y > y) {
            let x_cross = (pj.x - pi.x) * (y - pi.y) / (pj.y - pi.y) + pi.x;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Filters detections by the camera's person zones
pub struct ZoneFilter;

impl ZoneFilter {
    /// Zones that gate person detections
    pub fn person_zones(zones: &[Zone]) -> impl Iterator<Item = &Zone> {
        zones.iter().filter(|z| z.enabled && z.mode.includes_person())
    }

    /// Keep detections whose center lies in any enabled person zone.
    /// Without such zones every detection passes.
    pub fn filter(detections: Vec<Detection>, frame_width: u32, frame_height: u32, zones: &[Zone]) -> Vec<Detection> {
        if Self::person_zones(zones).next().is_none() {
            return detections;
        }

        detections
            .into_iter()
            .filter(|d| {
                let (x, y) = d.bbox.normalized_center(frame_width, frame_height);
                Self::person_zones(zones).any(|z| z.contains(x, y))
            })
            .collect()
    }

    /// Ids of the person zones containing the detection
    pub fn zones_hit<'a>(detection: &Detection, frame_width: u32, frame_height: u32, zones: &'a [Zone]) -> Vec<&'a str> {
        let (x, y) = detection.bbox.normalized_center(frame_width, frame_height);
        Self::person_zones(zones)
            .filter(|z| z.contains(x, y))
            .map(|z| z.id.as_str())
            .collect()
    }
}

/// Per-zone sliding window of in-zone observations.
///
/// A zone is settled once its window is full and the most recent
/// `min_frames_in_zone` observations were all inside, which keeps a box
/// jittering across the boundary from counting.
#[derive(Debug, Clone)]
pub struct ZoneInertia {
    window: usize,
    min_frames_in_zone: usize,
    histories: HashMap<String, VecDeque<bool>>,
}

impl ZoneInertia {
    pub fn new(window: usize, min_frames_in_zone: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            min_frames_in_zone: min_frames_in_zone.clamp(1, window),
            histories: HashMap::new(),
        }
    }

    /// Record one observation and report whether the zone is settled
    pub fn observe(&mut self, zone_id: &str, in_zone: bool) -> bool {
        let window = self.window;
        let history = self.histories
            .entry(zone_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(window));

        if history.len() == window {
            history.pop_front();
        }
        history.push_back(in_zone);

        if history.len() < window {
            return false;
        }

        let trailing = history.iter().rev().take_while(|&&inside| inside).count();
        trailing >= self.min_frames_in_zone
    }

    /// Feed one frame of detections for every person zone; true if any zone settled
    pub fn observe_frame(&mut self, detections: &[Detection], frame_width: u32, frame_height: u32, zones: &[Zone]) -> bool {
        let mut settled = false;
        for zone in ZoneFilter::person_zones(zones) {
            let inside = detections.iter().any(|d| {
                let (x, y) = d.bbox.normalized_center(frame_width, frame_height);
                zone.contains(x, y)
            });
            settled |= self.observe(&zone.id, inside);
        }
        settled
    }

    pub fn clear(&mut self) {
        self.histories.clear();
    }

    pub fn tracked_zones(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::BoundingBox;

    fn square_zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            polygon: vec![
                Point::new(0.2, 0.2),
                Point::new(0.6, 0.2),
                Point::new(0.6, 0.6),
                Point::new(0.2, 0.6),
            ],
            mode: ZoneMode::Person,
            enabled: true,
        }
    }

    fn det_centered(cx: f32, cy: f32) -> Detection {
        Detection::new(BoundingBox::new(cx - 5.0, cy - 10.0, cx + 5.0, cy + 10.0), 0.9, "person")
    }

    #[test]
    fn test_point_in_polygon() {
        let zone = square_zone("z");
        assert!(zone.contains(0.4, 0.4));
        assert!(!zone.contains(0.7, 0.4));
        assert!(!zone.contains(0.1, 0.1));

        let triangle = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)];
        assert!(point_in_polygon(0.2, 0.2, &triangle));
        assert!(!point_in_polygon(0.8, 0.8, &triangle));
    }

    #[test]
    fn test_filter_inside_and_outside() {
        let zones = vec![square_zone("door")];
        // 100x100 frame: (40, 40) is inside, (80, 80) outside
        let kept = ZoneFilter::filter(vec![det_centered(40.0, 40.0), det_centered(80.0, 80.0)], 100, 100, &zones);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox.center(), (40.0, 40.0));
    }

    #[test]
    fn test_no_zones_passes_everything() {
        let dets = vec![det_centered(80.0, 80.0)];
        assert_eq!(ZoneFilter::filter(dets.clone(), 100, 100, &[]).len(), 1);

        let mut disabled = square_zone("off");
        disabled.enabled = false;
        let mut motion_only = square_zone("motion");
        motion_only.mode = ZoneMode::Motion;
        assert_eq!(ZoneFilter::filter(dets, 100, 100, &[disabled, motion_only]).len(), 1);
    }

    #[test]
    fn test_zones_hit() {
        let zones = vec![square_zone("a"), square_zone("b")];
        assert_eq!(ZoneFilter::zones_hit(&det_centered(40.0, 40.0), 100, 100, &zones), vec!["a", "b"]);
    }

    #[test]
    fn test_zone_validation() {
        assert!(square_zone("ok").validate().is_ok());

        let mut few = square_zone("few");
        few.polygon.truncate(2);
        assert!(few.validate().is_err());

        let mut out_of_range = square_zone("range");
        out_of_range.polygon[0] = Point::new(1.5, 0.2);
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_inertia_needs_consecutive_run() {
        let mut inertia = ZoneInertia::new(4, 3);
        assert!(!inertia.observe("z", true));
        assert!(!inertia.observe("z", true));
        // Window not yet full
        assert!(!inertia.observe("z", true));
        assert!(inertia.observe("z", true));

        // Jitter breaks the run
        assert!(!inertia.observe("z", false));
        assert!(!inertia.observe("z", true));
        assert!(!inertia.observe("z", true));
        assert!(inertia.observe("z", true));
    }

    #[test]
    fn test_inertia_shorter_run_is_false() {
        let mut inertia = ZoneInertia::new(5, 3);
        for inside in [false, true, false, true, true] {
            assert!(!inertia.observe("z", inside));
        }
        assert!(inertia.observe("z", true));
    }

    #[test]
    fn test_observe_frame_and_clear() {
        let zones = vec![square_zone("door")];
        let mut inertia = ZoneInertia::new(2, 2);
        let inside = [det_centered(40.0, 40.0)];
        assert!(!inertia.observe_frame(&inside, 100, 100, &zones));
        assert!(inertia.observe_frame(&inside, 100, 100, &zones));
        assert_eq!(inertia.tracked_zones(), 1);
        inertia.clear();
        assert_eq!(inertia.tracked_zones(), 0);
    }
}
