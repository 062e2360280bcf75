//! Read-mostly configuration snapshots for running cameras

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use vigil_detect::{Modality, MotionConfig, Zone};

use crate::config::{CameraConfig, Config, DetectionSettings};

/// Everything a camera's detection loop reads from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSnapshot {
    pub camera_id: String,
    pub detection: DetectionSettings,
    pub motion: MotionConfig,
    pub modality: Modality,
    pub zones: Vec<Zone>,
    pub target_class: String,
}

impl CameraSnapshot {
    pub fn build(config: &Config, camera: &CameraConfig) -> Self {
        let detection = config.detection.with_overrides(&camera.overrides);
        Self {
            camera_id: camera.id.clone(),
            motion: config.motion.to_motion_config(detection.motion_sensitivity),
            modality: detection.modality,
            zones: camera.zones.clone(),
            target_class: config.inference.target_class.clone(),
            detection,
        }
    }
}

/// Source of per-camera tunables
pub trait ConfigProvider: Send + Sync {
    fn camera(&self, camera_id: &str) -> Option<CameraSnapshot>;
}

/// Serves snapshots from an in-memory `Config`; `replace` swaps it live
pub struct StaticConfigProvider {
    config: RwLock<Config>,
}

impl StaticConfigProvider {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn replace(&self, config: Config) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Add or replace one camera's entry
    pub fn upsert_camera(&self, camera: CameraConfig) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        match config.cameras.iter_mut().find(|c| c.id == camera.id) {
            Some(existing) => *existing = camera,
            None => config.cameras.push(camera),
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn camera(&self, camera_id: &str) -> Option<CameraSnapshot> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config
            .camera(camera_id)
            .map(|camera| CameraSnapshot::build(&config, camera))
    }
}

/// Caches one camera's snapshot so the provider isn't hit per frame
pub struct SnapshotCache {
    ttl: Duration,
    cached: Option<(Instant, Arc<CameraSnapshot>)>,
}

impl SnapshotCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, cached: None }
    }

    /// Fresh snapshot, refreshed after `ttl`. A provider that stops knowing
    /// the camera leaves the last snapshot in place.
    pub fn get(&mut self, provider: &dyn ConfigProvider, camera_id: &str) -> Option<Arc<CameraSnapshot>> {
        self.get_at(provider, camera_id, Instant::now())
    }

    fn get_at(&mut self, provider: &dyn ConfigProvider, camera_id: &str, now: Instant) -> Option<Arc<CameraSnapshot>> {
        if let Some((fetched, snapshot)) = &self.cached {
            if now.duration_since(*fetched) < self.ttl {
                return Some(snapshot.clone());
            }
        }

        match provider.camera(camera_id) {
            Some(fresh) => {
                let fresh = Arc::new(fresh);
                self.cached = Some((now, fresh.clone()));
                Some(fresh)
            }
            None => self.cached.as_ref().map(|(_, s)| s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        inner: StaticConfigProvider,
        calls: AtomicUsize,
    }

    impl ConfigProvider for CountingProvider {
        fn camera(&self, camera_id: &str) -> Option<CameraSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.camera(camera_id)
        }
    }

    fn config_with(confidence: f32) -> Config {
        let mut config = Config::default();
        config.detection.confidence = confidence;
        config.cameras.push(CameraConfig::new("front", "rtsp://cam/1"));
        config
    }

    #[test]
    fn test_snapshot_merges_overrides() {
        let mut config = config_with(0.5);
        config.cameras[0].overrides.motion_sensitivity = Some(9);
        config.cameras[0].overrides.modality = Some(Modality::Thermal);

        let snapshot = StaticConfigProvider::new(config).camera("front").unwrap();
        assert_eq!(snapshot.motion.sensitivity, 9);
        assert_eq!(snapshot.modality, Modality::Thermal);
        assert_eq!(snapshot.target_class, "person");
    }

    #[test]
    fn test_cache_respects_ttl() {
        let provider = CountingProvider {
            inner: StaticConfigProvider::new(config_with(0.5)),
            calls: AtomicUsize::new(0),
        };
        let mut cache = SnapshotCache::new(Duration::from_secs(5));
        let t0 = Instant::now();

        cache.get_at(&provider, "front", t0).unwrap();
        cache.get_at(&provider, "front", t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        provider.inner.replace(config_with(0.7));
        let refreshed = cache.get_at(&provider, "front", t0 + Duration::from_secs(6)).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed.detection.confidence, 0.7);
    }

    #[test]
    fn test_cache_keeps_last_snapshot_when_camera_disappears() {
        let provider = StaticConfigProvider::new(config_with(0.5));
        let mut cache = SnapshotCache::new(Duration::ZERO);
        assert!(cache.get(&provider, "front").is_some());

        provider.replace(Config::default());
        assert!(cache.get(&provider, "front").is_some());

        let mut empty = SnapshotCache::new(Duration::ZERO);
        assert!(empty.get(&provider, "front").is_none());
    }

    #[test]
    fn test_upsert_camera() {
        let provider = StaticConfigProvider::new(config_with(0.5));
        assert!(provider.camera("garage").is_none());

        provider.upsert_camera(CameraConfig::new("garage", "rtsp://cam/2"));
        assert!(provider.camera("garage").is_some());

        let mut moved = CameraConfig::new("front", "rtsp://cam/9");
        moved.overrides.confidence = Some(0.8);
        provider.upsert_camera(moved);
        assert_eq!(provider.camera("front").unwrap().detection.confidence, 0.8);
    }
}
