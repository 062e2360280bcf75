//! Orchestrator for running every camera pipeline in one process
//!
//! Owns the shared pieces (recorder, media pipeline, codec memory, CPU
//! sampler) and the registry of running detection tasks, and exposes the
//! camera lifecycle: start, stop, recording state and clip extraction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use vigil_capture::{CodecMemory, FfmpegDecoder, FrameSource, SourceConfig};
use vigil_detect::Detector;
use vigil_processing::{ClipEncoder, ClipExtraction, ContinuousRecorder, MediaPipeline, ProcessingError};

use crate::camera::{spawn_camera, CameraContext, CameraHandle};
use crate::config::{CameraConfig, CameraRole, Config};
use crate::load::spawn_cpu_sampler;
use crate::provider::StaticConfigProvider;
use crate::sinks::{EventSink, StatusSink};

/// Extra time over the reader stop timeout before a detection task is aborted
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// Main orchestrator for all cameras
pub struct Orchestrator {
    config: Config,
    provider: Arc<StaticConfigProvider>,
    detector: Arc<dyn Detector>,
    events: Arc<dyn EventSink>,
    status: Arc<dyn StatusSink>,
    recorder: Arc<ContinuousRecorder>,
    media: Arc<MediaPipeline>,
    codecs: CodecMemory,
    cpu: watch::Receiver<f32>,
    cameras: Mutex<HashMap<String, CameraHandle>>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; the CPU sampler starts here.
    pub fn new(
        config: Config,
        detector: Arc<dyn Detector>,
        events: Arc<dyn EventSink>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(ContinuousRecorder::new(config.recorder_config()));
        let media = Arc::new(MediaPipeline::new(
            config.media_config(),
            ClipEncoder::new(config.encoder_config()),
            config.recorder.enabled.then(|| recorder.clone()),
        ));

        let cpu = if config.load.enabled {
            spawn_cpu_sampler(Duration::from_secs(config.load.adjust_interval_secs.max(1)), shutdown.clone())
        } else {
            watch::channel(0.0).1
        };

        Self {
            provider: Arc::new(StaticConfigProvider::new(config.clone())),
            config,
            detector,
            events,
            status,
            recorder,
            media,
            codecs: CodecMemory::new(),
            cpu,
            cameras: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn recorder(&self) -> &Arc<ContinuousRecorder> {
        &self.recorder
    }

    pub fn media(&self) -> &Arc<MediaPipeline> {
        &self.media
    }

    pub fn provider(&self) -> &Arc<StaticConfigProvider> {
        &self.provider
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn context(&self) -> CameraContext {
        let general = &self.config.general;
        CameraContext {
            provider: self.provider.clone(),
            detector: self.detector.clone(),
            events: self.events.clone(),
            status: self.status.clone(),
            media: self.media.clone(),
            cpu: self.cpu.clone(),
            load: self.config.load.clone(),
            ring: self.config.ring_config(),
            snapshot_ttl: Duration::from_secs(general.snapshot_ttl_secs.min(5)),
            status_interval: Duration::from_secs(self.config.status.min_interval_secs),
            stop_timeout: Duration::from_secs(general.stop_timeout_secs),
        }
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.general.stop_timeout_secs) + STOP_MARGIN
    }

    /// Start (or restart) a camera according to its roles. A running
    /// recording of the same URL is kept. On error nothing of the camera
    /// is left detecting.
    pub async fn start_camera(&self, camera: &CameraConfig) -> Result<()> {
        self.stop_detection(&camera.id).await;
        self.provider.upsert_camera(camera.clone());

        if !camera.enabled {
            info!(camera_id = %camera.id, "camera disabled");
            self.recorder.stop(&camera.id).await;
            return Ok(());
        }

        if camera.has_role(CameraRole::Detect) {
            let general = &self.config.general;
            let decoder = FfmpegDecoder::new(&general.ffmpeg, general.capture_width, general.capture_height);
            let source = FrameSource::open(SourceConfig::new(&camera.id, &camera.url), decoder, self.codecs.clone())
                .with_context(|| format!("failed to open frame source for camera {}", camera.id))?;

            let handle = spawn_camera(self.context(), source);
            self.cameras.lock().await.insert(camera.id.clone(), handle);
            info!(camera_id = %camera.id, "detection pipeline started");
        }

        if camera.has_role(CameraRole::Record) && self.config.recorder.enabled {
            if let Err(e) = self.recorder.start(&camera.id, &camera.url).await {
                // No half-started camera: detection goes down with the recorder
                self.stop_detection(&camera.id).await;
                return Err(e).with_context(|| format!("failed to start recording camera {}", camera.id));
            }
        } else {
            self.recorder.stop(&camera.id).await;
        }

        Ok(())
    }

    /// Stop detection and recording; returns false if nothing was running
    pub async fn stop_camera(&self, camera_id: &str) -> bool {
        let detecting = self.stop_detection(camera_id).await;
        let recording = self.recorder.stop(camera_id).await;
        detecting || recording
    }

    async fn stop_detection(&self, camera_id: &str) -> bool {
        let Some(handle) = self.cameras.lock().await.remove(camera_id) else {
            return false;
        };
        if !handle.stop(self.stop_timeout()).await {
            warn!(camera_id = %camera_id, "detection task did not stop in time, aborted");
        }
        true
    }

    pub async fn is_recording(&self, camera_id: &str) -> bool {
        self.recorder.is_recording(camera_id).await
    }

    pub async fn is_detecting(&self, camera_id: &str) -> bool {
        self.cameras
            .lock()
            .await
            .get(camera_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Cut `[start, end]` from the camera's recording at `speed`
    pub async fn extract_clip(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        output: &Path,
        speed: f32,
    ) -> Result<ClipExtraction, ProcessingError> {
        self.recorder.extract_clip(camera_id, start, end, output, speed).await
    }

    /// Run every enabled camera until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        info!("🚀 Starting Vigil with {} camera(s)", self.config.cameras.len());

        let shutdown_clone = self.shutdown.clone();
        ctrlc::set_handler(move || {
            info!("🛑 Shutdown signal received");
            shutdown_clone.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl+C handler")?;

        for dir in [self.config.data_dir(), self.config.recording_root(), self.config.media_root()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        info!("📁 Recordings: {}", self.config.recording_root().display());
        info!("📁 Event media: {}", self.config.media_root().display());

        let maintenance = self.config.recorder.enabled
            .then(|| self.recorder.clone().spawn_maintenance(self.shutdown.clone()));

        for camera in &self.config.cameras {
            if let Err(e) = self.start_camera(camera).await {
                error!(camera_id = %camera.id, "failed to start camera: {:#}", e);
            }
        }

        info!("✅ All cameras started");

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.shutdown().await;
        if let Some(maintenance) = maintenance {
            let _ = maintenance.await;
        }
        info!("✅ Vigil stopped");
        Ok(())
    }

    /// Stop every camera and recorder process
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);

        let handles: Vec<(String, CameraHandle)> = self.cameras.lock().await.drain().collect();
        let timeout = self.stop_timeout();
        let stops = handles.into_iter().map(|(camera_id, handle)| async move {
            if !handle.stop(timeout).await {
                warn!(camera_id = %camera_id, "detection task did not stop in time, aborted");
            }
        });
        futures::future::join_all(stops).await;

        self.recorder.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ConfigProvider;
    use crate::sinks::{JsonlEventSink, LogStatusSink};
    use vigil_detect::NullDetector;

    fn orchestrator(dir: &Path) -> Orchestrator {
        orchestrator_with(dir, |_| {})
    }

    fn orchestrator_with(dir: &Path, tweak: impl FnOnce(&mut Config)) -> Orchestrator {
        let mut config = Config::default();
        config.general.data_dir = Some(dir.to_path_buf());
        config.general.ffmpeg = dir.join("missing-ffmpeg");
        config.general.stop_timeout_secs = 1;
        config.load.enabled = false;
        config.recorder.enabled = false;
        tweak(&mut config);

        let events = JsonlEventSink::new(config.event_log()).unwrap();
        Orchestrator::new(config, Arc::new(NullDetector), Arc::new(events), Arc::new(LogStatusSink))
    }

    #[tokio::test]
    async fn test_start_and_stop_detection() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        let mut camera = CameraConfig::new("front", "rtsp://127.0.0.1:1/stream");
        camera.roles = vec![CameraRole::Detect];
        orch.start_camera(&camera).await.unwrap();

        assert!(orch.is_detecting("front").await);
        assert!(!orch.is_recording("front").await);
        assert!(orch.provider().camera("front").is_some());

        assert!(orch.stop_camera("front").await);
        assert!(!orch.is_detecting("front").await);
        assert!(!orch.stop_camera("front").await);
    }

    #[tokio::test]
    async fn test_failed_recorder_leaves_no_detection_running() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator_with(dir.path(), |config| config.recorder.enabled = true);

        // Default roles: detect and record
        let camera = CameraConfig::new("gate", "rtsp://127.0.0.1:1/stream");
        assert!(orch.start_camera(&camera).await.is_err());
        assert!(!orch.is_detecting("gate").await);
        assert!(!orch.is_recording("gate").await);
    }

    #[tokio::test]
    async fn test_disabled_camera_does_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        let mut camera = CameraConfig::new("side", "rtsp://127.0.0.1:1/stream");
        camera.enabled = false;
        orch.start_camera(&camera).await.unwrap();
        assert!(!orch.is_detecting("side").await);
    }

    #[tokio::test]
    async fn test_extract_without_segments_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let end = Utc::now() - chrono::Duration::minutes(10);
        let start = end - chrono::Duration::seconds(20);

        let result = orch
            .extract_clip("front", start, end, &dir.path().join("clip.mp4"), 1.0)
            .await
            .unwrap();
        assert!(matches!(result, ClipExtraction::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());

        for id in ["a", "b"] {
            let mut camera = CameraConfig::new(id, "rtsp://127.0.0.1:1/stream");
            camera.roles = vec![CameraRole::Detect];
            orch.start_camera(&camera).await.unwrap();
        }
        orch.shutdown().await;

        assert!(orch.shutdown_flag().load(Ordering::SeqCst));
        assert!(!orch.is_detecting("a").await);
        assert!(!orch.is_detecting("b").await);
    }
}
