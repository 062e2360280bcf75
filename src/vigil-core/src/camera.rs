//! Per-camera detection pipeline
//!
//! Each detect-role camera runs one reader thread (inside `FrameSource`) and
//! one detection task. The task pulls the freshest frame, gates it on motion,
//! runs inference on a blocking worker and feeds the filtered result through
//! the temporal, zone and debounce stages. All mutable detection state for a
//! camera lives in one `CameraState` owned by that task.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vigil_capture::{Frame, FrameSource, SourceState};
use vigil_detect::{
    filter_aspect_ratio, is_temporally_consistent, preprocess, retain_class, ConfirmedEvent, DebounceOutcome,
    DetectError, Detection, DetectionHistory, Detector, EventDebouncer, MotionGate, MotionReason, MotionVerdict,
    ZoneFilter, ZoneInertia,
};
use vigil_processing::{EventMedia, FrameRingBuffer, MediaPipeline, RingConfig, SampledFrame};

use crate::config::LoadSettings;
use crate::load::RateController;
use crate::provider::{CameraSnapshot, ConfigProvider, SnapshotCache};
use crate::sinks::{self, EventSink, StatusSink};
use crate::status::{StatusCoalescer, StatusUpdate};

/// Longest wait for a new frame before the loop re-checks stop and status
const FRAME_WAIT: Duration = Duration::from_secs(1);

/// Detection state of one camera: motion reference, episode windows,
/// debouncer, sample buffer and inference rate.
pub struct CameraState {
    camera_id: String,
    gate: MotionGate,
    history: DetectionHistory,
    inertia: ZoneInertia,
    debouncer: EventDebouncer,
    ring: Arc<FrameRingBuffer>,
    rate: RateController,
    applied: Arc<CameraSnapshot>,
}

impl CameraState {
    pub fn new(snapshot: Arc<CameraSnapshot>, ring: RingConfig, load: &LoadSettings) -> Self {
        let d = &snapshot.detection;
        Self {
            camera_id: snapshot.camera_id.clone(),
            gate: MotionGate::new(snapshot.motion.clone()),
            history: DetectionHistory::new(d.min_consecutive_frames),
            inertia: ZoneInertia::new(d.zone_inertia_frames, d.min_frames_in_zone),
            debouncer: EventDebouncer::new(d.debounce()),
            ring: Arc::new(FrameRingBuffer::new(ring)),
            rate: RateController::new(d.target_fps, d.min_fps, d.max_fps, load),
            applied: snapshot,
        }
    }

    pub fn ring(&self) -> &Arc<FrameRingBuffer> {
        &self.ring
    }

    pub fn rate(&mut self) -> &mut RateController {
        &mut self.rate
    }

    pub fn debouncer(&self) -> &EventDebouncer {
        &self.debouncer
    }

    pub fn history(&self) -> &DetectionHistory {
        &self.history
    }

    /// Take over a refreshed snapshot. Windows are rebuilt only when their
    /// sizes change.
    pub fn apply(&mut self, snapshot: &Arc<CameraSnapshot>) {
        if Arc::ptr_eq(&self.applied, snapshot) || *self.applied == **snapshot {
            self.applied = snapshot.clone();
            return;
        }

        let old = &self.applied.detection;
        let new = &snapshot.detection;
        debug!(camera_id = %self.camera_id, "applying updated camera settings");

        self.gate.set_config(snapshot.motion.clone());
        if old.min_consecutive_frames != new.min_consecutive_frames {
            self.history = DetectionHistory::new(new.min_consecutive_frames);
        }
        if (old.zone_inertia_frames, old.min_frames_in_zone) != (new.zone_inertia_frames, new.min_frames_in_zone)
            || self.applied.zones != snapshot.zones
        {
            self.inertia = ZoneInertia::new(new.zone_inertia_frames, new.min_frames_in_zone);
        }
        self.debouncer.set_config(new.debounce());
        self.rate.set_bounds(new.min_fps, new.max_fps);
        self.applied = snapshot.clone();
    }

    /// Motion verdict for `frame`; a disabled gate lets everything through
    pub fn gate(&mut self, frame: &Frame) -> MotionVerdict {
        if !self.applied.detection.motion_gate {
            return MotionVerdict {
                active: true,
                changed_pixels: 0,
                reason: MotionReason::Movement,
            };
        }
        self.gate.check(frame.image(), frame.timestamp)
    }

    /// A static frame counts as a frame without detections
    pub fn skip_still(&mut self, frame: Frame) {
        self.history.push(false);
        if self.debouncer.episode_start().is_some() {
            debug!(camera_id = %self.camera_id, "scene went still, dropping candidate");
            self.debouncer.reset();
            self.clear_episode();
        }
        self.ring.push(SampledFrame::new(frame, Vec::new()));
    }

    /// Run the post-inference stages for one sampled frame.
    ///
    /// A failed inference keeps the frame (buffered without boxes) but
    /// leaves the episode untouched; it returns `None`.
    pub fn evaluate(&mut self, frame: Frame, raw: Result<Vec<Detection>, DetectError>) -> Option<DebounceOutcome> {
        let detections = match raw {
            Ok(detections) => detections,
            Err(e) => {
                warn!(camera_id = %self.camera_id, "inference failed, keeping frame: {}", e);
                self.ring.push(SampledFrame::new(frame, Vec::new()));
                return None;
            }
        };

        let snapshot = self.applied.clone();
        let (width, height) = (frame.width(), frame.height());

        let candidates = retain_class(detections, &snapshot.target_class);
        let candidates = filter_aspect_ratio(candidates, &snapshot.detection.aspect_bounds());

        let gated = snapshot.detection.zone_gating && ZoneFilter::person_zones(&snapshot.zones).next().is_some();
        let settled = !gated || self.inertia.observe_frame(&candidates, width, height, &snapshot.zones);
        let survivors = if settled {
            ZoneFilter::filter(candidates, width, height, &snapshot.zones)
        } else {
            Vec::new()
        };

        let consistent = is_temporally_consistent(&survivors, &self.history, &snapshot.detection.temporal());
        self.history.push(!survivors.is_empty());

        let qualified = if consistent { survivors.clone() } else { Vec::new() };
        let timestamp = frame.timestamp;
        self.ring.push(SampledFrame::new(frame, survivors));

        let outcome = self.debouncer.observe(timestamp, &qualified);
        match &outcome {
            DebounceOutcome::Reset => {
                debug!(camera_id = %self.camera_id, "candidate episode discarded");
                self.clear_episode();
            }
            DebounceOutcome::Confirmed(_) => self.clear_episode(),
            _ => {}
        }
        Some(outcome)
    }

    fn clear_episode(&mut self) {
        self.history.clear();
        self.inertia.clear();
    }
}

/// Shared collaborators and timings for detection tasks
#[derive(Clone)]
pub struct CameraContext {
    pub provider: Arc<dyn ConfigProvider>,
    pub detector: Arc<dyn Detector>,
    pub events: Arc<dyn EventSink>,
    pub status: Arc<dyn StatusSink>,
    pub media: Arc<MediaPipeline>,
    pub cpu: watch::Receiver<f32>,
    pub load: LoadSettings,
    pub ring: RingConfig,
    pub snapshot_ttl: Duration,
    pub status_interval: Duration,
    pub stop_timeout: Duration,
}

/// Running detection task of one camera
pub struct CameraHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CameraHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task and wait up to `timeout`; returns false if it had to
    /// be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.stop.send(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("detection task failed: {}", e);
                true
            }
            Err(_) => {
                task.abort();
                false
            }
        }
    }
}

/// Spawn the detection task for an opened source
pub fn spawn_camera(ctx: CameraContext, source: FrameSource) -> CameraHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_detection_loop(ctx, source, stop_rx));
    CameraHandle { stop, task }
}

async fn run_detection_loop(ctx: CameraContext, mut source: FrameSource, mut stop: watch::Receiver<bool>) {
    let camera_id = source.camera_id().to_string();
    let mut cache = SnapshotCache::new(ctx.snapshot_ttl);

    let Some(snapshot) = cache.get(&*ctx.provider, &camera_id) else {
        warn!(camera_id = %camera_id, "no configuration for camera, not starting detection");
        close_source(&ctx, source).await;
        return;
    };

    let mut state = CameraState::new(snapshot, ctx.ring, &ctx.load);
    let mut coalescer = StatusCoalescer::new(ctx.status_interval);
    let states = source.subscribe_state();
    let adjust_every = Duration::from_secs(ctx.load.adjust_interval_secs.max(1));
    let mut last_adjust = Instant::now();

    info!(camera_id = %camera_id, fps = state.rate.fps(), "detection started");

    while !*stop.borrow() {
        let now = Instant::now();
        let update = StatusUpdate {
            state: *states.borrow(),
            last_frame: source.last_frame_at(),
        };
        if let Some(update) = coalescer.offer(update, now).or_else(|| coalescer.flush(now)) {
            ctx.status.on_status_change(&camera_id, update.state, update.last_frame);
        }

        let frame = tokio::select! {
            _ = stop.changed() => break,
            frame = source.next_frame(FRAME_WAIT) => frame,
        };
        let Some(frame) = frame else {
            continue;
        };
        let started = Instant::now();

        if let Some(snapshot) = cache.get(&*ctx.provider, &camera_id) {
            state.apply(&snapshot);
        }

        if ctx.load.enabled && last_adjust.elapsed() >= adjust_every {
            let cpu = *ctx.cpu.borrow();
            let before = state.rate.fps();
            let after = state.rate.adjust(cpu);
            if after != before {
                debug!(camera_id = %camera_id, cpu, fps = after, "inference rate adjusted");
            }
            last_adjust = Instant::now();
        }

        let verdict = state.gate(&frame);
        if verdict.active {
            let raw = infer(&ctx, &state.applied, frame.clone()).await;
            if let Some(DebounceOutcome::Confirmed(event)) = state.evaluate(frame, raw) {
                dispatch_event(&ctx, &camera_id, state.ring.clone(), event);
            }
        } else {
            state.skip_still(frame);
        }

        let next = started + state.rate.interval();
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep_until(next.into()) => {}
        }
    }

    close_source(&ctx, source).await;
    info!(camera_id = %camera_id, "detection stopped");
}

/// Preprocess and infer on a blocking worker
async fn infer(ctx: &CameraContext, snapshot: &CameraSnapshot, frame: Frame) -> Result<Vec<Detection>, DetectError> {
    let detector = ctx.detector.clone();
    let modality = snapshot.modality;
    let confidence = snapshot.detection.confidence;

    tokio::task::spawn_blocking(move || {
        let prepared = preprocess(frame.image(), modality);
        detector.infer(&prepared, confidence)
    })
    .await
    .unwrap_or_else(|e| Err(DetectError::Inference(format!("inference worker failed: {}", e))))
}

/// Record the event, then render its media once the post-roll has passed
/// Hand the event to the sink and render its media, off the detection task.
/// Sinks are synchronous and may touch the disk, so they run on blocking
/// workers.
fn dispatch_event(ctx: &CameraContext, camera_id: &str, ring: Arc<FrameRingBuffer>, event: ConfirmedEvent) -> JoinHandle<()> {
    let media = ctx.media.clone();
    let events = ctx.events.clone();
    let camera_id = camera_id.to_string();

    tokio::spawn(async move {
        let confirmed = {
            let events = events.clone();
            let camera_id = camera_id.clone();
            let event = event.clone();
            tokio::task::spawn_blocking(move || events.on_event_confirmed(&camera_id, &event)).await
        };
        let event_id = match confirmed {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!(camera_id = %camera_id, "event sink failed, using local id: {}", e);
                sinks::event_id(&camera_id, event.confirmed_at)
            }
            Err(e) => {
                warn!(camera_id = %camera_id, "event sink panicked, using local id: {}", e);
                sinks::event_id(&camera_id, event.confirmed_at)
            }
        };
        info!(
            camera_id = %camera_id,
            event_id = %event_id,
            confidence = event.best.confidence,
            "event confirmed"
        );

        let request = EventMedia {
            event_id,
            camera_id,
            episode_start: event.episode_start,
            confirmed_at: event.confirmed_at,
        };

        tokio::time::sleep(media.config().clip_post_roll).await;

        let (start, end) = media.clip_window(&request);
        let mut samples = ring.window(start, end);
        if samples.is_empty() {
            samples = ring.snapshot();
        }

        let artifacts = match media.render_event(&request, samples).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                error!(event_id = %request.event_id, "media render failed: {}", e);
                return;
            }
        };
        let event_id = request.event_id.clone();
        let ready = tokio::task::spawn_blocking(move || events.on_artifacts_ready(&request.event_id, &artifacts)).await;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event_id = %event_id, "artifact callback failed: {}", e),
            Err(e) => warn!(event_id = %event_id, "artifact callback panicked: {}", e),
        }
    })
}

async fn close_source(ctx: &CameraContext, mut source: FrameSource) {
    let camera_id = source.camera_id().to_string();
    let last_frame = source.last_frame_at();
    let timeout = ctx.stop_timeout;
    let clean = tokio::task::spawn_blocking(move || source.close(timeout))
        .await
        .unwrap_or(false);
    if !clean {
        warn!(camera_id = %camera_id, "reader was force-released");
    }
    ctx.status.on_status_change(&camera_id, SourceState::Stopped, last_frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, Config};
    use crate::provider::StaticConfigProvider;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use image::{Rgb, RgbImage};
    use std::sync::Mutex;
    use vigil_capture::{CaptureError, CodecHint, CodecMemory, ReleaseHandle, SourceConfig, StreamDecoder};
    use vigil_detect::{BoundingBox, DebounceState, Point, Zone, ZoneMode};
    use vigil_processing::{ArtifactSet, ClipEncoder, ClipEncoderConfig, MediaConfig};

    fn snapshot_with(edit: impl FnOnce(&mut Config)) -> Arc<CameraSnapshot> {
        let mut config = Config::default();
        config.detection.motion_gate = false;
        config.detection.min_consecutive_frames = 3;
        config.detection.max_gap_frames = 1;
        config.detection.min_event_duration_secs = 1.0;
        config.cameras.push(CameraConfig::new("cam", "rtsp://cam/stream"));
        edit(&mut config);
        let camera = config.cameras[0].clone();
        Arc::new(CameraSnapshot::build(&config, &camera))
    }

    fn state(snapshot: Arc<CameraSnapshot>) -> CameraState {
        let ring = RingConfig {
            capacity: 16,
            min_interval: Duration::ZERO,
        };
        CameraState::new(snapshot, ring, &LoadSettings::default())
    }

    fn frame_at(at: DateTime<Utc>) -> Frame {
        Frame::from_image("cam", at, RgbImage::from_pixel(100, 100, Rgb([30, 30, 30])))
    }

    /// Upright box centered at (cx, cy) in a 100x100 frame
    fn person_at(cx: f32, cy: f32) -> Detection {
        Detection::new(BoundingBox::new(cx - 5.0, cy - 10.0, cx + 5.0, cy + 10.0), 0.8, "person")
    }

    #[test]
    fn test_confirms_after_window_and_duration() {
        let mut cam = state(snapshot_with(|_| {}));
        let t0 = Utc::now();
        let at = |ms: i64| t0 + ChronoDuration::milliseconds(ms);

        // History must fill before the temporal window can pass
        assert_eq!(cam.evaluate(frame_at(at(0)), Ok(vec![person_at(50.0, 50.0)])), Some(DebounceOutcome::Idle));
        assert_eq!(cam.evaluate(frame_at(at(500)), Ok(vec![person_at(50.0, 50.0)])), Some(DebounceOutcome::Idle));
        assert_eq!(
            cam.evaluate(frame_at(at(1000)), Ok(vec![person_at(50.0, 50.0)])),
            Some(DebounceOutcome::Candidate { since: at(1000) })
        );
        assert!(matches!(
            cam.evaluate(frame_at(at(1500)), Ok(vec![person_at(50.0, 50.0)])),
            Some(DebounceOutcome::Candidate { .. })
        ));

        match cam.evaluate(frame_at(at(2000)), Ok(vec![person_at(50.0, 50.0)])) {
            Some(DebounceOutcome::Confirmed(event)) => assert_eq!(event.episode_start, at(1000)),
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert_eq!(cam.debouncer().state(), DebounceState::Cooldown);
        assert!(cam.history().is_empty());
        assert_eq!(cam.ring().len(), 5);
    }

    #[test]
    fn test_other_classes_and_flat_boxes_are_dropped() {
        let mut cam = state(snapshot_with(|c| c.detection.min_consecutive_frames = 1));
        let car = Detection::new(BoundingBox::new(40.0, 40.0, 50.0, 60.0), 0.9, "car");
        let flat = Detection::new(BoundingBox::new(10.0, 40.0, 90.0, 50.0), 0.9, "person");

        assert_eq!(cam.evaluate(frame_at(Utc::now()), Ok(vec![car, flat])), Some(DebounceOutcome::Idle));
        assert_eq!(cam.ring().latest().map(|s| s.detections.len()), Some(0));
    }

    #[test]
    fn test_zone_inertia_delays_survivors() {
        let zone = Zone {
            id: "porch".to_string(),
            polygon: vec![Point::new(0.0, 0.0), Point::new(0.5, 0.0), Point::new(0.5, 1.0), Point::new(0.0, 1.0)],
            mode: ZoneMode::Person,
            enabled: true,
        };
        let mut cam = state(snapshot_with(|c| {
            c.detection.min_consecutive_frames = 1;
            c.detection.min_event_duration_secs = 10.0;
            c.detection.zone_inertia_frames = 3;
            c.detection.min_frames_in_zone = 3;
            c.cameras[0].zones = vec![zone];
        }));
        let t0 = Utc::now();

        for s in 0..2 {
            let outcome = cam.evaluate(frame_at(t0 + ChronoDuration::seconds(s)), Ok(vec![person_at(25.0, 50.0)]));
            assert_eq!(outcome, Some(DebounceOutcome::Idle));
        }
        let t2 = t0 + ChronoDuration::seconds(2);
        assert_eq!(
            cam.evaluate(frame_at(t2), Ok(vec![person_at(25.0, 50.0)])),
            Some(DebounceOutcome::Candidate { since: t2 })
        );

        // Leaving the zone discards the episode
        assert_eq!(
            cam.evaluate(frame_at(t0 + ChronoDuration::seconds(3)), Ok(vec![person_at(80.0, 50.0)])),
            Some(DebounceOutcome::Reset)
        );
    }

    #[test]
    fn test_inference_failure_keeps_frame_and_episode() {
        let mut cam = state(snapshot_with(|_| {}));
        let t0 = Utc::now();
        cam.evaluate(frame_at(t0), Ok(vec![person_at(50.0, 50.0)]));

        let failed = cam.evaluate(
            frame_at(t0 + ChronoDuration::seconds(1)),
            Err(DetectError::Inference("timeout".to_string())),
        );
        assert_eq!(failed, None);
        assert_eq!(cam.history().len(), 1);
        assert_eq!(cam.ring().len(), 2);
    }

    #[test]
    fn test_still_frame_drops_candidate() {
        let mut cam = state(snapshot_with(|c| c.detection.min_consecutive_frames = 1));
        let t0 = Utc::now();
        cam.evaluate(frame_at(t0), Ok(vec![person_at(50.0, 50.0)]));
        assert_eq!(cam.debouncer().state(), DebounceState::Candidate);

        cam.skip_still(frame_at(t0 + ChronoDuration::seconds(1)));
        assert_eq!(cam.debouncer().state(), DebounceState::Idle);
        assert_eq!(cam.ring().len(), 2);
    }

    #[test]
    fn test_apply_resizes_windows() {
        let mut cam = state(snapshot_with(|_| {}));
        assert_eq!(cam.history().capacity(), 3);

        cam.apply(&snapshot_with(|c| {
            c.detection.min_consecutive_frames = 5;
            c.detection.min_fps = 1.0;
            c.detection.max_fps = 1.0;
        }));
        assert_eq!(cam.history().capacity(), 5);
        assert_eq!(cam.rate().fps(), 1.0);
    }

    /// Endless stream of identical frames
    struct LoopDecoder;

    impl StreamDecoder for LoopDecoder {
        fn open(&mut self, _url: &str, _hint: CodecHint) -> Result<(), CaptureError> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(RgbImage::from_pixel(100, 100, Rgb([30, 30, 30])))
        }

        fn release(&mut self) {}

        fn release_handle(&self) -> ReleaseHandle {
            ReleaseHandle::default()
        }
    }

    struct AlwaysPerson;

    impl Detector for AlwaysPerson {
        fn name(&self) -> &'static str {
            "always-person"
        }

        fn infer(&self, _image: &RgbImage, _confidence: f32) -> Result<Vec<Detection>, DetectError> {
            Ok(vec![person_at(50.0, 50.0)])
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        artifacts: Mutex<Vec<String>>,
        states: Mutex<Vec<SourceState>>,
    }

    impl EventSink for Recording {
        fn on_event_confirmed(&self, camera_id: &str, event: &ConfirmedEvent) -> anyhow::Result<String> {
            let id = sinks::event_id(camera_id, event.confirmed_at);
            self.events.lock().unwrap().push(id.clone());
            Ok(id)
        }

        fn on_artifacts_ready(&self, event_id: &str, _artifacts: &ArtifactSet) -> anyhow::Result<()> {
            self.artifacts.lock().unwrap().push(event_id.to_string());
            Ok(())
        }
    }

    impl StatusSink for Recording {
        fn on_status_change(&self, _camera_id: &str, state: SourceState, _last_frame: Option<DateTime<Utc>>) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn context(config: Config, events: Arc<dyn EventSink>, status: Arc<dyn StatusSink>, media_root: &std::path::Path) -> CameraContext {
        let media = MediaPipeline::new(
            MediaConfig {
                root: media_root.to_path_buf(),
                clip_post_roll: Duration::ZERO,
                gif_enabled: false,
                ..MediaConfig::default()
            },
            ClipEncoder::new(ClipEncoderConfig {
                ffmpeg: "/nonexistent/ffmpeg".into(),
                ..ClipEncoderConfig::default()
            }),
            None,
        );
        let (_cpu_tx, cpu) = watch::channel(0.0f32);
        CameraContext {
            provider: Arc::new(StaticConfigProvider::new(config)),
            detector: Arc::new(AlwaysPerson),
            events,
            status,
            media: Arc::new(media),
            cpu,
            load: LoadSettings::default(),
            ring: RingConfig::default(),
            snapshot_ttl: Duration::from_secs(5),
            status_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }

    /// Event sink with slow synchronous writes
    struct SlowSink {
        inner: Recording,
        delay: Duration,
    }

    impl EventSink for SlowSink {
        fn on_event_confirmed(&self, camera_id: &str, event: &ConfirmedEvent) -> anyhow::Result<String> {
            std::thread::sleep(self.delay);
            self.inner.on_event_confirmed(camera_id, event)
        }

        fn on_artifacts_ready(&self, event_id: &str, artifacts: &ArtifactSet) -> anyhow::Result<()> {
            std::thread::sleep(self.delay);
            self.inner.on_artifacts_ready(event_id, artifacts)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_event_sink_does_not_block_dispatch() {
        let media_dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink {
            inner: Recording::default(),
            delay: Duration::from_millis(300),
        });
        let ctx = context(Config::default(), sink.clone(), Arc::new(Recording::default()), media_dir.path());

        let t0 = Utc::now();
        let ring = Arc::new(FrameRingBuffer::new(RingConfig::default()));
        ring.push(SampledFrame::new(frame_at(t0), vec![person_at(50.0, 50.0)]));
        let event = ConfirmedEvent {
            episode_start: t0,
            confirmed_at: t0,
            best: person_at(50.0, 50.0),
            detections: vec![person_at(50.0, 50.0)],
        };

        let started = Instant::now();
        let task = dispatch_event(&ctx, "cam", ring, event);
        assert!(started.elapsed() < Duration::from_millis(100));

        // The runtime thread stays free while the sink sleeps
        let ticked = tokio::time::timeout(Duration::from_millis(100), tokio::time::sleep(Duration::from_millis(10))).await;
        assert!(ticked.is_ok());

        task.await.unwrap();
        assert_eq!(sink.inner.events.lock().unwrap().len(), 1);
        assert_eq!(sink.inner.artifacts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_detection_loop_confirms_and_stops() {
        let media_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.detection.motion_gate = false;
        config.detection.min_consecutive_frames = 1;
        config.detection.min_event_duration_secs = 0.0;
        config.detection.max_fps = 5.0;
        config.detection.target_fps = 5.0;
        config.cameras.push(CameraConfig::new("cam", "test://loop"));

        let sink = Arc::new(Recording::default());
        let ctx = context(config, sink.clone(), sink.clone(), media_dir.path());

        let source = FrameSource::open(SourceConfig::new("cam", "test://loop"), LoopDecoder, CodecMemory::new()).unwrap();
        let handle = spawn_camera(ctx, source);

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.events.lock().unwrap().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.stop(Duration::from_secs(5)).await);

        // Cooldown keeps it to a single event
        assert_eq!(sink.events.lock().unwrap().len(), 1);
        assert_eq!(sink.states.lock().unwrap().last(), Some(&SourceState::Stopped));
    }
}
