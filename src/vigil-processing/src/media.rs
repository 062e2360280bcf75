//! Event media rendering
//!
//! Every confirmed event gets a directory `{root}/{event_id}/` holding
//! `collage.jpg`, `preview.gif` and `timelapse.mp4`. Renders share one
//! process-wide limiter so heavy work can't pile up under load.

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::avi::write_mjpeg_avi;
use crate::encoder::{write_jpeg, ClipEncoder, EncodeAttempt};
use crate::error::ProcessingError;
use crate::recorder::{ClipExtraction, ContinuousRecorder, Unavailable};
use crate::render::{collage_indices, compose_collage, encode_gif_within_budget, evenly_spaced, peak_index, COLLAGE_SLOTS};
use crate::ring_buffer::SampledFrame;

pub const COLLAGE_FILE: &str = "collage.jpg";
pub const GIF_FILE: &str = "preview.gif";
pub const CLIP_FILE: &str = "timelapse.mp4";

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub root: PathBuf,
    pub render_concurrency: usize,
    /// Waits for a render slot longer than this are logged
    pub slow_wait_threshold: Duration,
    pub render_timeout: Duration,
    pub collage_cell_width: u32,
    pub collage_cell_height: u32,
    pub gif_enabled: bool,
    pub gif_frames: usize,
    pub gif_width: u32,
    pub gif_min_width: u32,
    pub gif_delay_ms: u32,
    pub gif_max_bytes: usize,
    pub clip_pre_roll: Duration,
    pub clip_post_roll: Duration,
    /// Playback speed multiplier for clips
    pub clip_speed: f32,
    /// Added to the segment close time before retrying a recorder clip
    pub clip_retry_margin: Duration,
    pub segment_duration: Duration,
    pub still_clip_secs: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("events"),
            render_concurrency: 2,
            slow_wait_threshold: Duration::from_secs(2),
            render_timeout: Duration::from_secs(60),
            collage_cell_width: 320,
            collage_cell_height: 240,
            gif_enabled: true,
            gif_frames: 10,
            gif_width: 480,
            gif_min_width: 160,
            gif_delay_ms: 300,
            gif_max_bytes: 4 * 1024 * 1024,
            clip_pre_roll: Duration::from_secs(10),
            clip_post_roll: Duration::from_secs(10),
            clip_speed: 1.0,
            clip_retry_margin: Duration::from_secs(15),
            segment_duration: Duration::from_secs(60),
            still_clip_secs: 3,
        }
    }
}

/// Process-wide cap on concurrent renders. Callers queue, never fail.
pub struct RenderLimiter {
    semaphore: Semaphore,
    capacity: usize,
    slow_wait_threshold: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

pub struct RenderPermit<'a> {
    _permit: SemaphorePermit<'a>,
    limiter: &'a RenderLimiter,
}

impl Drop for RenderPermit<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RenderLimiter {
    pub fn new(capacity: usize, slow_wait_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            slow_wait_threshold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self, what: &str) -> Result<RenderPermit<'_>, ProcessingError> {
        let started = Instant::now();
        let permit = self.semaphore.acquire().await.map_err(|_| ProcessingError::LimiterClosed)?;

        let waited = started.elapsed();
        if waited > self.slow_wait_threshold {
            info!("{} waited {:.1}s for a render slot", what, waited.as_secs_f32());
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(RenderPermit {
            _permit: permit,
            limiter: self,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent render count seen
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// What the media pipeline needs to know about a confirmed event
#[derive(Debug, Clone)]
pub struct EventMedia {
    pub event_id: String,
    pub camera_id: String,
    pub episode_start: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSource {
    Recorder,
    /// Encoded from buffered frames
    Synthesized,
    StillFrame,
    /// Motion-JPEG AVI written without ffmpeg
    MotionJpeg,
    /// Nothing written yet; the recorder clip lands at the path later
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipArtifact {
    pub path: PathBuf,
    pub source: ClipSource,
    /// A recorder clip will replace this one once segments close
    pub upgrade_scheduled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactSet {
    pub dir: PathBuf,
    pub collage: Option<PathBuf>,
    pub gif: Option<PathBuf>,
    pub clip: Option<ClipArtifact>,
}

pub struct MediaPipeline {
    config: MediaConfig,
    limiter: RenderLimiter,
    encoder: ClipEncoder,
    recorder: Option<Arc<ContinuousRecorder>>,
}

impl MediaPipeline {
    pub fn new(config: MediaConfig, encoder: ClipEncoder, recorder: Option<Arc<ContinuousRecorder>>) -> Self {
        let limiter = RenderLimiter::new(config.render_concurrency, config.slow_wait_threshold);
        Self {
            config,
            limiter,
            encoder,
            recorder,
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RenderLimiter {
        &self.limiter
    }

    pub fn event_dir(&self, event_id: &str) -> PathBuf {
        self.config.root.join(event_id)
    }

    /// Pre/post-roll window around the event
    pub fn clip_window(&self, event: &EventMedia) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            event.episode_start - to_chrono(self.config.clip_pre_roll),
            event.confirmed_at + to_chrono(self.config.clip_post_roll),
        )
    }

    /// Render all artifacts for `event`. Individual failures leave that
    /// artifact empty; only a missing event directory is an error.
    pub async fn render_event(self: &Arc<Self>, event: &EventMedia, samples: Vec<SampledFrame>) -> Result<ArtifactSet, ProcessingError> {
        let dir = self.event_dir(&event.event_id);
        tokio::fs::create_dir_all(&dir).await?;
        let samples = Arc::new(samples);
        let started = Instant::now();

        let (collage, gif, clip) = tokio::join!(
            self.render_collage(&dir, samples.clone()),
            self.render_gif(&dir, samples.clone()),
            self.render_clip(event, &dir, samples.clone()),
        );

        let collage = collage
            .map_err(|e| warn!("collage for {} failed: {}", event.event_id, e))
            .ok();
        let gif = gif
            .map_err(|e| warn!("preview for {} failed: {}", event.event_id, e))
            .ok()
            .flatten();

        info!(
            "rendered media for {} in {:.1}s (collage: {}, gif: {}, clip: {:?})",
            event.event_id,
            started.elapsed().as_secs_f32(),
            collage.is_some(),
            gif.is_some(),
            clip.as_ref().map(|c| c.source)
        );

        Ok(ArtifactSet { dir, collage, gif, clip })
    }

    async fn render_collage(&self, dir: &Path, samples: Arc<Vec<SampledFrame>>) -> Result<PathBuf, ProcessingError> {
        if samples.is_empty() {
            return Err(ProcessingError::NoFrames);
        }
        let _permit = self.limiter.acquire("collage").await?;

        let path = dir.join(COLLAGE_FILE);
        let target = path.clone();
        let (cell_w, cell_h) = (self.config.collage_cell_width, self.config.collage_cell_height);
        self.blocking("collage", move || {
            let peak = peak_index(&samples);
            let center = peak.unwrap_or(samples.len() / 2);
            let indices = collage_indices(samples.len(), center, COLLAGE_SLOTS);
            let collage = compose_collage(&samples, &indices, peak, cell_w, cell_h);
            write_jpeg(&collage, &target)
        })
        .await?;

        debug!("wrote collage {:?}", path);
        Ok(path)
    }

    async fn render_gif(&self, dir: &Path, samples: Arc<Vec<SampledFrame>>) -> Result<Option<PathBuf>, ProcessingError> {
        if !self.config.gif_enabled {
            return Ok(None);
        }
        if samples.is_empty() {
            return Err(ProcessingError::NoFrames);
        }
        let _permit = self.limiter.acquire("preview").await?;

        let path = dir.join(GIF_FILE);
        let target = path.clone();
        let config = self.config.clone();
        let width = self
            .blocking("preview", move || {
                let indices = evenly_spaced(samples.len(), config.gif_frames);
                let (bytes, width) = encode_gif_within_budget(
                    &samples,
                    &indices,
                    config.gif_width,
                    config.gif_min_width,
                    config.gif_delay_ms,
                    config.gif_max_bytes,
                )?;
                std::fs::write(&target, bytes)?;
                Ok(width)
            })
            .await?;

        if width < self.config.gif_width {
            debug!("preview {:?} reduced to {}px to fit budget", path, width);
        }
        Ok(Some(path))
    }

    /// Recorder clip when available, otherwise something synthesized now
    /// with a one-shot retry to swap in the recording later
    async fn render_clip(self: &Arc<Self>, event: &EventMedia, dir: &Path, samples: Arc<Vec<SampledFrame>>) -> Option<ClipArtifact> {
        let path = dir.join(CLIP_FILE);
        let (start, end) = self.clip_window(event);

        if let Some(recorder) = &self.recorder {
            let extraction = match self.limiter.acquire("clip").await {
                Ok(_permit) => recorder.extract_clip(&event.camera_id, start, end, &path, self.config.clip_speed).await,
                Err(e) => Err(e),
            };

            match extraction {
                Ok(ClipExtraction::Extracted { .. }) => {
                    return Some(ClipArtifact {
                        path,
                        source: ClipSource::Recorder,
                        upgrade_scheduled: false,
                    });
                }
                Ok(ClipExtraction::Unavailable(reason)) => {
                    let delay = self.retry_delay(&reason, Utc::now());
                    info!(
                        "recording for {} not ready ({:?}), synthesizing clip and retrying in {}s",
                        event.event_id,
                        reason,
                        delay.as_secs()
                    );
                    let synthesized = self.synthesize_clip(&path, &samples, start, end).await;
                    self.schedule_clip_upgrade(event.camera_id.clone(), start, end, path.clone(), delay);
                    let mut clip = synthesized.unwrap_or_else(|| artifact(&path, ClipSource::Pending));
                    clip.upgrade_scheduled = true;
                    return Some(clip);
                }
                Err(e) => warn!("clip extraction for {} failed: {}", event.event_id, e),
            }
        }

        self.synthesize_clip(&path, &samples, start, end).await
    }

    /// Wait before retrying a recorder clip
    pub fn retry_delay(&self, reason: &Unavailable, now: DateTime<Utc>) -> Duration {
        let until_closed = match reason {
            Unavailable::SegmentOpen { ready_at } => (*ready_at - now).to_std().unwrap_or(Duration::ZERO),
            Unavailable::NoSegments => self.config.segment_duration,
        };
        until_closed + self.config.clip_retry_margin
    }

    /// One-shot retry replacing the clip at `path` with a recorder clip
    pub fn schedule_clip_upgrade(
        self: &Arc<Self>,
        camera_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        path: PathBuf,
        delay: Duration,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(recorder) = pipeline.recorder.clone() else {
                return;
            };
            let Ok(_permit) = pipeline.limiter.acquire("clip upgrade").await else {
                return;
            };

            match recorder.extract_clip(&camera_id, start, end, &path, pipeline.config.clip_speed).await {
                Ok(ClipExtraction::Extracted { segments, .. }) => {
                    info!("replaced clip {:?} with recording from {} segments", path, segments)
                }
                Ok(ClipExtraction::Unavailable(reason)) => {
                    warn!("recording for {:?} still unavailable ({:?}), keeping synthesized clip", path, reason)
                }
                Err(e) => warn!("clip upgrade for {:?} failed: {}", path, e),
            }
        })
    }

    /// Encoder chain, then a still-frame clip, then an in-process MJPEG AVI
    async fn synthesize_clip(&self, path: &Path, samples: &[SampledFrame], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<ClipArtifact> {
        let mut window: Vec<&SampledFrame> = samples
            .iter()
            .filter(|s| s.timestamp() >= start && s.timestamp() <= end)
            .collect();
        if window.is_empty() {
            window = samples.iter().collect();
        }
        if window.is_empty() {
            warn!("no frames to synthesize clip {:?}", path);
            return None;
        }

        let Ok(_permit) = self.limiter.acquire("clip").await else {
            return None;
        };

        let frames: Vec<RgbImage> = window.iter().map(|s| s.frame.image().clone()).collect();
        let fps = synthesis_fps(&window, self.config.clip_speed);
        let attempts = self.encoder.encode_frames(&frames, fps, path).await;
        if matches!(attempts.last(), Some(EncodeAttempt::Encoded { .. })) {
            return Some(artifact(path, ClipSource::Synthesized));
        }

        let still = peak_index(&window).unwrap_or(frames.len() / 2);
        match self.encoder.still_frame_clip(&frames[still], path, self.config.still_clip_secs).await {
            Ok(()) => return Some(artifact(path, ClipSource::StillFrame)),
            Err(e) => warn!("still-frame clip {:?} failed: {}", path, e),
        }

        let target = path.to_path_buf();
        match self.blocking("mjpeg", move || write_mjpeg_avi(&frames, fps, &target)).await {
            Ok(()) => {
                warn!("clip {:?} written as motion-jpeg, no ffmpeg encoder worked", path);
                Some(artifact(path, ClipSource::MotionJpeg))
            }
            Err(e) => {
                error!("could not write any clip to {:?}: {}", path, e);
                None
            }
        }
    }

    async fn blocking<T, F>(&self, stage: &'static str, work: F) -> Result<T, ProcessingError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ProcessingError> + Send + 'static,
    {
        let timeout = self.config.render_timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
            Ok(joined) => joined?,
            Err(_) => Err(ProcessingError::Timeout {
                stage,
                secs: timeout.as_secs(),
            }),
        }
    }
}

fn artifact(path: &Path, source: ClipSource) -> ClipArtifact {
    ClipArtifact {
        path: path.to_path_buf(),
        source,
        upgrade_scheduled: false,
    }
}

/// Real-time rate of the samples, sped up, within [1, 30]
fn synthesis_fps(window: &[&SampledFrame], speed: f32) -> f32 {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return 1.0;
    };
    let span = (last.timestamp() - first.timestamp()).num_milliseconds() as f32 / 1000.0;
    if span <= 0.0 {
        return 2.0;
    }
    (window.len() as f32 / span * speed.max(0.1)).clamp(1.0, 30.0)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ClipEncoderConfig;
    use crate::recorder::RecorderConfig;
    use image::Rgb;
    use vigil_capture::Frame;
    use vigil_detect::{BoundingBox, Detection};

    fn samples(count: usize, t0: DateTime<Utc>) -> Vec<SampledFrame> {
        (0..count)
            .map(|i| {
                let image = RgbImage::from_pixel(64, 48, Rgb([(i * 10) as u8, 90, 140]));
                let det = Detection::new(BoundingBox::new(10.0, 5.0, 30.0, 40.0), 0.5 + i as f32 / 100.0, "person");
                SampledFrame::new(Frame::from_image("cam", t0 + chrono::Duration::milliseconds(i as i64 * 500), image), vec![det])
            })
            .collect()
    }

    fn pipeline(root: &Path, recorder: Option<Arc<ContinuousRecorder>>) -> Arc<MediaPipeline> {
        let config = MediaConfig {
            root: root.join("events"),
            collage_cell_width: 64,
            collage_cell_height: 48,
            gif_width: 64,
            gif_min_width: 32,
            ..MediaConfig::default()
        };
        let encoder = ClipEncoder::new(ClipEncoderConfig {
            ffmpeg: root.join("no-such-ffmpeg"),
            ..ClipEncoderConfig::default()
        });
        Arc::new(MediaPipeline::new(config, encoder, recorder))
    }

    fn event(t0: DateTime<Utc>) -> EventMedia {
        EventMedia {
            event_id: "front-20240501T100000".to_string(),
            camera_id: "front".to_string(),
            episode_start: t0,
            confirmed_at: t0 + chrono::Duration::seconds(3),
        }
    }

    #[tokio::test]
    async fn test_limiter_never_exceeds_capacity() {
        let limiter = Arc::new(RenderLimiter::new(2, Duration::from_secs(2)));
        let mut handles = Vec::new();
        for i in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(&format!("job {}", i)).await.unwrap();
                assert!(limiter.in_flight() <= 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(limiter.peak() <= 2);
        assert!(limiter.peak() >= 1);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_artifacts_fall_back_without_ffmpeg() {
        let root = tempfile::tempdir().unwrap();
        let media = pipeline(root.path(), None);
        let t0 = Utc::now();
        let event = event(t0);

        let set = media.render_event(&event, samples(12, t0)).await.unwrap();
        assert_eq!(set.dir, root.path().join("events").join(&event.event_id));
        assert!(set.collage.as_ref().unwrap().ends_with(COLLAGE_FILE));
        assert!(set.gif.as_ref().unwrap().ends_with(GIF_FILE));

        let clip = set.clip.unwrap();
        assert_eq!(clip.source, ClipSource::MotionJpeg);
        assert!(clip.path.ends_with(CLIP_FILE));
        let bytes = std::fs::read(&clip.path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        // 12 frames, none dropped
        assert_eq!(u32::from_le_bytes([bytes[48], bytes[49], bytes[50], bytes[51]]), 12);
        assert!(!clip.upgrade_scheduled);
        assert_eq!(media.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_recording_schedules_upgrade() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ContinuousRecorder::new(RecorderConfig {
            root: root.path().join("recordings"),
            ffmpeg: root.path().join("no-such-ffmpeg"),
            ..RecorderConfig::default()
        }));
        let media = pipeline(root.path(), Some(recorder));
        let t0 = Utc::now() - chrono::Duration::seconds(120);

        let set = media.render_event(&event(t0), samples(6, t0)).await.unwrap();
        let clip = set.clip.unwrap();
        assert!(clip.upgrade_scheduled);
        assert!(clip.path.exists());
    }

    #[tokio::test]
    async fn test_no_samples_still_waits_for_recording() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(ContinuousRecorder::new(RecorderConfig {
            root: root.path().join("recordings"),
            ffmpeg: root.path().join("no-such-ffmpeg"),
            ..RecorderConfig::default()
        }));
        let media = pipeline(root.path(), Some(recorder));
        let t0 = Utc::now() - chrono::Duration::seconds(120);

        let set = media.render_event(&event(t0), Vec::new()).await.unwrap();
        assert_eq!(set.collage, None);
        let clip = set.clip.unwrap();
        assert_eq!(clip.source, ClipSource::Pending);
        assert!(clip.upgrade_scheduled);
        assert!(clip.path.ends_with(CLIP_FILE));
    }

    #[tokio::test]
    async fn test_no_samples_renders_nothing() {
        let root = tempfile::tempdir().unwrap();
        let media = pipeline(root.path(), None);
        let set = media.render_event(&event(Utc::now()), Vec::new()).await.unwrap();
        assert_eq!(set.collage, None);
        assert_eq!(set.gif, None);
        assert_eq!(set.clip, None);
    }

    #[test]
    fn test_retry_delay() {
        let root = tempfile::tempdir().unwrap();
        let media = pipeline(root.path(), None);
        let now = Utc::now();
        let open = Unavailable::SegmentOpen { ready_at: now + chrono::Duration::seconds(40) };
        assert_eq!(media.retry_delay(&open, now), Duration::from_secs(55));
        assert_eq!(media.retry_delay(&Unavailable::NoSegments, now), Duration::from_secs(75));
    }

    #[test]
    fn test_clip_window_adds_rolls() {
        let root = tempfile::tempdir().unwrap();
        let media = pipeline(root.path(), None);
        let t0 = Utc::now();
        let (start, end) = media.clip_window(&event(t0));
        assert_eq!(start, t0 - chrono::Duration::seconds(10));
        assert_eq!(end, t0 + chrono::Duration::seconds(13));
    }

    #[test]
    fn test_synthesis_fps() {
        let t0 = Utc::now();
        let s = samples(11, t0);
        let refs: Vec<&SampledFrame> = s.iter().collect();
        // 11 frames over 5s
        assert!((synthesis_fps(&refs, 1.0) - 2.2).abs() < 0.01);
        assert_eq!(synthesis_fps(&refs, 100.0), 30.0);
    }
}
