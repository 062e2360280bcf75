//! Configuration management
//!
//! One TOML file, one typed struct per section. Unknown keys are rejected.
//! Cameras inherit `[detection]` and override it field by field.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vigil_detect::{
    AspectPreset, AspectRatioBounds, DebounceConfig, Modality, MotionConfig, TemporalConfig, Zone,
};
use vigil_processing::{ClipEncoderConfig, MediaConfig, RecorderConfig, RingConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub general: GeneralConfig,
    pub inference: InferenceConfig,
    pub detection: DetectionSettings,
    pub motion: MotionSettings,
    pub recorder: RecorderSettings,
    pub media: MediaSettings,
    pub load: LoadSettings,
    pub status: StatusSettings,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Defaults to `<local data>/Vigil`
    pub data_dir: Option<PathBuf>,
    /// Defaults to `{data_dir}/recordings`
    pub recording_root: Option<PathBuf>,
    /// Defaults to `{data_dir}/events`
    pub media_root: Option<PathBuf>,
    pub ffmpeg: PathBuf,
    /// Decode size for detection frames
    pub capture_width: u32,
    pub capture_height: u32,
    /// How long cached config snapshots are reused
    pub snapshot_ttl_secs: u64,
    /// Bounded wait when stopping a camera
    pub stop_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            recording_root: None,
            media_root: None,
            ffmpeg: PathBuf::from("ffmpeg"),
            capture_width: 1280,
            capture_height: 720,
            snapshot_ttl_secs: 5,
            stop_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    /// Detection service URL; without one cameras only record
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    pub target_class: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 10,
            target_class: "person".to_string(),
        }
    }
}

/// Detection tunables; global defaults and per-camera result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionSettings {
    pub confidence: f32,
    pub aspect_preset: AspectPreset,
    /// Used when `aspect_preset = "custom"`
    pub aspect_bounds: Option<AspectRatioBounds>,
    pub min_consecutive_frames: usize,
    pub max_gap_frames: usize,
    /// Require zone inertia before detections count
    pub zone_gating: bool,
    pub zone_inertia_frames: usize,
    pub min_frames_in_zone: usize,
    pub min_event_duration_secs: f64,
    pub cooldown_secs: u64,
    pub target_fps: f32,
    pub min_fps: f32,
    pub max_fps: f32,
    pub modality: Modality,
    pub motion_gate: bool,
    pub motion_sensitivity: u8,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            aspect_preset: AspectPreset::Normal,
            aspect_bounds: None,
            min_consecutive_frames: 3,
            max_gap_frames: 1,
            zone_gating: true,
            zone_inertia_frames: 4,
            min_frames_in_zone: 3,
            min_event_duration_secs: 2.0,
            cooldown_secs: 60,
            target_fps: 2.0,
            min_fps: 0.5,
            max_fps: 5.0,
            modality: Modality::Color,
            motion_gate: true,
            motion_sensitivity: 5,
        }
    }
}

/// Per-camera overrides; `None` keeps the global value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionOverrides {
    pub confidence: Option<f32>,
    pub aspect_preset: Option<AspectPreset>,
    pub aspect_bounds: Option<AspectRatioBounds>,
    pub min_consecutive_frames: Option<usize>,
    pub max_gap_frames: Option<usize>,
    pub zone_gating: Option<bool>,
    pub zone_inertia_frames: Option<usize>,
    pub min_frames_in_zone: Option<usize>,
    pub min_event_duration_secs: Option<f64>,
    pub cooldown_secs: Option<u64>,
    pub target_fps: Option<f32>,
    pub min_fps: Option<f32>,
    pub max_fps: Option<f32>,
    pub modality: Option<Modality>,
    pub motion_gate: Option<bool>,
    pub motion_sensitivity: Option<u8>,
}

impl DetectionSettings {
    /// Global settings with `overrides` applied field by field
    pub fn with_overrides(&self, overrides: &DetectionOverrides) -> DetectionSettings {
        let o = overrides;
        DetectionSettings {
            confidence: o.confidence.unwrap_or(self.confidence),
            aspect_preset: o.aspect_preset.unwrap_or(self.aspect_preset),
            aspect_bounds: o.aspect_bounds.or(self.aspect_bounds),
            min_consecutive_frames: o.min_consecutive_frames.unwrap_or(self.min_consecutive_frames),
            max_gap_frames: o.max_gap_frames.unwrap_or(self.max_gap_frames),
            zone_gating: o.zone_gating.unwrap_or(self.zone_gating),
            zone_inertia_frames: o.zone_inertia_frames.unwrap_or(self.zone_inertia_frames),
            min_frames_in_zone: o.min_frames_in_zone.unwrap_or(self.min_frames_in_zone),
            min_event_duration_secs: o.min_event_duration_secs.unwrap_or(self.min_event_duration_secs),
            cooldown_secs: o.cooldown_secs.unwrap_or(self.cooldown_secs),
            target_fps: o.target_fps.unwrap_or(self.target_fps),
            min_fps: o.min_fps.unwrap_or(self.min_fps),
            max_fps: o.max_fps.unwrap_or(self.max_fps),
            modality: o.modality.unwrap_or(self.modality),
            motion_gate: o.motion_gate.unwrap_or(self.motion_gate),
            motion_sensitivity: o.motion_sensitivity.unwrap_or(self.motion_sensitivity),
        }
    }

    pub fn aspect_bounds(&self) -> AspectRatioBounds {
        AspectRatioBounds::from_preset(self.aspect_preset, self.aspect_bounds)
    }

    pub fn temporal(&self) -> TemporalConfig {
        TemporalConfig {
            min_consecutive_frames: self.min_consecutive_frames,
            max_gap_frames: self.max_gap_frames,
        }
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            min_event_duration: Duration::try_from_secs_f64(self.min_event_duration_secs.max(0.0))
                .unwrap_or(Duration::ZERO),
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("{}: confidence {} outside [0, 1]", scope, self.confidence);
        }
        let bounds = self.aspect_bounds();
        if bounds.min_ratio <= 0.0 || bounds.min_ratio > bounds.max_ratio {
            bail!("{}: aspect bounds [{}, {}] are invalid", scope, bounds.min_ratio, bounds.max_ratio);
        }
        if self.min_consecutive_frames == 0 {
            bail!("{}: min_consecutive_frames must be at least 1", scope);
        }
        if self.min_frames_in_zone == 0 || self.min_frames_in_zone > self.zone_inertia_frames {
            bail!(
                "{}: min_frames_in_zone {} must be within 1..={}",
                scope, self.min_frames_in_zone, self.zone_inertia_frames
            );
        }
        if !self.min_event_duration_secs.is_finite() || self.min_event_duration_secs < 0.0 {
            bail!("{}: min_event_duration_secs {} must be a non-negative number", scope, self.min_event_duration_secs);
        }
        let fps = [self.target_fps, self.min_fps, self.max_fps];
        if fps.iter().any(|f| !f.is_finite()) || self.min_fps <= 0.0 || self.min_fps > self.max_fps {
            bail!("{}: fps bounds [{}, {}] are invalid", scope, self.min_fps, self.max_fps);
        }
        if !(1..=10).contains(&self.motion_sensitivity) {
            bail!("{}: motion_sensitivity {} outside 1-10", scope, self.motion_sensitivity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionSettings {
    pub min_area: u32,
    pub cooldown_secs: u64,
    pub work_width: u32,
    pub work_height: u32,
    pub blur_sigma: f32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        let defaults = MotionConfig::default();
        Self {
            min_area: defaults.min_area,
            cooldown_secs: defaults.cooldown.as_secs(),
            work_width: defaults.work_width,
            work_height: defaults.work_height,
            blur_sigma: defaults.blur_sigma,
        }
    }
}

impl MotionSettings {
    pub fn to_motion_config(&self, sensitivity: u8) -> MotionConfig {
        MotionConfig {
            sensitivity,
            min_area: self.min_area,
            cooldown: Duration::from_secs(self.cooldown_secs),
            work_width: self.work_width,
            work_height: self.work_height,
            blur_sigma: self.blur_sigma,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderSettings {
    pub enabled: bool,
    pub segment_secs: u64,
    pub write_grace_secs: u64,
    pub max_age_hours: u64,
    pub max_total_bytes: Option<u64>,
    pub health_interval_secs: u64,
    pub retention_interval_secs: u64,
    pub stall_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub extract_timeout_secs: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            segment_secs: 60,
            write_grace_secs: 10,
            max_age_hours: 24,
            max_total_bytes: None,
            health_interval_secs: 10,
            retention_interval_secs: 300,
            stall_timeout_secs: 180,
            stop_grace_secs: 5,
            extract_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediaSettings {
    pub render_concurrency: usize,
    pub slow_wait_secs: u64,
    pub render_timeout_secs: u64,
    pub use_hw_encoding: bool,
    pub quality: u32,
    pub gif_enabled: bool,
    pub gif_frames: usize,
    pub gif_width: u32,
    pub gif_max_bytes: usize,
    pub clip_pre_roll_secs: u64,
    pub clip_post_roll_secs: u64,
    pub clip_speed: f32,
    pub clip_retry_margin_secs: u64,
    /// Ring buffer length per camera
    pub buffer_frames: usize,
    /// Minimum spacing between buffered frames
    pub buffer_interval_ms: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            render_concurrency: 2,
            slow_wait_secs: 2,
            render_timeout_secs: 60,
            use_hw_encoding: false,
            quality: 26,
            gif_enabled: true,
            gif_frames: 10,
            gif_width: 480,
            gif_max_bytes: 4 * 1024 * 1024,
            clip_pre_roll_secs: 10,
            clip_post_roll_secs: 10,
            clip_speed: 1.0,
            clip_retry_margin_secs: 15,
            buffer_frames: 120,
            buffer_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSettings {
    pub enabled: bool,
    /// CPU percent above which inference slows down
    pub high_cpu: f32,
    /// CPU percent below which inference speeds back up
    pub low_cpu: f32,
    pub adjust_interval_secs: u64,
    pub fps_step: f32,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            high_cpu: 80.0,
            low_cpu: 50.0,
            adjust_interval_secs: 10,
            fps_step: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSettings {
    pub min_interval_secs: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self { min_interval_secs: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    Detect,
    Record,
}

fn default_roles() -> Vec<CameraRole> {
    vec![CameraRole::Detect, CameraRole::Record]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_roles")]
    pub roles: Vec<CameraRole>,
    #[serde(default)]
    pub overrides: DetectionOverrides,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            enabled: true,
            roles: default_roles(),
            overrides: DetectionOverrides::default(),
            zones: Vec::new(),
        }
    }

    pub fn has_role(&self, role: CameraRole) -> bool {
        self.roles.contains(&role)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detection.validate("detection")?;

        if self.media.render_concurrency == 0 {
            bail!("media.render_concurrency must be at least 1");
        }
        if !(self.media.clip_speed.is_finite() && self.media.clip_speed > 0.0) {
            bail!("media.clip_speed must be positive");
        }
        if !self.motion.blur_sigma.is_finite() || self.motion.blur_sigma < 0.0 {
            bail!("motion.blur_sigma must be a non-negative number");
        }
        let load = [self.load.high_cpu, self.load.low_cpu, self.load.fps_step];
        if load.iter().any(|v| !v.is_finite()) {
            bail!("load thresholds must be finite numbers");
        }
        if self.recorder.segment_secs == 0 {
            bail!("recorder.segment_secs must be positive");
        }
        if self.load.low_cpu >= self.load.high_cpu {
            bail!("load.low_cpu must be below load.high_cpu");
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.is_empty() {
                bail!("camera with url {} has an empty id", camera.url);
            }
            if !seen.insert(camera.id.as_str()) {
                bail!("duplicate camera id {}", camera.id);
            }
            self.detection
                .with_overrides(&camera.overrides)
                .validate(&format!("camera {}", camera.id))?;
            for zone in &camera.zones {
                zone.validate()
                    .with_context(|| format!("camera {}", camera.id))?;
            }
        }
        Ok(())
    }

    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }

    /// Resolve data directory with fallback to default
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Vigil")
        })
    }

    pub fn recording_root(&self) -> PathBuf {
        self.general
            .recording_root
            .clone()
            .unwrap_or_else(|| self.data_dir().join("recordings"))
    }

    pub fn media_root(&self) -> PathBuf {
        self.general
            .media_root
            .clone()
            .unwrap_or_else(|| self.data_dir().join("events"))
    }

    pub fn event_log(&self) -> PathBuf {
        self.data_dir().join("events.jsonl")
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        let r = &self.recorder;
        RecorderConfig {
            root: self.recording_root(),
            ffmpeg: self.general.ffmpeg.clone(),
            segment_duration: Duration::from_secs(r.segment_secs),
            write_grace: Duration::from_secs(r.write_grace_secs),
            max_age: Duration::from_secs(r.max_age_hours * 3600),
            max_total_bytes: r.max_total_bytes,
            health_interval: Duration::from_secs(r.health_interval_secs),
            retention_interval: Duration::from_secs(r.retention_interval_secs),
            stall_timeout: Duration::from_secs(r.stall_timeout_secs),
            stop_grace: Duration::from_secs(r.stop_grace_secs),
            extract_timeout: Duration::from_secs(r.extract_timeout_secs),
        }
    }

    pub fn media_config(&self) -> MediaConfig {
        let m = &self.media;
        MediaConfig {
            root: self.media_root(),
            render_concurrency: m.render_concurrency,
            slow_wait_threshold: Duration::from_secs(m.slow_wait_secs),
            render_timeout: Duration::from_secs(m.render_timeout_secs),
            gif_enabled: m.gif_enabled,
            gif_frames: m.gif_frames,
            gif_width: m.gif_width,
            gif_max_bytes: m.gif_max_bytes,
            clip_pre_roll: Duration::from_secs(m.clip_pre_roll_secs),
            clip_post_roll: Duration::from_secs(m.clip_post_roll_secs),
            clip_speed: m.clip_speed,
            clip_retry_margin: Duration::from_secs(m.clip_retry_margin_secs),
            segment_duration: Duration::from_secs(self.recorder.segment_secs),
            ..MediaConfig::default()
        }
    }

    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            capacity: self.media.buffer_frames,
            min_interval: Duration::from_millis(self.media.buffer_interval_ms),
        }
    }

    pub fn encoder_config(&self) -> ClipEncoderConfig {
        ClipEncoderConfig {
            ffmpeg: self.general.ffmpeg.clone(),
            use_hw_encoding: self.media.use_hw_encoding,
            quality: self.media.quality,
            timeout: Duration::from_secs(self.media.render_timeout_secs),
        }
    }
}
