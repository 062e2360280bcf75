//! Continuous segmented recording
//!
//! One FFmpeg process per camera copies the stream (no re-encode) into
//! fixed-length segments named by UTC start time. A maintenance loop restarts
//! dead or stalled processes and enforces retention. Clips are cut from the
//! closed segments on demand.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::encoder::run_ffmpeg;
use crate::error::ProcessingError;
use crate::segment::{
    concat_list_contents, list_segments, select_for_window, ExtractPlan, Segment, SEGMENT_EXTENSION,
    SEGMENT_NAME_FORMAT,
};

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Segments land in `{root}/{camera_id}/`
    pub root: PathBuf,
    pub ffmpeg: PathBuf,
    pub segment_duration: Duration,
    /// Extra time after a segment's nominal end before it counts as closed
    pub write_grace: Duration,
    pub max_age: Duration,
    /// Cap on all cameras' segments together
    pub max_total_bytes: Option<u64>,
    pub health_interval: Duration,
    pub retention_interval: Duration,
    /// No new segment data for this long means the process is wedged
    pub stall_timeout: Duration,
    /// How long ffmpeg gets to finish the current segment after `q`
    pub stop_grace: Duration,
    pub extract_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("recordings"),
            ffmpeg: PathBuf::from("ffmpeg"),
            segment_duration: Duration::from_secs(60),
            write_grace: Duration::from_secs(10),
            max_age: Duration::from_secs(24 * 3600),
            max_total_bytes: None,
            health_interval: Duration::from_secs(10),
            retention_interval: Duration::from_secs(300),
            stall_timeout: Duration::from_secs(180),
            stop_grace: Duration::from_secs(5),
            extract_timeout: Duration::from_secs(120),
        }
    }
}

/// Why a clip could not be cut yet
#[derive(Debug, Clone, PartialEq)]
pub enum Unavailable {
    /// No recorded segment overlaps the window
    NoSegments,
    /// Part of the window is still being written
    SegmentOpen { ready_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClipExtraction {
    Extracted { path: PathBuf, segments: usize },
    Unavailable(Unavailable),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

struct CaptureProcess {
    url: String,
    child: Option<Child>,
    started_at: Instant,
    restarts: u32,
    /// Health check holds the child outside the lock
    restarting: bool,
}

impl CaptureProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.as_mut().map(|c| c.try_wait()), Some(Ok(None)))
    }
}

pub struct ContinuousRecorder {
    config: RecorderConfig,
    processes: Mutex<HashMap<String, CaptureProcess>>,
}

impl ContinuousRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.config.root.join(sanitize_id(camera_id))
    }

    /// Start recording `camera_id`. A running process for the same URL is
    /// left alone; a different URL replaces it.
    pub async fn start(&self, camera_id: &str, url: &str) -> Result<(), ProcessingError> {
        let mut processes = self.processes.lock().await;

        if let Some(existing) = processes.get_mut(camera_id) {
            if existing.url == url && existing.is_alive() {
                debug!("recorder for {} already running", camera_id);
                return Ok(());
            }
        }
        if let Some(old) = processes.remove(camera_id) {
            self.shutdown_process(camera_id, old).await;
        }

        let child = self.spawn_capture(camera_id, url)?;
        info!("recording {} into {:?}", camera_id, self.camera_dir(camera_id));
        processes.insert(
            camera_id.to_string(),
            CaptureProcess {
                url: url.to_string(),
                child: Some(child),
                started_at: Instant::now(),
                restarts: 0,
                restarting: false,
            },
        );
        Ok(())
    }

    /// Stop recording; returns false if the camera wasn't recording
    pub async fn stop(&self, camera_id: &str) -> bool {
        let process = self.processes.lock().await.remove(camera_id);
        match process {
            Some(process) => {
                self.shutdown_process(camera_id, process).await;
                info!("stopped recording {}", camera_id);
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, CaptureProcess)> = self.processes.lock().await.drain().collect();
        for (camera_id, process) in drained {
            self.shutdown_process(&camera_id, process).await;
        }
    }

    pub async fn is_recording(&self, camera_id: &str) -> bool {
        self.processes
            .lock()
            .await
            .get_mut(camera_id)
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    pub async fn cameras(&self) -> Vec<String> {
        self.processes.lock().await.keys().cloned().collect()
    }

    /// Restart exited or stalled processes; returns how many were restarted.
    /// The process table is only locked for bookkeeping, never while a child
    /// is being stopped or the disk is scanned.
    pub async fn check_health(&self) -> usize {
        let mut exited = Vec::new();
        let mut suspects = Vec::new();
        {
            let mut processes = self.processes.lock().await;
            for (camera_id, process) in processes.iter_mut() {
                if process.restarting {
                    continue;
                }
                if !process.is_alive() {
                    exited.push(camera_id.clone());
                } else if process.started_at.elapsed() >= self.config.stall_timeout {
                    suspects.push((camera_id.clone(), self.camera_dir(camera_id)));
                }
            }
        }

        let stall_timeout = self.config.stall_timeout;
        let stalled = match tokio::task::spawn_blocking(move || {
            suspects
                .into_iter()
                .filter(|(_, dir)| newest_write_age(dir).map_or(true, |age| age > stall_timeout))
                .map(|(camera_id, _)| camera_id)
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(stalled) => stalled,
            Err(e) => {
                warn!("stall scan failed: {}", e);
                Vec::new()
            }
        };

        let mut restarted = 0;
        for camera_id in exited {
            warn!("recorder for {} exited, restarting", camera_id);
            if self.restart(&camera_id).await {
                restarted += 1;
            }
        }
        for camera_id in stalled {
            warn!("recorder for {} stalled, restarting", camera_id);
            if self.restart(&camera_id).await {
                restarted += 1;
            }
        }
        restarted
    }

    /// Take the child out, stop it unlocked, spawn a new one and put it back
    /// unless the camera was stopped or restarted meanwhile
    async fn restart(&self, camera_id: &str) -> bool {
        let (url, old) = {
            let mut processes = self.processes.lock().await;
            let Some(process) = processes.get_mut(camera_id) else {
                return false;
            };
            process.restarting = true;
            (process.url.clone(), process.child.take())
        };

        if let Some(child) = old {
            stop_child(camera_id, child, self.config.stop_grace).await;
        }

        let spawned = self.spawn_capture(camera_id, &url);

        let mut processes = self.processes.lock().await;
        match (processes.get_mut(camera_id), spawned) {
            (Some(process), Ok(child)) if process.restarting && process.url == url => {
                process.child = Some(child);
                process.restarting = false;
                process.restarts += 1;
                process.started_at = Instant::now();
                true
            }
            (Some(process), Err(e)) if process.restarting => {
                // Left without a child, so the next check retries
                process.restarting = false;
                error!("failed to restart recorder for {}: {}", camera_id, e);
                false
            }
            // Stopped or replaced while unlocked; the new child dies on drop
            _ => false,
        }
    }

    pub async fn enforce_retention(&self) -> Result<RetentionReport, ProcessingError> {
        let root = self.config.root.clone();
        let segment_duration = self.config.segment_duration;
        let max_age = self.config.max_age;
        let max_total_bytes = self.config.max_total_bytes;

        let report = tokio::task::spawn_blocking(move || {
            apply_retention(&root, segment_duration, Utc::now(), max_age, max_total_bytes)
        })
        .await??;

        if report.deleted > 0 {
            info!(
                "retention removed {} segments ({} bytes), {} bytes kept",
                report.deleted, report.freed_bytes, report.remaining_bytes
            );
        }
        Ok(report)
    }

    /// Health checks and retention until `shutdown` is set
    pub fn spawn_maintenance(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_health = Instant::now();
            let mut last_retention: Option<Instant> = None;

            while !shutdown.load(Ordering::SeqCst) {
                if last_health.elapsed() >= self.config.health_interval {
                    let restarted = self.check_health().await;
                    if restarted > 0 {
                        info!("restarted {} recorders", restarted);
                    }
                    last_health = Instant::now();
                }

                if last_retention.map_or(true, |t| t.elapsed() >= self.config.retention_interval) {
                    if let Err(e) = self.enforce_retention().await {
                        warn!("retention pass failed: {}", e);
                    }
                    last_retention = Some(Instant::now());
                }

                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            debug!("recorder maintenance stopped");
        })
    }

    pub fn segments(&self, camera_id: &str) -> Result<Vec<Segment>, ProcessingError> {
        Ok(list_segments(&self.camera_dir(camera_id), self.config.segment_duration)?)
    }

    /// Cut `[start, end)` into `output`. Unavailable while any overlapping
    /// segment is still open; callers retry after `ready_at`.
    pub async fn extract_clip(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        output: &Path,
        speed: f32,
    ) -> Result<ClipExtraction, ProcessingError> {
        if end <= start {
            return Err(ProcessingError::InvalidWindow(format!("{} is not before {}", start, end)));
        }

        let now = Utc::now();
        let grace = self.config.write_grace;
        if end > now {
            let ready_at = end + to_chrono(self.config.segment_duration + grace);
            return Ok(ClipExtraction::Unavailable(Unavailable::SegmentOpen { ready_at }));
        }

        let dir = self.camera_dir(camera_id);
        let segment_duration = self.config.segment_duration;
        let segments = tokio::task::spawn_blocking(move || list_segments(&dir, segment_duration)).await??;

        let overlapping: Vec<&Segment> = segments.iter().filter(|s| s.overlaps(start, end)).collect();
        if overlapping.is_empty() {
            return Ok(ClipExtraction::Unavailable(Unavailable::NoSegments));
        }
        if let Some(open) = overlapping.iter().rev().find(|s| !s.is_closed(now, grace)) {
            return Ok(ClipExtraction::Unavailable(Unavailable::SegmentOpen {
                ready_at: open.closes_at(grace),
            }));
        }

        let selected = select_for_window(&segments, start, end, now, grace);
        let Some(plan) = ExtractPlan::new(&selected, start, end) else {
            return Ok(ClipExtraction::Unavailable(Unavailable::NoSegments));
        };

        self.run_plan(&plan, output, speed).await?;
        info!("extracted clip for {} from {} segments into {:?}", camera_id, selected.len(), output);
        Ok(ClipExtraction::Extracted {
            path: output.to_path_buf(),
            segments: selected.len(),
        })
    }

    /// Writes to a staging file and renames, so a rerun replaces the clip whole
    async fn run_plan(&self, plan: &ExtractPlan, output: &Path, speed: f32) -> Result<(), ProcessingError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = output.with_extension("partial.mp4");
        let list_path = output.with_extension("concat.txt");

        let list = match plan {
            ExtractPlan::Concat { .. } => {
                tokio::fs::write(&list_path, concat_list_contents(&plan.segments())).await?;
                Some(list_path.as_path())
            }
            ExtractPlan::Single { .. } => None,
        };

        let args = plan.ffmpeg_args(&staging, speed, list);
        let result = run_ffmpeg(&self.config.ffmpeg, &args, "extract", self.config.extract_timeout).await;
        if list.is_some() {
            let _ = tokio::fs::remove_file(&list_path).await;
        }

        match result {
            Ok(()) => {
                tokio::fs::rename(&staging, output).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    fn spawn_capture(&self, camera_id: &str, url: &str) -> Result<Child, ProcessingError> {
        let dir = self.camera_dir(camera_id);
        fs::create_dir_all(&dir)?;
        let pattern = dir.join(format!("{}.{}", SEGMENT_NAME_FORMAT, SEGMENT_EXTENSION));

        let mut cmd = Command::new(&self.config.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        cmd.arg("-i").arg(url)
            .arg("-map").arg("0:v:0")
            .arg("-an")
            .arg("-c").arg("copy")
            .arg("-f").arg("segment")
            .arg("-segment_time").arg(self.config.segment_duration.as_secs().max(1).to_string())
            .arg("-segment_atclocktime").arg("1")
            .arg("-segment_format").arg("mp4")
            .arg("-reset_timestamps").arg("1")
            .arg("-strftime").arg("1")
            .arg(&pattern)
            // strftime names must be UTC
            .env("TZ", "UTC")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!("spawning ffmpeg recorder: {:?}", cmd);
        Ok(cmd.spawn()?)
    }

    async fn shutdown_process(&self, camera_id: &str, mut process: CaptureProcess) {
        if process.restarts > 0 {
            debug!("recorder for {} had {} restarts", camera_id, process.restarts);
        }
        if let Some(child) = process.child.take() {
            stop_child(camera_id, child, self.config.stop_grace).await;
        }
    }
}

/// Ask ffmpeg to quit so the open segment is finalized, kill after `grace`
async fn stop_child(camera_id: &str, mut child: Child, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("recorder for {} exited with {}", camera_id, status),
        Ok(Err(e)) => warn!("waiting for recorder {} failed: {}", camera_id, e),
        Err(_) => {
            warn!("recorder for {} ignored quit, killing", camera_id);
            if let Err(e) = child.kill().await {
                warn!("failed to kill recorder {}: {}", camera_id, e);
            }
        }
    }
}

/// Delete segments older than `max_age`, then the oldest until the total
/// fits `max_total_bytes`. Each camera's newest segment is never removed.
pub fn apply_retention(
    root: &Path,
    segment_duration: Duration,
    now: DateTime<Utc>,
    max_age: Duration,
    max_total_bytes: Option<u64>,
) -> io::Result<RetentionReport> {
    let mut candidates: Vec<(Segment, u64)> = Vec::new();
    let mut remaining_bytes = 0u64;

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RetentionReport::default()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let mut segments = list_segments(&entry.path(), segment_duration)?;
        // Possibly still being written
        if let Some(newest) = segments.pop() {
            remaining_bytes += file_size(&newest.path);
        }
        for segment in segments {
            let size = file_size(&segment.path);
            remaining_bytes += size;
            candidates.push((segment, size));
        }
    }

    candidates.sort_by_key(|(s, _)| s.start);
    let cutoff = now - to_chrono(max_age);
    let mut report = RetentionReport::default();

    for (segment, size) in candidates {
        let too_old = segment.start < cutoff;
        let over_cap = max_total_bytes.is_some_and(|cap| remaining_bytes > cap);
        if !too_old && !over_cap {
            continue;
        }
        match fs::remove_file(&segment.path) {
            Ok(()) => {
                report.deleted += 1;
                report.freed_bytes += size;
                remaining_bytes -= size;
            }
            Err(e) => warn!("failed to delete segment {:?}: {}", segment.path, e),
        }
    }

    report.remaining_bytes = remaining_bytes;
    Ok(report)
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Time since any segment in `dir` was last modified
fn newest_write_age(dir: &Path) -> Option<Duration> {
    let newest: SystemTime = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()?;
    Some(SystemTime::now().duration_since(newest).unwrap_or(Duration::ZERO))
}

fn sanitize_id(camera_id: &str) -> String {
    camera_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
