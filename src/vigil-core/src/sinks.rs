//! Event and status sinks
//!
//! The pipeline doesn't persist events or publish status itself; it hands
//! them to these collaborators.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use vigil_capture::SourceState;
use vigil_detect::ConfirmedEvent;
use vigil_processing::ArtifactSet;

/// Receives confirmed events and, later, their rendered media
pub trait EventSink: Send + Sync {
    /// Record the event; the returned id names its media directory
    fn on_event_confirmed(&self, camera_id: &str, event: &ConfirmedEvent) -> Result<String>;

    fn on_artifacts_ready(&self, _event_id: &str, _artifacts: &ArtifactSet) -> Result<()> {
        Ok(())
    }
}

/// Receives coalesced camera status changes
pub trait StatusSink: Send + Sync {
    fn on_status_change(&self, camera_id: &str, state: SourceState, last_frame: Option<DateTime<Utc>>);
}

/// `{camera}-{timestamp}` with millisecond precision
pub fn event_id(camera_id: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", camera_id, at.format("%Y%m%dT%H%M%S%3f"))
}

/// Appends one JSON object per line
pub struct JsonlEventSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, value: &serde_json::Value) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open event log {:?}", self.path))?;
        writeln!(file, "{}", value)?;
        Ok(())
    }
}

impl EventSink for JsonlEventSink {
    fn on_event_confirmed(&self, camera_id: &str, event: &ConfirmedEvent) -> Result<String> {
        let id = event_id(camera_id, event.confirmed_at);
        self.append(&json!({
            "type": "event",
            "event_id": id,
            "camera_id": camera_id,
            "episode_start": event.episode_start,
            "confirmed_at": event.confirmed_at,
            "best": event.best,
            "detections": event.detections,
        }))?;
        Ok(id)
    }

    fn on_artifacts_ready(&self, event_id: &str, artifacts: &ArtifactSet) -> Result<()> {
        self.append(&json!({
            "type": "artifacts",
            "event_id": event_id,
            "dir": artifacts.dir,
            "collage": artifacts.collage,
            "gif": artifacts.gif,
            "clip": artifacts.clip.as_ref().map(|c| &c.path),
            "clip_source": artifacts.clip.as_ref().map(|c| format!("{:?}", c.source).to_lowercase()),
        }))
    }
}

/// Logs status changes
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn on_status_change(&self, camera_id: &str, state: SourceState, last_frame: Option<DateTime<Utc>>) {
        match last_frame {
            Some(at) => info!(camera_id = %camera_id, "camera {} (last frame {})", state.as_str(), at.format("%H:%M:%S")),
            None => info!(camera_id = %camera_id, "camera {}", state.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vigil_detect::{BoundingBox, Detection};
    use vigil_processing::{ClipArtifact, ClipSource};

    fn confirmed() -> ConfirmedEvent {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let best = Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 20.0), 0.91, "person");
        ConfirmedEvent {
            episode_start: start,
            confirmed_at: start + chrono::Duration::seconds(2),
            best: best.clone(),
            detections: vec![best],
        }
    }

    #[test]
    fn test_event_id_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 2).unwrap();
        assert_eq!(event_id("front", at), "front-20240501T100002000");
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlEventSink::new(dir.path().join("data").join("events.jsonl")).unwrap();

        let id = sink.on_event_confirmed("front", &confirmed()).unwrap();
        assert_eq!(id, "front-20240501T100002000");

        let artifacts = ArtifactSet {
            dir: dir.path().join(&id),
            collage: Some(dir.path().join(&id).join("collage.jpg")),
            gif: None,
            clip: Some(ClipArtifact {
                path: dir.path().join(&id).join("timelapse.mp4"),
                source: ClipSource::Synthesized,
                upgrade_scheduled: true,
            }),
        };
        sink.on_artifacts_ready(&id, &artifacts).unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_id"], id);
        assert_eq!(lines[0]["best"]["label"], "person");
        assert_eq!(lines[1]["type"], "artifacts");
        assert_eq!(lines[1]["clip_source"], "synthesized");
        assert!(lines[1]["gif"].is_null());
    }
}
