//! Per-camera frame source with a dedicated reader thread
//!
//! The reader continuously overwrites a single latest-frame slot (a `watch`
//! channel). Consumers always see the newest frame; frames they were too slow
//! to look at are simply skipped.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::decoder::{CodecHint, ReleaseHandle, StreamDecoder};
use crate::error::CaptureError;
use crate::frame::Frame;

/// Longest pause between full probe cycles of an unreachable stream
const MAX_REOPEN_BACKOFF: Duration = Duration::from_secs(30);

/// Reader connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Connecting,
    Streaming,
    Reconnecting,
    /// Every codec hint failed; the reader keeps retrying with backoff
    Unavailable,
    Stopped,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Connecting => "connecting",
            SourceState::Streaming => "streaming",
            SourceState::Reconnecting => "reconnecting",
            SourceState::Unavailable => "unavailable",
            SourceState::Stopped => "stopped",
        }
    }
}

/// First codec hint that worked, per camera.
#[derive(Clone, Default)]
pub struct CodecMemory {
    inner: Arc<Mutex<HashMap<String, CodecHint>>>,
}

impl CodecMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, camera_id: &str) -> Option<CodecHint> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(camera_id).copied()
    }

    pub fn remember(&self, camera_id: &str, hint: CodecHint) {
        let previous = self.inner.lock().unwrap_or_else(|e| e.into_inner())
            .insert(camera_id.to_string(), hint);
        if previous != Some(hint) {
            info!(camera_id = %camera_id, codec = hint.as_str(), "remembered working codec");
        }
    }

    pub fn forget(&self, camera_id: &str) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(camera_id);
    }

    /// Hints to try, remembered codec first
    pub fn probe_order(&self, camera_id: &str) -> Vec<CodecHint> {
        let mut order = CodecHint::ALL.to_vec();
        if let Some(known) = self.get(camera_id) {
            order.retain(|h| *h != known);
            order.insert(0, known);
        }
        order
    }
}

/// Frame source configuration
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub camera_id: String,
    pub url: String,
    /// Consecutive read failures before the stream is reopened
    pub failure_threshold: u32,
    /// Pause between in-place read retries and failed opens
    pub retry_delay: Duration,
    /// A frame older than this is reported stale
    pub stale_after: Duration,
}

impl SourceConfig {
    pub fn new(camera_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            url: url.into(),
            failure_threshold: 3,
            retry_delay: Duration::from_millis(500),
            stale_after: Duration::from_secs(5),
        }
    }
}

/// Live frame source for one camera
pub struct FrameSource {
    camera_id: String,
    stop: Arc<AtomicBool>,
    frames: watch::Receiver<Option<Frame>>,
    state: watch::Receiver<SourceState>,
    reader: Option<JoinHandle<()>>,
    release: ReleaseHandle,
    last_seen: Option<DateTime<Utc>>,
    stale_after: Duration,
}

impl FrameSource {
    /// Start the reader thread for a camera.
    ///
    /// Connection failures are not errors here; they surface as state changes
    /// while the reader keeps retrying.
    pub fn open<D: StreamDecoder>(config: SourceConfig, decoder: D, codecs: CodecMemory) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(SourceState::Connecting);
        let stop = Arc::new(AtomicBool::new(false));
        let release = decoder.release_handle();

        let camera_id = config.camera_id.clone();
        let stale_after = config.stale_after;
        let reader = Reader {
            config,
            decoder,
            codecs,
            stop: stop.clone(),
            frames: frame_tx,
            state: state_tx,
        };

        let handle = thread::Builder::new()
            .name(format!("reader-{}", camera_id))
            .spawn(move || reader.run())?;

        Ok(Self {
            camera_id,
            stop,
            frames: frame_rx,
            state: state_rx,
            reader: Some(handle),
            release,
            last_seen: None,
            stale_after,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Newest frame not yet returned, or `None` when the slot holds nothing
    /// new or only a frame older than the staleness bound.
    pub fn read_latest(&mut self) -> Option<Frame> {
        let frame = self.frames.borrow_and_update().clone()?;
        if self.last_seen.is_some_and(|seen| frame.timestamp <= seen) {
            return None;
        }
        let age = (Utc::now() - frame.timestamp).to_std().unwrap_or(Duration::ZERO);
        if age > self.stale_after {
            return None;
        }
        self.last_seen = Some(frame.timestamp);
        Some(frame)
    }

    /// Wait up to `timeout` for a frame newer than the last one returned
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        if let Some(frame) = self.read_latest() {
            return Some(frame);
        }
        match tokio::time::timeout(timeout, self.frames.changed()).await {
            Ok(Ok(())) => self.read_latest(),
            _ => None,
        }
    }

    /// Current reader state
    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    /// Receiver for reader state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SourceState> {
        self.state.clone()
    }

    /// Timestamp of the newest frame the reader has published
    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.frames.borrow().as_ref().map(|f| f.timestamp)
    }

    /// Stop the reader and wait up to `timeout` for it to exit.
    ///
    /// If the reader is still blocked after the timeout, the decoder is
    /// forcibly released so its pending read fails. Returns `true` when the
    /// reader exited on its own.
    pub fn close(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);

        let Some(handle) = self.reader.take() else {
            return true;
        };

        if join_with_timeout(&handle, timeout) {
            let _ = handle.join();
            return true;
        }

        warn!(camera_id = %self.camera_id, "reader did not stop in {:?}, releasing stream", timeout);
        self.release.release();

        if join_with_timeout(&handle, Duration::from_secs(2)) {
            let _ = handle.join();
        } else {
            warn!(camera_id = %self.camera_id, "reader thread still blocked, detaching");
        }
        false
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.stop.store(true, Ordering::SeqCst);
            self.release.release();
        }
    }
}

fn join_with_timeout(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

/// State owned by the reader thread
struct Reader<D> {
    config: SourceConfig,
    decoder: D,
    codecs: CodecMemory,
    stop: Arc<AtomicBool>,
    frames: watch::Sender<Option<Frame>>,
    state: watch::Sender<SourceState>,
}

impl<D: StreamDecoder> Reader<D> {
    fn run(mut self) {
        let camera_id = self.config.camera_id.clone();
        info!(camera_id = %camera_id, "reader started");

        let mut probe = self.codecs.probe_order(&camera_id);
        let mut probe_index = 0usize;
        let mut current: Option<CodecHint> = None;
        let mut confirmed = false;
        let mut ever_streamed = false;
        let mut failures = 0u32;
        let mut backoff = self.config.retry_delay;

        while !self.stopped() {
            let Some(hint) = current else {
                let hint = probe[probe_index % probe.len()];
                self.set_state(if ever_streamed { SourceState::Reconnecting } else { SourceState::Connecting });

                match self.decoder.open(&self.config.url, hint) {
                    Ok(()) => {
                        debug!(camera_id = %camera_id, codec = hint.as_str(), "stream opened");
                        current = Some(hint);
                        confirmed = false;
                    }
                    Err(e) => {
                        warn!(camera_id = %camera_id, codec = hint.as_str(), "open failed: {}", e);
                        probe_index += 1;
                        if probe_index % probe.len() == 0 {
                            self.set_state(SourceState::Unavailable);
                            self.pause(backoff);
                            backoff = (backoff * 2).min(MAX_REOPEN_BACKOFF);
                        } else {
                            self.pause(self.config.retry_delay);
                        }
                    }
                }
                continue;
            };

            match self.decoder.read_frame() {
                Ok(image) => {
                    failures = 0;
                    if !confirmed {
                        confirmed = true;
                        ever_streamed = true;
                        backoff = self.config.retry_delay;
                        self.codecs.remember(&camera_id, hint);
                        self.set_state(SourceState::Streaming);
                    }
                    let frame = Frame::from_image(camera_id.as_str(), Utc::now(), image);
                    self.frames.send_replace(Some(frame));
                }
                Err(e) => {
                    if self.stopped() {
                        break;
                    }
                    failures += 1;
                    debug!(camera_id = %camera_id, "read failed ({}/{}): {}", failures, self.config.failure_threshold, e);

                    if failures >= self.config.failure_threshold {
                        warn!(camera_id = %camera_id, "too many read failures, reopening stream");
                        self.decoder.release();
                        failures = 0;
                        current = None;
                        if confirmed {
                            // Worked before; start over from the remembered codec
                            probe = self.codecs.probe_order(&camera_id);
                            probe_index = 0;
                        } else {
                            probe_index += 1;
                            if probe_index % probe.len() == 0 {
                                self.set_state(SourceState::Unavailable);
                                self.pause(backoff);
                                backoff = (backoff * 2).min(MAX_REOPEN_BACKOFF);
                            }
                        }
                    } else {
                        self.pause(self.config.retry_delay);
                    }
                }
            }
        }

        self.decoder.release();
        self.set_state(SourceState::Stopped);
        info!(camera_id = %camera_id, "reader stopped");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SourceState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Sleep in short slices so a stop request is noticed quickly
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}
