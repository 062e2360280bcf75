//! Event debounce state machine
//!
//! `Idle -> Candidate -> Confirmed -> Cooldown -> Idle`. A candidate episode
//! must survive filtering on every sampled frame for `min_event_duration`
//! before it is confirmed; after a confirmation the camera cools down for
//! `cooldown` regardless of ongoing activity.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use crate::inference::{best_detection, Detection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub min_event_duration: Duration,
    pub cooldown: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            min_event_duration: Duration::from_secs(2),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Candidate,
    Cooldown,
}

/// A confirmed event, emitted exactly once per episode
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedEvent {
    pub episode_start: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    /// Highest-confidence detection seen during the episode
    pub best: Detection,
    /// Surviving detections of the confirming frame
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebounceOutcome {
    Idle,
    /// Episode running since `since`, not yet long enough
    Candidate { since: DateTime<Utc> },
    /// A candidate episode was discarded
    Reset,
    Confirmed(ConfirmedEvent),
    CoolingDown { until: DateTime<Utc> },
}

#[derive(Debug, Clone)]
enum Inner {
    Idle,
    Candidate {
        episode_start: DateTime<Utc>,
        best: Detection,
    },
    Cooldown {
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventDebouncer {
    config: DebounceConfig,
    inner: Inner,
    last_confirmed: Option<DateTime<Utc>>,
}

impl EventDebouncer {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            inner: Inner::Idle,
            last_confirmed: None,
        }
    }

    pub fn set_config(&mut self, config: DebounceConfig) {
        self.config = config;
    }

    pub fn state(&self) -> DebounceState {
        match self.inner {
            Inner::Idle => DebounceState::Idle,
            Inner::Candidate { .. } => DebounceState::Candidate,
            Inner::Cooldown { .. } => DebounceState::Cooldown,
        }
    }

    pub fn last_confirmed(&self) -> Option<DateTime<Utc>> {
        self.last_confirmed
    }

    /// Start of the running candidate episode, if any
    pub fn episode_start(&self) -> Option<DateTime<Utc>> {
        match &self.inner {
            Inner::Candidate { episode_start, .. } => Some(*episode_start),
            _ => None,
        }
    }

    /// Drop a running candidate episode; cooldown is kept
    pub fn reset(&mut self) {
        if matches!(self.inner, Inner::Candidate { .. }) {
            self.inner = Inner::Idle;
        }
    }

    /// Feed one sampled frame's surviving detections
    pub fn observe(&mut self, now: DateTime<Utc>, survivors: &[Detection]) -> DebounceOutcome {
        if let Inner::Cooldown { until } = self.inner {
            if now < until {
                return DebounceOutcome::CoolingDown { until };
            }
            debug!("cooldown elapsed");
            self.inner = Inner::Idle;
        }

        let Some(frame_best) = best_detection(survivors) else {
            return match self.inner {
                Inner::Candidate { .. } => {
                    self.inner = Inner::Idle;
                    DebounceOutcome::Reset
                }
                _ => DebounceOutcome::Idle,
            };
        };

        let (episode_start, best) = match &self.inner {
            Inner::Candidate { episode_start, best } => {
                let best = if frame_best.confidence > best.confidence { frame_best.clone() } else { best.clone() };
                (*episode_start, best)
            }
            _ => (now, frame_best.clone()),
        };

        let lasted = (now - episode_start).to_std().unwrap_or(Duration::ZERO);
        if lasted >= self.config.min_event_duration && self.cooldown_elapsed(now) {
            self.last_confirmed = Some(now);
            self.inner = Inner::Cooldown {
                until: now + to_chrono(self.config.cooldown),
            };
            return DebounceOutcome::Confirmed(ConfirmedEvent {
                episode_start,
                confirmed_at: now,
                best,
                detections: survivors.to_vec(),
            });
        }

        self.inner = Inner::Candidate { episode_start, best };
        DebounceOutcome::Candidate { since: episode_start }
    }

    fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_confirmed {
            None => true,
            Some(last) => (now - last).to_std().map(|d| d >= self.config.cooldown).unwrap_or(false),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
