//! Status coalescing
//!
//! Reader state can flap quickly during reconnects. The sink sees at most
//! one update per `min_interval`, always the latest state, and nothing when
//! the state settles back to what was last reported. While the state holds,
//! an advancing last-frame time is refreshed at the same rate.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use vigil_capture::SourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: SourceState,
    pub last_frame: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct StatusCoalescer {
    min_interval: Duration,
    last_sent: Option<(Instant, StatusUpdate)>,
    pending: Option<StatusUpdate>,
}

impl StatusCoalescer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
            pending: None,
        }
    }

    /// Offer an observed state; returns the update to send now, if any
    pub fn offer(&mut self, update: StatusUpdate, now: Instant) -> Option<StatusUpdate> {
        if let Some((at, sent)) = self.last_sent {
            if sent.state == update.state {
                self.pending = None;
                let refresh = update.last_frame != sent.last_frame && now.duration_since(at) >= self.min_interval;
                return if refresh { self.emit(update, now) } else { None };
            }
        }

        match self.last_sent {
            Some((at, _)) if now.duration_since(at) < self.min_interval => {
                self.pending = Some(update);
                None
            }
            _ => self.emit(update, now),
        }
    }

    /// Release a held-back update once the interval has passed
    pub fn flush(&mut self, now: Instant) -> Option<StatusUpdate> {
        let pending = self.pending?;
        match self.last_sent {
            Some((at, _)) if now.duration_since(at) < self.min_interval => None,
            _ => self.emit(pending, now),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn emit(&mut self, update: StatusUpdate, now: Instant) -> Option<StatusUpdate> {
        self.last_sent = Some((now, update));
        self.pending = None;
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(state: SourceState) -> StatusUpdate {
        StatusUpdate { state, last_frame: None }
    }

    #[test]
    fn test_flapping_is_coalesced() {
        let mut c = StatusCoalescer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let at = |s: u64| t0 + Duration::from_secs(s);

        assert_eq!(c.offer(update(SourceState::Connecting), at(0)), Some(update(SourceState::Connecting)));
        assert_eq!(c.offer(update(SourceState::Streaming), at(1)), None);
        assert_eq!(c.offer(update(SourceState::Reconnecting), at(2)), None);
        assert_eq!(c.flush(at(3)), None);
        assert_eq!(c.flush(at(5)), Some(update(SourceState::Reconnecting)));
        assert!(!c.has_pending());
    }

    #[test]
    fn test_settling_back_drops_pending() {
        let mut c = StatusCoalescer::new(Duration::from_secs(5));
        let t0 = Instant::now();

        c.offer(update(SourceState::Streaming), t0);
        assert_eq!(c.offer(update(SourceState::Reconnecting), t0 + Duration::from_secs(1)), None);
        assert!(c.has_pending());
        assert_eq!(c.offer(update(SourceState::Streaming), t0 + Duration::from_secs(2)), None);
        assert!(!c.has_pending());
        assert_eq!(c.flush(t0 + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_change_after_interval_sends_immediately() {
        let mut c = StatusCoalescer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        c.offer(update(SourceState::Streaming), t0);
        assert_eq!(
            c.offer(update(SourceState::Unavailable), t0 + Duration::from_secs(6)),
            Some(update(SourceState::Unavailable))
        );
        // Same state with nothing new is never re-sent
        assert_eq!(c.offer(update(SourceState::Unavailable), t0 + Duration::from_secs(20)), None);
    }

    #[test]
    fn test_last_frame_refreshed_at_interval() {
        let mut c = StatusCoalescer::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let frame_at = |s: i64| Some(Utc::now() + chrono::Duration::seconds(s));
        let streaming = |last_frame| StatusUpdate { state: SourceState::Streaming, last_frame };

        let first = streaming(frame_at(0));
        assert_eq!(c.offer(first, t0), Some(first));
        assert_eq!(c.offer(streaming(frame_at(2)), t0 + Duration::from_secs(2)), None);
        assert!(!c.has_pending());

        let later = streaming(frame_at(6));
        assert_eq!(c.offer(later, t0 + Duration::from_secs(6)), Some(later));
        // Stalled stream: the timestamp stopped advancing
        assert_eq!(c.offer(later, t0 + Duration::from_secs(20)), None);
    }
}
