//! Frame scheduler
//!
//! Edge-triggered: any number of requests between two frames collapse into
//! one pending frame. Frames are paced to at most one per interval.

use std::time::{Duration, Instant};

/// Roughly one display refresh
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug)]
pub struct FrameScheduler {
    interval: Duration,
    pending: bool,
    last_frame: Option<Instant>,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

impl FrameScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: false,
            last_frame: None,
        }
    }

    /// Request a frame; false when one was already pending
    pub fn request(&mut self) -> bool {
        !std::mem::replace(&mut self.pending, true)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Drop the pending frame, if any
    pub fn cancel(&mut self) {
        self.pending = false;
    }

    /// Consume the pending frame if it is due at `now`
    pub fn take_due(&mut self, now: Instant) -> bool {
        if !self.pending {
            return false;
        }
        if let Some(last) = self.last_frame {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.pending = false;
        self.last_frame = Some(now);
        true
    }

    /// Time left before a pending frame becomes due
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        if !self.pending {
            return None;
        }
        Some(match self.last_frame {
            Some(last) => self
                .interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_coalesce() {
        let mut s = FrameScheduler::default();
        assert!(s.request());
        assert!(!s.request());
        assert!(!s.request());
        assert!(s.take_due(Instant::now()));
        assert!(!s.take_due(Instant::now()));
    }

    #[test]
    fn test_cancel_drops_pending_frame() {
        let mut s = FrameScheduler::default();
        s.request();
        s.cancel();
        assert!(!s.is_pending());
        assert!(!s.take_due(Instant::now()));
        assert!(s.request());
    }

    #[test]
    fn test_frames_are_paced() {
        let mut s = FrameScheduler::new(Duration::from_millis(10));
        let t0 = Instant::now();
        s.request();
        assert_eq!(s.time_until_due(t0), Some(Duration::ZERO));
        assert!(s.take_due(t0));

        s.request();
        assert!(!s.take_due(t0 + Duration::from_millis(4)));
        assert_eq!(
            s.time_until_due(t0 + Duration::from_millis(4)),
            Some(Duration::from_millis(6))
        );
        assert!(s.take_due(t0 + Duration::from_millis(10)));
        assert_eq!(s.time_until_due(t0), None);
    }
}
