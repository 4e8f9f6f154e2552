//! Sliding-window per-resource quota tracker.
//!
//! Mirrors the original `quota_tracker`: a bounded-duration window of
//! timestamped events, summed on every check. There is no background
//! pruning — stale events accumulate until the caller happens to prune them
//! (this implementation never does, matching the source, since event counts
//! stay small for realistic request rates and durations).

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A single quota resource: uploads, downloads, or requests.
struct Inner {
    max_amount: u64,
    duration_secs: u64,
    events: VecDeque<(u64, u64)>,
}

/// Sliding-window quota tracker for one resource of one user.
pub struct QuotaTracker {
    inner: Mutex<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

impl QuotaTracker {
    /// Construct a tracker allowing at most `max_amount` total within any
    /// `duration_secs`-second window.
    pub fn new(max_amount: u64, duration_secs: u64) -> Self {
        Self {
            inner: Mutex::new(Inner { max_amount, duration_secs, events: VecDeque::new() }),
        }
    }

    /// `true` iff adding `amount` would keep the sum of amounts within the
    /// trailing `duration_secs`-second window at or below `max_amount`. Does
    /// not record the event; call [`QuotaTracker::add`] separately once the
    /// associated operation actually succeeds.
    pub fn check(&self, amount: u64) -> bool {
        let inner = self.inner.lock();
        let now = now_secs();
        let windowed: u64 = inner
            .events
            .iter()
            .filter(|(t, _)| now.saturating_sub(*t) < inner.duration_secs)
            .map(|(_, a)| *a)
            .sum();
        windowed + amount <= inner.max_amount
    }

    /// Record that `amount` was consumed right now.
    pub fn add(&self, amount: u64) {
        let mut inner = self.inner.lock();
        let now = now_secs();
        inner.events.push_back((now, amount));
    }
}
