use std::sync::atomic::{AtomicI64, Ordering};

use crate::Microseconds;

/// Bounds the rate of diagnostic output (log lines, unsolicited replies) under
/// a flood of bad packets.
///
/// A single timestamp compare-and-swap: the first caller inside each interval
/// wins, everyone else is told to stay quiet. Losing a race counts as being
/// throttled, which is exactly what we want under a flood.
pub struct ReplyLimiter {
    last: AtomicI64,
    interval: Microseconds,
}

impl ReplyLimiter {
    pub fn new(interval: Microseconds) -> Self {
        Self {
            last: AtomicI64::new(i64::MIN / 2),
            interval,
        }
    }

    /// Returns whether the caller may emit its reply/log line at `now`
    pub fn allow(&self, now: Microseconds) -> bool {
        let last = self.last.load(Ordering::Relaxed);
        if last + self.interval > now {
            return false;
        }
        self.last
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
