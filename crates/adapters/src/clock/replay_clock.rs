use std::sync::atomic::{AtomicU64, Ordering};

use ports::secondary::clock_port::ClockPort;

/// Clock driven by the timestamps of a recorded trace.
///
/// Time only moves forward: an out-of-order record leaves the clock where
/// it is.
#[derive(Debug)]
pub struct ReplayClock {
    now: AtomicU64,
}

impl ReplayClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start.max(1)),
        }
    }

    /// Move to `secs` if that is later than the current time. Returns the
    /// time after the call.
    pub fn advance_to(&self, secs: u64) -> u64 {
        let prev = self.now.fetch_max(secs, Ordering::SeqCst);
        prev.max(secs)
    }
}

impl ClockPort for ReplayClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
