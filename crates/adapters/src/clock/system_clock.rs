use std::time::Instant;

use ports::secondary::clock_port::ClockPort;

/// Monotonic clock counting whole seconds since the agent started.
///
/// Starts at 1 so that a zero timestamp never names a real instant.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockPort for SystemClock {
    fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs() + 1
    }
}
