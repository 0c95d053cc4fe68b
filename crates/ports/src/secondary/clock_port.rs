/// Monotonic time source for the engine.
///
/// State creation times, expiry deadlines and source-node thresholds are all
/// expressed in whole seconds on this clock. The origin is arbitrary but the
/// value must never go backwards.
pub trait ClockPort: Send + Sync {
    fn now_secs(&self) -> u64;
}
