//! State deadline computation with adaptive scaling.
//!
//! Between the adaptive start and end watermarks the timeout shrinks
//! linearly with the number of states; at the end watermark states expire
//! immediately.

use super::entity::{State, StateInner, TimeoutClass, Timeouts};

/// Adaptive watermarks and the state count they are compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adaptive {
    pub start: u64,
    pub end: u64,
    pub states: u64,
}

impl Adaptive {
    /// Watermarks that apply to `state`: explicit per-rule values, values
    /// derived from the rule's `max-states` (60% and 120%), or the globals.
    pub fn for_state(state: &State, timeouts: &Timeouts, table_states: usize) -> Self {
        let rule = &state.rule;
        let rule_states = rule.counters.states();
        if rule.timeouts.adaptive_start > 0 {
            return Self {
                start: u64::from(rule.timeouts.adaptive_start),
                end: u64::from(rule.timeouts.adaptive_end),
                states: rule_states,
            };
        }
        if rule.max_states > 0 {
            let max = u64::from(rule.max_states);
            return Self {
                start: max * 6 / 10,
                end: max * 12 / 10,
                states: rule_states,
            };
        }
        Self {
            start: u64::from(timeouts.adaptive_start),
            end: u64::from(timeouts.adaptive_end),
            states: table_states as u64,
        }
    }

    /// Scale `timeout`. `None` means "already expired".
    pub fn scale(self, timeout: u64) -> Option<u64> {
        if self.end > 0 && self.states > self.start && self.start < self.end {
            if self.states >= self.end {
                return None;
            }
            let scaled = u128::from(timeout) * u128::from(self.end - self.states)
                / u128::from(self.end - self.start);
            // Never above `timeout`, so it fits back.
            return Some(u64::try_from(scaled).unwrap_or(timeout));
        }
        Some(timeout)
    }
}

/// Base timeout for `class`: the rule override, else the global value.
pub fn base_timeout(state: &State, class: TimeoutClass, timeouts: &Timeouts) -> u32 {
    match state.rule.timeouts.get(class) {
        0 => timeouts.get(class),
        t => t,
    }
}

/// Uptime at which the state expires; 0 when it must go now.
pub fn deadline(state: &State, inner: &StateInner, timeouts: &Timeouts, table_states: usize) -> u64 {
    if inner.timeout == TimeoutClass::Purge {
        return 0;
    }
    let timeout = u64::from(base_timeout(state, inner.timeout, timeouts));
    Adaptive::for_state(state, timeouts, table_states)
        .scale(timeout)
        .map_or(0, |t| inner.expire.saturating_add(t))
}

/// Seconds left before expiry, as exported in snapshots.
pub fn remaining(
    state: &State,
    inner: &StateInner,
    timeouts: &Timeouts,
    table_states: usize,
    now: u64,
) -> u64 {
    deadline(state, inner, timeouts, table_states).saturating_sub(now)
}
