//! Retransmission timing
//!
//! A single tick source runs at a fixed 100 ms granularity while at least one
//! request is outstanding. Each outstanding request keeps its own [`Backoff`]
//! counter that converts ticks into resend or give-up decisions.

use std::time::{Duration, Instant};

/// Tick granularity
pub const TICK: Duration = Duration::from_millis(100);

/// Total transmissions per request (initial send plus retransmits)
pub const MAX_TRANSMISSIONS: u32 = 9;

/// Upper bound on the wait between transmissions, in ticks
const MAX_TIMEOUT_TICKS: u32 = 16;

/// Monotonic next-tick deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct RetransmitTimer {
    next_tick: Option<Instant>,
}

impl RetransmitTimer {
    /// Create a disarmed timer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer so the first tick fires one granule after `now`
    pub fn arm(&mut self, now: Instant) {
        self.next_tick = Some(now + TICK);
    }

    /// Stop ticking
    pub fn disarm(&mut self) {
        self.next_tick = None;
    }

    /// Next tick deadline, if armed
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Consume every tick that has elapsed by `now` and return how many
    ///
    /// A late wakeup yields several ticks at once; the next deadline stays on
    /// the original 100 ms grid.
    pub fn expired_ticks(&mut self, now: Instant) -> u32 {
        let Some(mut deadline) = self.next_tick else {
            return 0;
        };

        let mut ticks = 0;
        while deadline <= now {
            ticks += 1;
            deadline += TICK;
        }
        self.next_tick = Some(deadline);
        ticks
    }
}

/// Outcome of a single tick for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep waiting
    Wait,
    /// Timeout elapsed, send the request again
    Retransmit,
    /// Retransmission budget exhausted
    Exhausted,
}

/// Exponential backoff state for one outstanding request
///
/// Waits between transmissions are 100, 200, 400, 800 and then 1600 ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    retrans_count: u32,
    elapsed_ticks: u32,
}

impl Backoff {
    /// Fresh backoff for a request that has just been sent once
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retransmission timeouts observed so far
    #[must_use]
    pub fn retrans_count(&self) -> u32 {
        self.retrans_count
    }

    /// Current wait in ticks before the next timeout
    #[must_use]
    pub fn timeout_ticks(&self) -> u32 {
        1u32.checked_shl(self.retrans_count)
            .unwrap_or(MAX_TIMEOUT_TICKS)
            .min(MAX_TIMEOUT_TICKS)
    }

    /// Advance by one tick
    pub fn tick(&mut self) -> TickOutcome {
        self.elapsed_ticks += 1;
        if self.elapsed_ticks < self.timeout_ticks() {
            return TickOutcome::Wait;
        }

        self.retrans_count += 1;
        self.elapsed_ticks = 0;
        if self.retrans_count < MAX_TRANSMISSIONS {
            TickOutcome::Retransmit
        } else {
            TickOutcome::Exhausted
        }
    }
}
