//! Idle-time watchdog

use std::time::Duration;

/// Exit code reported when the watchdog fires
pub const IDLE_TIMEOUT_EXIT_CODE: i32 = 10;

/// Accumulates idle time between received messages
#[derive(Debug, Clone)]
pub struct Watchdog {
    max_idle: Duration,
    idle: Duration,
    armed: bool,
}

impl Watchdog {
    /// A disarmed watchdog; idle ticks are ignored until [`Watchdog::arm`]
    pub fn new(max_idle: Duration) -> Self {
        Self {
            max_idle,
            idle: Duration::ZERO,
            armed: false,
        }
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    /// Idle time accumulated since the last reset
    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// Traffic arrived
    pub fn reset(&mut self) {
        self.idle = Duration::ZERO;
    }

    /// A poll iteration passed with no traffic
    pub fn tick(&mut self, elapsed: Duration) {
        if self.armed {
            self.idle = self.idle.saturating_add(elapsed);
        }
    }

    pub fn expired(&self) -> bool {
        self.armed && self.idle >= self.max_idle
    }

    /// Idle time left before expiry
    pub fn remaining(&self) -> Duration {
        self.max_idle.saturating_sub(self.idle)
    }
}
