// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Randomised exponential backoff for broker reconnects.
//!
//! The base delay for attempt `n` is `first × 2^n` clamped to `max`; the
//! returned delay is drawn uniformly from the upper half of that base so
//! a fleet of clients restarting together does not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Default delay before the first connect attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default ceiling for reconnect delays.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Backoff {
    first: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(first: Duration, max: Duration) -> Self {
        Self { first, max, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Base delay for the current attempt, before jitter.
    pub fn base(&self) -> Duration {
        let exp = self.attempt.min(31);
        let secs = self.first.as_secs_f64() * 2f64.powi(exp as i32);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base();
        self.attempt = self.attempt.saturating_add(1);

        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        if spread == 0 {
            return base;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Return to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
