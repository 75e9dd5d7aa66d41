//! Bounded linear-backoff reconnect policy

use serde::Serialize;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Reconnect bookkeeping exposed to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectState {
    /// Failures since the last successful connection
    pub attempt: u32,
    /// Delay before the next (or currently scheduled) rebuild
    pub next_delay_ms: u64,
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Rebuild the stack after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Budget spent; the controller is done
    Exhausted { attempts: u32 },
}

/// Counts consecutive failures and computes `delay = base_delay * attempt`
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            attempt: 0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn state(&self) -> ReconnectState {
        ReconnectState {
            attempt: self.attempt,
            next_delay_ms: self.delay_for(self.attempt.max(1)),
        }
    }

    fn delay_for(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(attempt as u64)
    }

    /// Record one failure and decide what happens next
    pub fn record_failure(&mut self) -> ReconnectDecision {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.max_attempts,
            };
        }
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay: Duration::from_millis(self.delay_for(self.attempt)),
        }
    }

    /// Called on every successful `connected` transition
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
