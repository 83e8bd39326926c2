use std::time::Duration;

use crate::shared::config::ListenerConfig;
use crate::store::StoreError;

/// What the listener does after its subscription failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Expected disruption: resubscribe right away.
    Immediate,
    /// Unrecognized failure: wait, then resubscribe.
    After(Duration),
    /// Too many consecutive failures.
    Abort,
}

/// Error classification and sleep schedule for change-feed resubscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_consecutive_failures: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &ListenerConfig) -> Self {
        Self {
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
            delay: cfg.retry_delay(),
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState { consecutive: 0 }
    }

    pub fn decide(&self, state: &mut RetryState, err: &StoreError) -> RetryDecision {
        if err.is_transient() {
            state.reset();
            return RetryDecision::Immediate;
        }
        state.consecutive += 1;
        if state.consecutive >= self.max_consecutive_failures {
            RetryDecision::Abort
        } else {
            RetryDecision::After(self.delay)
        }
    }
}

/// Consecutive unrecognized failures seen by one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    consecutive: u32,
}

impl RetryState {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
