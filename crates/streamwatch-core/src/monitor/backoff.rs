//! Exponential backoff policy and cancellable retry timers
//!
//! Delay for attempt `n` (0-based) is
//! `min(initial_delay * backoff_factor^n, max_delay)`. With the defaults
//! that is 1000ms, 1500ms, 2250ms, ... capped at 30000ms.
//!
//! Timers never call back into controller state directly. A fired timer
//! hands its token to a callback (normally a channel send), and the owner
//! accepts the fire only if the token is still the pending one. A timer
//! that was cancelled or superseded while its message was in flight is
//! therefore discarded instead of triggering a second retry.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default delay before the first retry
pub const INITIAL_RETRY_DELAY_MS: f64 = 1000.0;

/// Default multiplier applied per attempt
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Default upper bound for any single delay
pub const MAX_RETRY_DELAY_MS: f64 = 30000.0;

/// Largest delay a configured policy may ask for (one day)
pub const RETRY_DELAY_LIMIT_MS: f64 = 86_400_000.0;

/// Retry delay policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_delay_ms: f64,
    pub backoff_factor: f64,
    pub max_delay_ms: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: INITIAL_RETRY_DELAY_MS,
            backoff_factor: BACKOFF_FACTOR,
            max_delay_ms: MAX_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Check that delays start positive, never shrink and stay bounded
    pub fn validate(&self) -> Result<(), String> {
        let Self {
            initial_delay_ms,
            backoff_factor,
            max_delay_ms,
        } = *self;
        if !(initial_delay_ms.is_finite() && backoff_factor.is_finite() && max_delay_ms.is_finite()) {
            return Err("retry policy values must be finite".to_string());
        }
        if initial_delay_ms <= 0.0 {
            return Err(format!("initial_delay_ms must be positive, got {}", initial_delay_ms));
        }
        if backoff_factor < 1.0 {
            return Err(format!("backoff_factor must be at least 1, got {}", backoff_factor));
        }
        if max_delay_ms < initial_delay_ms || max_delay_ms > RETRY_DELAY_LIMIT_MS {
            return Err(format!(
                "max_delay_ms must be between initial_delay_ms and {}, got {}",
                RETRY_DELAY_LIMIT_MS, max_delay_ms
            ));
        }
        Ok(())
    }

    /// Delay in milliseconds for a 0-based attempt number
    pub fn delay_ms(&self, attempt: u32) -> f64 {
        let cap = self.max_delay_ms.min(RETRY_DELAY_LIMIT_MS);
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms * self.backoff_factor.powi(exponent);
        if delay.is_nan() {
            return cap.max(0.0);
        }
        delay.min(cap).max(0.0)
    }

    /// Delay for a 0-based attempt number
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::try_from_secs_f64(self.delay_ms(attempt) / 1000.0)
            .unwrap_or(Duration::from_secs_f64(MAX_RETRY_DELAY_MS / 1000.0))
    }
}

struct PendingFire {
    token: u64,
    due: Instant,
    task: JoinHandle<()>,
}

/// A single-shot delayed callback with at most one pending instance
#[derive(Default)]
pub struct DelayedFire {
    next_token: u64,
    pending: Option<PendingFire>,
}

impl DelayedFire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_fire` after `delay`, replacing any pending fire
    ///
    /// Must be called from within a tokio runtime. Returns the token the
    /// callback will receive.
    pub fn schedule<F>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.next_token += 1;
        let token = self.next_token;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(token);
        });
        self.pending = Some(PendingFire {
            token,
            due: Instant::now() + delay,
            task,
        });
        token
    }

    /// Cancel the pending fire. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fire. Returns false for a cancelled or superseded token.
    pub fn accept(&mut self, token: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.token == token => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Time left until the pending fire
    pub fn remaining(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .map(|p| p.due.saturating_duration_since(Instant::now()))
    }
}

impl Drop for DelayedFire {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Per-source retry bookkeeping: attempt counter plus the pending retry timer
#[derive(Default)]
pub struct RetryState {
    attempt: u32,
    timer: DelayedFire,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retry timers that have fired since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Schedule the next retry using the current attempt number
    ///
    /// Any pending retry is cancelled first. Returns the chosen delay.
    pub fn schedule<F>(&mut self, policy: &RetryPolicy, on_fire: F) -> Duration
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let delay = policy.delay_for(self.attempt);
        self.timer.schedule(delay, on_fire);
        delay
    }

    /// Consume a retry fire, counting it as an attempt when accepted
    pub fn accept_fire(&mut self, token: u64) -> bool {
        let accepted = self.timer.accept(token);
        if accepted {
            self.attempt = self.attempt.saturating_add(1);
        }
        accepted
    }

    pub fn cancel(&mut self) -> bool {
        self.timer.cancel()
    }

    pub fn reset_attempts(&mut self) {
        self.attempt = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.timer.remaining()
    }
}
