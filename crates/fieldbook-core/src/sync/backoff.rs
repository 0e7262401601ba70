//! Retry delay computation and the cancelable retry timer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::RetryState;

const JITTER_MIN: f64 = 0.9;
const JITTER_MAX: f64 = 1.1;

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Failed cycles tolerated before sync turns fatal
    pub max_retries: u32,
    /// Delay before the first retry (ms)
    pub base_delay_ms: u64,
    /// Upper bound for any delay (ms)
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for `retry_count` with a fresh random jitter factor.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        compute_delay(self, retry_count, jitter)
    }
}

/// `min(base * multiplier^retry_count * jitter, max)`, rounded to whole milliseconds.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn compute_delay(config: &BackoffConfig, retry_count: u32, jitter: f64) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let raw = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent) * jitter;
    let capped = raw.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped.round() as u64)
}

/// A retry that has been armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedRetry {
    pub delay: Duration,
    pub next_retry_at: DateTime<Utc>,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owns at most one armed retry timer.
///
/// When a timer elapses its generation number is sent on the fire channel;
/// the receiver must call [`BackoffScheduler::acknowledge_fire`] so stale
/// firings (from a timer cancelled after it already sent) are ignored.
pub struct BackoffScheduler {
    config: BackoffConfig,
    fire_tx: mpsc::UnboundedSender<u64>,
    timer: Option<ArmedTimer>,
    generation: u64,
}

impl BackoffScheduler {
    pub const fn new(config: BackoffConfig, fire_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            config,
            fire_tx,
            timer: None,
            generation: 0,
        }
    }

    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub const fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Arm a retry computed from the current `retry_count`.
    ///
    /// No-op when retries are exhausted or the device is offline. Any timer
    /// already armed is replaced. Never touches `retry_count`.
    pub fn schedule_next(&mut self, state: &mut RetryState, online: bool) -> Option<ArmedRetry> {
        if state.is_exhausted(self.config.max_retries) {
            tracing::debug!(
                retry_count = state.retry_count,
                "Retry budget exhausted, not arming timer"
            );
            self.cancel(state);
            return None;
        }
        if !online {
            tracing::debug!("Offline, deferring retry timer");
            self.cancel(state);
            return None;
        }

        let delay = self.config.delay_for(state.retry_count);
        let armed = self.arm(delay);
        state.is_retrying = true;
        state.next_retry_at = Some(armed.next_retry_at);
        tracing::debug!(
            retry_count = state.retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Armed retry timer"
        );
        Some(armed)
    }

    fn arm(&mut self, delay: Duration) -> ArmedRetry {
        if let Some(previous) = self.timer.take() {
            previous.handle.abort();
        }

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let fire_tx = self.fire_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fire_tx.send(generation);
        });
        self.timer = Some(ArmedTimer { generation, handle });

        let offset = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        ArmedRetry {
            delay,
            next_retry_at: Utc::now() + offset,
            generation,
        }
    }

    /// Abort the armed timer, if any. Returns whether one was armed.
    pub fn cancel(&mut self, state: &mut RetryState) -> bool {
        state.is_retrying = false;
        state.next_retry_at = None;
        self.timer.take().is_some_and(|timer| {
            timer.handle.abort();
            true
        })
    }

    /// Accept a firing if it belongs to the currently armed timer.
    pub fn acknowledge_fire(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                self.timer = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for BackoffScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}
