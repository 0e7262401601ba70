//! Retry bookkeeping for one sync target

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff progress of the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub is_retrying: bool,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl RetryState {
    /// Back to zero after a successful sync.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether the retry budget is spent.
    pub const fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_everything() {
        let mut state = RetryState {
            retry_count: 3,
            is_retrying: true,
            next_retry_at: Some(Utc::now()),
            last_error: Some("timeout".to_string()),
        };
        state.reset();
        assert_eq!(state, RetryState::default());
    }

    #[test]
    fn exhausted_at_max() {
        let state = RetryState {
            retry_count: 5,
            ..RetryState::default()
        };
        assert!(state.is_exhausted(5));
        assert!(!RetryState::default().is_exhausted(5));
    }
}
