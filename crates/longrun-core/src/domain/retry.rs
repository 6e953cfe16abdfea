//! Retry policy: how many times, how long to wait, and which failures qualify.

use std::collections::BTreeSet;
use std::time::Duration;

use super::outcome::{FailureKind, WorkflowFailure};

/// Delay growth between retries.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Every retry waits `initial_delay`.
    Fixed,

    /// delay = initial_delay * multiplier^(attempt - 1), optionally capped.
    Exponential {
        multiplier: f64,
        max_delay: Option<Duration>,
    },
}

/// Retry policy applied around workflow execution.
///
/// `max_retries` counts re-invocations, so a task runs at most
/// `max_retries + 1` times per execution. Pauses are never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff: Backoff,

    /// `None` means every failure kind is retryable.
    pub retryable_kinds: Option<BTreeSet<FailureKind>>,
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            backoff: Backoff::Fixed,
            retryable_kinds: None,
        }
    }

    pub fn exponential(max_retries: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff: Backoff::Exponential {
                multiplier,
                max_delay: None,
            },
            retryable_kinds: None,
        }
    }

    /// Cap exponential growth. No effect on a fixed schedule.
    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max_delay, .. } = &mut self.backoff {
            *max_delay = Some(cap);
        }
        self
    }

    /// Restrict retries to the given kind (call repeatedly to allow several).
    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retryable_kinds
            .get_or_insert_with(BTreeSet::new)
            .insert(FailureKind::new(kind));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn is_retryable(&self, failure: &WorkflowFailure) -> bool {
        match &self.retryable_kinds {
            None => true,
            Some(kinds) => kinds.contains(&failure.kind),
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = (self.initial_delay.as_secs_f64() * multiplier.powi(exponent)).max(0.0);
                let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
                match max_delay {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
