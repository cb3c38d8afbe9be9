//! Failure classification and retry scheduling.
//!
//! Bounded exponential backoff with full jitter. Attempts are counted at
//! claim time, so the policy only decides what happens after a failure:
//! wait and go again, or stop and dead-letter.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

use crate::error::UnitError;

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection resets, deadlocks, timeouts, storage 5xx. Retryable.
    Transient,
    /// Bad arguments, authorization failures, storage 4xx. Not retryable.
    Permanent,
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt_at: DateTime<Utc> },
    Dlq,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(config: &crate::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    pub fn classify(&self, error: &UnitError) -> ErrorClass {
        match error {
            // A store hiccup mid-execution says nothing about the unit itself.
            UnitError::Store(_) => ErrorClass::Transient,
            UnitError::Source(source) => source.class(),
            UnitError::Storage(storage) => classify_storage(storage),
            // Lease loss is handled before classification; a stray one is not
            // retryable by this worker.
            UnitError::LeaseLost => ErrorClass::Permanent,
        }
    }

    /// Full jitter: `delay = uniform(0, min(cap, base * 2^(attempt-1)))`.
    pub fn next_attempt_at(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = attempt_count.saturating_sub(1).min(32);
        let raw = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        let delay_ms = if raw == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=raw)
        };
        now + ChronoDuration::milliseconds(delay_ms as i64)
    }

    /// `attempt_count` is the attempt that just failed (incremented on claim).
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::Dlq,
            ErrorClass::Transient if attempt_count < self.max_attempts => RetryDecision::Retry {
                next_attempt_at: self.next_attempt_at(attempt_count, now),
            },
            ErrorClass::Transient => RetryDecision::Dlq,
        }
    }
}

fn classify_storage(error: &object_store::Error) -> ErrorClass {
    use object_store::Error;
    match error {
        Error::NotFound { .. }
        | Error::InvalidPath { .. }
        | Error::NotSupported { .. }
        | Error::AlreadyExists { .. }
        | Error::Precondition { .. }
        | Error::NotImplemented
        | Error::PermissionDenied { .. }
        | Error::Unauthenticated { .. }
        | Error::UnknownConfigurationKey { .. } => ErrorClass::Permanent,
        // Generic covers 5xx, throttling and transport failures.
        _ => ErrorClass::Transient,
    }
}
