//! Engine configuration.
//!
//! One struct per concern, serde defaults matching the documented keys, and a
//! `validate` that rejects configurations the engine cannot run safely with.

use chrono::FixedOffset;
use serde::Deserialize;

/// Poller and lease tuning for one worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Max unit ids fetched per poll query.
    pub poll_batch_size: usize,
    /// Idle backoff between empty polls.
    pub poll_interval_ms: u64,
    /// Per-worker concurrency; the only admission control.
    pub max_in_flight: usize,
    /// Claim lease duration; renewal runs at half this.
    pub lease_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_batch_size: 32,
            poll_interval_ms: 1_000,
            max_in_flight: 4,
            lease_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Hard cap on attempts before a unit moves to DLQ.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReuseConfig {
    /// Master switch for artifact reuse.
    pub enabled: bool,
    /// Effective dates strictly older than `today - days` may be reused.
    pub days: u32,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    pub interval_ms: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_units_per_job: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_units_per_job: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Constant prefix under which every artifact lands.
    pub base_path: String,
    pub bucket: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: "exports".to_string(),
            bucket: String::new(),
        }
    }
}

/// Everything the engine needs, grouped by concern.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub reuse: ReuseConfig,
    pub finalizer: FinalizerConfig,
    pub submission: SubmissionConfig,
    pub storage: StorageConfig,
    /// Zone in which "today" is evaluated for the reuse window.
    /// `"UTC"` or a fixed offset such as `"+09:00"`.
    pub timezone: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid timezone {0:?}: expected \"UTC\" or a fixed offset like \"+09:00\"")]
    Timezone(String),
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_in_flight == 0 {
            return Err(ConfigError::Invalid("worker.max_in_flight must be > 0".into()));
        }
        if self.worker.poll_batch_size == 0 {
            return Err(ConfigError::Invalid("worker.poll_batch_size must be > 0".into()));
        }
        if self.worker.lease_seconds == 0 {
            return Err(ConfigError::Invalid("worker.lease_seconds must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.submission.max_units_per_job == 0 {
            return Err(ConfigError::Invalid(
                "submission.max_units_per_job must be > 0".into(),
            ));
        }
        self.timezone_offset()?;
        Ok(())
    }

    /// Parse the configured zone. Empty and `"UTC"` both mean UTC.
    pub fn timezone_offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_timezone(&self.timezone)
    }
}

fn parse_timezone(value: &str) -> Result<FixedOffset, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return Ok(FixedOffset::east_opt(0).expect("zero offset"));
    }

    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1i32, rest),
        Some(("-", rest)) => (-1i32, rest),
        _ => return Err(ConfigError::Timezone(value.to_string())),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => return Err(ConfigError::Timezone(value.to_string())),
    };
    let hours: i32 = hours
        .parse()
        .map_err(|_| ConfigError::Timezone(value.to_string()))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| ConfigError::Timezone(value.to_string()))?;
    if hours > 14 || minutes > 59 {
        return Err(ConfigError::Timezone(value.to_string()));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| ConfigError::Timezone(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn timezone_parses_utc_and_offsets() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+09:00").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(
            parse_timezone("-05:30").unwrap().local_minus_utc(),
            -(5 * 3600 + 30 * 60)
        );
        assert!(parse_timezone("tokyo").is_err());
        assert!(parse_timezone("+15:00").is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = EngineConfig::default();
        config.worker.max_in_flight = 0;
        assert!(config.validate().is_err());
    }
}
