//! Scheduler configuration.

use std::time::Duration;

use super::processor::DEFAULT_HELPER_LIMIT;
use super::types::{BackoffStrategy, RetryPolicy};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Reminder scheduler configuration.
///
/// Defaults match production: a 5 minute fixed retry delay with 12 retries,
/// one hour of grace after a job's due instant, batches of 50.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderConfig {
    pub retry: RetryPolicy,
    /// Time past its due instant before GC may reclaim a job
    pub grace_window: Duration,
    /// Lower bound for payload TTLs
    pub min_payload_ttl: Duration,
    /// Max entries popped per tick
    pub batch_size: usize,
    /// Sleep when the index is empty
    pub idle_sleep: Duration,
    /// Upper bound on any single sleep
    pub max_sleep: Duration,
    pub gc_interval: Duration,
    /// Max entries reclaimed per GC sweep
    pub gc_batch_size: usize,
    /// Processing longer than this counts as a failure
    pub processing_timeout: Duration,
    /// Processing threads that may still be running after timing out
    pub helper_thread_limit: usize,
    /// Sleep after a store failure in the loop
    pub error_backoff: Duration,
    pub key_prefix: String,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            grace_window: Duration::from_secs(3600),
            min_payload_ttl: Duration::from_secs(60),
            batch_size: 50,
            idle_sleep: Duration::from_secs(1),
            max_sleep: Duration::from_secs(5),
            gc_interval: Duration::from_secs(60),
            gc_batch_size: 2000,
            processing_timeout: Duration::from_secs(30),
            helper_thread_limit: DEFAULT_HELPER_LIMIT,
            error_backoff: Duration::from_secs(2),
            key_prefix: "sched:".to_string(),
            name: "reminder-worker".to_string(),
        }
    }
}

impl ReminderConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_gc(mut self, interval: Duration, batch_size: usize) -> Self {
        self.gc_interval = interval;
        self.gc_batch_size = batch_size;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_helper_thread_limit(mut self, limit: usize) -> Self {
        self.helper_thread_limit = limit;
        self
    }

    pub fn with_sleeps(mut self, idle: Duration, max: Duration) -> Self {
        self.idle_sleep = idle;
        self.max_sleep = max;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.gc_batch_size == 0 {
            return Err(ConfigError::Invalid("gc_batch_size must be positive".into()));
        }
        if self.helper_thread_limit == 0 {
            return Err(ConfigError::Invalid(
                "helper_thread_limit must be positive".into(),
            ));
        }
        if self.max_sleep.is_zero() {
            return Err(ConfigError::Invalid("max_sleep must be positive".into()));
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "processing_timeout must be positive".into(),
            ));
        }
        if self.retry.max_delay < self.retry.delay {
            return Err(ConfigError::Invalid(
                "retry max_delay must not be below the base delay".into(),
            ));
        }
        Ok(())
    }

    /// Payload TTL for a job due at `due_at`: `max((due_at - now) + grace, min_ttl)`.
    pub fn payload_ttl(&self, due_at: i64, now: i64) -> u64 {
        let grace = i64::try_from(self.grace_window.as_secs()).unwrap_or(i64::MAX);
        let min = self.min_payload_ttl.as_secs();
        let ttl = due_at.saturating_sub(now).saturating_add(grace);
        u64::try_from(ttl).unwrap_or(0).max(min)
    }

    /// Read `REMINDER_*` overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns.
    ///
    /// Durations are whole seconds. Recognised keys: `REMINDER_MAX_RETRIES`,
    /// `REMINDER_RETRY_DELAY_SECS`, `REMINDER_RETRY_MAX_DELAY_SECS`,
    /// `REMINDER_RETRY_STRATEGY`, `REMINDER_GRACE_SECS`, `REMINDER_MIN_TTL_SECS`,
    /// `REMINDER_BATCH_SIZE`, `REMINDER_IDLE_SLEEP_SECS`,
    /// `REMINDER_MAX_SLEEP_SECS`, `REMINDER_GC_INTERVAL_SECS`,
    /// `REMINDER_GC_BATCH_SIZE`, `REMINDER_PROCESSING_TIMEOUT_SECS`,
    /// `REMINDER_HELPER_THREAD_LIMIT`,
    /// `REMINDER_ERROR_BACKOFF_SECS`, `REMINDER_KEY_PREFIX`, `REMINDER_WORKER_NAME`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse::<u32>(&lookup, "REMINDER_MAX_RETRIES")? {
            config.retry.max_retries = n;
        }
        if let Some(raw) = lookup("REMINDER_RETRY_STRATEGY") {
            config.retry.strategy = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "REMINDER_RETRY_STRATEGY",
                value: raw.clone(),
                reason,
            })?;
        }
        if let Some(d) = secs(&lookup, "REMINDER_RETRY_DELAY_SECS")? {
            config.retry.delay = d;
            if config.retry.strategy == BackoffStrategy::Fixed || config.retry.max_delay < d {
                config.retry.max_delay = d;
            }
        }
        if let Some(d) = secs(&lookup, "REMINDER_RETRY_MAX_DELAY_SECS")? {
            config.retry.max_delay = d;
        }
        if let Some(d) = secs(&lookup, "REMINDER_GRACE_SECS")? {
            config.grace_window = d;
        }
        if let Some(d) = secs(&lookup, "REMINDER_MIN_TTL_SECS")? {
            config.min_payload_ttl = d;
        }
        if let Some(n) = parse::<usize>(&lookup, "REMINDER_BATCH_SIZE")? {
            config.batch_size = n;
        }
        if let Some(d) = secs(&lookup, "REMINDER_IDLE_SLEEP_SECS")? {
            config.idle_sleep = d;
        }
        if let Some(d) = secs(&lookup, "REMINDER_MAX_SLEEP_SECS")? {
            config.max_sleep = d;
        }
        if let Some(d) = secs(&lookup, "REMINDER_GC_INTERVAL_SECS")? {
            config.gc_interval = d;
        }
        if let Some(n) = parse::<usize>(&lookup, "REMINDER_GC_BATCH_SIZE")? {
            config.gc_batch_size = n;
        }
        if let Some(d) = secs(&lookup, "REMINDER_PROCESSING_TIMEOUT_SECS")? {
            config.processing_timeout = d;
        }
        if let Some(n) = parse::<usize>(&lookup, "REMINDER_HELPER_THREAD_LIMIT")? {
            config.helper_thread_limit = n;
        }
        if let Some(d) = secs(&lookup, "REMINDER_ERROR_BACKOFF_SECS")? {
            config.error_backoff = d;
        }
        if let Some(prefix) = lookup("REMINDER_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(name) = lookup("REMINDER_WORKER_NAME") {
            config.name = name;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_secs))
}
