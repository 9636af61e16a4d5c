//! Reminder job types and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use payremind_core::PayableId;

/// Deterministic job identifier.
///
/// Derived from `(payable_id, offset_days, due_at)` as
/// `payable:{payable_id}:off:{offset_days}:at:{due_at}`, so scheduling the
/// same reminder twice yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Components encoded in a [`JobId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobParts {
    pub payable_id: PayableId,
    pub offset_days: i64,
    pub due_at: i64,
}

impl JobId {
    pub fn for_reminder(payable_id: PayableId, offset_days: i64, due_at: i64) -> Self {
        Self(format!("payable:{payable_id}:off:{offset_days}:at:{due_at}"))
    }

    /// Wrap a raw identifier read back from a store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parts(&self) -> Result<JobParts, PayloadError> {
        let malformed = || PayloadError::MalformedJobId(self.0.clone());
        let mut it = self.0.split(':');
        match (it.next(), it.next(), it.next(), it.next(), it.next(), it.next(), it.next()) {
            (Some("payable"), Some(pid), Some("off"), Some(off), Some("at"), Some(at), None) => {
                Ok(JobParts {
                    payable_id: pid.parse().map_err(|_| malformed())?,
                    offset_days: off.parse().map_err(|_| malformed())?,
                    due_at: at.parse().map_err(|_| malformed())?,
                })
            }
            _ => Err(malformed()),
        }
    }

    /// The payable this job belongs to, if the id is well-formed.
    pub fn payable_id(&self) -> Option<PayableId> {
        self.parts().ok().map(|p| p.payable_id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload (de)serialization error.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed job id: {0}")]
    MalformedJobId(String),
    #[error("payload for {job_id} names payable {payable_id}")]
    Mismatch { job_id: JobId, payable_id: PayableId },
}

/// What is stored under `job:{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReminderPayload {
    pub job_id: JobId,
    pub payable_id: PayableId,
    pub offset_days: i64,
    /// Current due instant (epoch seconds); moves forward on retry.
    pub due_at: i64,
    pub attempts: u32,
}

impl ReminderPayload {
    pub fn new(payable_id: PayableId, offset_days: i64, due_at: i64) -> Self {
        Self {
            job_id: JobId::for_reminder(payable_id, offset_days, due_at),
            payable_id,
            offset_days,
            due_at,
            attempts: 0,
        }
    }

    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and check the payload agrees with its own job id.
    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_str(raw)?;
        let parts = payload.job_id.parts()?;
        if parts.payable_id != payload.payable_id || parts.offset_days != payload.offset_days {
            return Err(PayloadError::Mismatch {
                job_id: payload.job_id,
                payable_id: payload.payable_id,
            });
        }
        Ok(payload)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// base * 2^(attempt - 1)
    Exponential,
    /// base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry policy for failed reminder jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts beyond this count are dropped
    pub max_retries: u32,
    /// Base delay between retries
    pub delay: Duration,
    /// Cap for growing strategies
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(12, Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failure number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.strategy {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.delay.saturating_mul(factor).min(self.max_delay)
            }
            BackoffStrategy::Linear => self.delay.saturating_mul(attempt).min(self.max_delay),
        }
    }

    /// Whether a job that has now failed `attempts` times is retried.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}
