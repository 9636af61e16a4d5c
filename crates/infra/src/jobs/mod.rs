//! Delayed payable reminders.
//!
//! ## Design
//!
//! - Jobs live in three stores: a time index ordered by due instant, a
//!   payload store with TTLs, and a per-payable job set
//! - Job ids are derived from `(payable, offset, due instant)`, so scheduling
//!   the same reminder twice is a no-op
//! - Workers claim jobs with an atomic pop restricted to due entries
//! - Delivery is at least once; a reminder record on the payable suppresses
//!   duplicate notifications
//! - Failures are retried with a fixed delay by default, then dropped
//! - A periodic sweep reclaims jobs stuck past their due instant
//!
//! ## Components
//!
//! - `Enqueuer`: schedules and cancels reminders
//! - `ReminderWorker`: polling loop with timeout-bounded processing
//! - `ReminderProcessor`: decides, notifies and records
//! - `RetryScheduler`: requeues or drops failed jobs
//! - `GarbageCollector`: reclaims stale jobs
//! - `Inspector`: read-only views for operators
//! - `ScheduleStore`: in-memory or Redis (feature `redis`) backends

pub mod config;
pub mod enqueue;
pub mod executor;
pub mod gc;
pub mod inspect;
pub mod processor;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod retry;
pub mod store;
pub mod types;

pub use config::{ConfigError, ReminderConfig};
pub use enqueue::{EnqueueError, Enqueuer};
pub use executor::{
    JobFate, JobReport, ReminderWorker, ReminderWorkerHandle, Tick, TickReport, WorkerStats,
};
pub use gc::{GarbageCollector, GcReport};
pub use inspect::{Inspector, PayableView, ScheduledJobView};
pub use processor::{DiscardReason, ProcessError, ProcessOutcome, ReminderProcessor};
#[cfg(feature = "redis")]
pub use redis_store::{KeySpace, RedisScheduleStore};
pub use retry::{RetryOutcome, RetryScheduler};
pub use store::{InMemoryScheduleStore, IndexEntry, ScheduleStore, StoreError};
pub use types::{BackoffStrategy, JobId, JobParts, PayloadError, ReminderPayload, RetryPolicy};
