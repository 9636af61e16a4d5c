//! Rescheduling of failed reminder jobs.

use std::sync::Arc;

use tracing::{info, warn};

use payremind_core::Clock;

use super::config::ReminderConfig;
use super::store::{ScheduleStore, StoreError};
use super::types::ReminderPayload;

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Back in the index, due again at `due_at`.
    Requeued { attempts: u32, due_at: i64 },
    /// Retries exhausted; every trace of the job is gone.
    Dropped { attempts: u32 },
}

pub struct RetryScheduler<S: ScheduleStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
}

impl<S: ScheduleStore> RetryScheduler<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: ReminderConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Count one more failed attempt and either requeue or drop the job.
    pub fn schedule_retry(&self, mut payload: ReminderPayload) -> Result<RetryOutcome, StoreError> {
        payload.attempts = payload.attempts.saturating_add(1);
        let attempts = payload.attempts;
        let policy = &self.config.retry;

        if !policy.should_retry(attempts) {
            warn!(
                job_id = %payload.job_id,
                payable_id = %payload.payable_id,
                attempts,
                max_retries = policy.max_retries,
                "retries exhausted, dropping reminder"
            );
            self.store.purge(std::slice::from_ref(&payload.job_id))?;
            return Ok(RetryOutcome::Dropped { attempts });
        }

        let now = self.clock.now_ts();
        let delay =
            i64::try_from(policy.delay_for_attempt(attempts).as_secs()).unwrap_or(i64::MAX);
        let due_at = now.saturating_add(delay);
        payload.due_at = due_at;

        let ttl = self.config.payload_ttl(due_at, now);
        self.store.payload_put(&payload.job_id, &payload.encode()?, ttl)?;
        self.store.index_insert(&payload.job_id, due_at, false)?;

        info!(
            job_id = %payload.job_id,
            attempts,
            due_at,
            "reminder requeued"
        );
        Ok(RetryOutcome::Requeued { attempts, due_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::jobs::store::InMemoryScheduleStore;
    use crate::jobs::types::RetryPolicy;
    use payremind_core::{ManualClock, PayableId};

    const T0: i64 = 1_700_000_000;

    fn setup(
        policy: RetryPolicy,
    ) -> (
        Arc<InMemoryScheduleStore>,
        RetryScheduler<Arc<InMemoryScheduleStore>>,
    ) {
        let clock = Arc::new(ManualClock::at_ts(T0));
        let store = InMemoryScheduleStore::arc(clock.clone());
        let retries = RetryScheduler::new(
            store.clone(),
            clock,
            ReminderConfig::default().with_retry(policy),
        );
        (store, retries)
    }

    fn stored(store: &InMemoryScheduleStore, payload: &ReminderPayload) -> ReminderPayload {
        let raw = store.payload_get(&payload.job_id).unwrap().unwrap();
        ReminderPayload::decode(&raw).unwrap()
    }

    #[test]
    fn failure_requeues_after_fixed_delay() {
        let (store, retries) = setup(RetryPolicy::default());
        let payload = ReminderPayload::new(PayableId::new(), 1, T0);

        let outcome = retries.schedule_retry(payload.clone()).unwrap();

        assert_eq!(
            outcome,
            RetryOutcome::Requeued {
                attempts: 1,
                due_at: T0 + 300
            }
        );
        assert_eq!(store.index_score(&payload.job_id).unwrap(), Some(T0 + 300));
        assert_eq!(stored(&store, &payload).attempts, 1);
        assert_eq!(store.payload_ttl(&payload.job_id), Some(300 + 3600));
    }

    #[test]
    fn attempts_and_due_times_never_go_backwards() {
        let (store, retries) =
            setup(RetryPolicy::exponential(5, Duration::from_secs(60), Duration::from_secs(3600)));
        let mut payload = ReminderPayload::new(PayableId::new(), 1, T0);
        let mut last_due = T0;

        for expected in 1..=5 {
            match retries.schedule_retry(payload.clone()).unwrap() {
                RetryOutcome::Requeued { attempts, due_at } => {
                    assert_eq!(attempts, expected);
                    assert!(due_at >= last_due);
                    last_due = due_at;
                }
                other => panic!("unexpected {other:?}"),
            }
            payload = stored(&store, &payload);
        }
    }

    #[test]
    fn exhausted_retries_drop_the_job() {
        let (store, retries) = setup(RetryPolicy::fixed(2, Duration::from_secs(10)));
        let pid = PayableId::new();
        let mut payload = ReminderPayload::new(pid, 1, T0);
        store.entity_add(pid, &payload.job_id).unwrap();
        payload.attempts = 2;

        let outcome = retries.schedule_retry(payload.clone()).unwrap();

        assert_eq!(outcome, RetryOutcome::Dropped { attempts: 3 });
        assert!(store.index_score(&payload.job_id).unwrap().is_none());
        assert!(!store.has_payload(&payload.job_id));
        assert!(store.entity_members(pid).unwrap().is_empty());
    }
}
