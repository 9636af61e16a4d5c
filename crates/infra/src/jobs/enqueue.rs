//! Scheduling and cancelling reminder jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use payremind_core::{Clock, PayableId};
use payremind_payables::{PayableAccessor, ScheduledReminder};

use super::config::ReminderConfig;
use super::store::{ScheduleStore, StoreError};
use super::types::{JobId, PayloadError, ReminderPayload};

/// Enqueue error.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("reminder offset must not be negative: {0} days")]
    NegativeOffset(i64),
    #[error("reminder offset of {0} days puts the reminder out of range")]
    OffsetOutOfRange(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Writes reminder jobs for payables.
///
/// Each reminder touches three stores (index, payload, job set) without a
/// transaction; the garbage collector and idempotent processing absorb
/// partial writes.
pub struct Enqueuer<S: ScheduleStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    mirror: Option<Arc<dyn PayableAccessor>>,
}

impl<S: ScheduleStore> Enqueuer<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: ReminderConfig) -> Self {
        Self {
            store,
            clock,
            config,
            mirror: None,
        }
    }

    /// Also mirror scheduled jobs onto the payable record.
    pub fn with_mirror(mut self, accessor: Arc<dyn PayableAccessor>) -> Self {
        self.mirror = Some(accessor);
        self
    }

    /// Schedule one reminder per offset, `offset_days` before `due_date`.
    ///
    /// Offsets are de-duplicated and handled in ascending order. Reminders
    /// whose due instant is not in the future are skipped. Re-enqueueing an
    /// existing reminder leaves its index entry alone and only refreshes the
    /// payload TTL. Returns the ids of every scheduled or refreshed job.
    #[instrument(skip_all, fields(payable_id = %payable_id))]
    pub fn enqueue(
        &self,
        payable_id: PayableId,
        due_date: DateTime<Utc>,
        offsets: &[i64],
    ) -> Result<Vec<JobId>, EnqueueError> {
        if let Some(bad) = offsets.iter().copied().find(|o| *o < 0) {
            return Err(EnqueueError::NegativeOffset(bad));
        }

        let mut offsets = offsets.to_vec();
        offsets.sort_unstable();
        offsets.dedup();
        let reminders = offsets
            .into_iter()
            .map(|offset_days| {
                chrono::Duration::try_days(offset_days)
                    .and_then(|d| due_date.checked_sub_signed(d))
                    .map(|at| (offset_days, at))
                    .ok_or(EnqueueError::OffsetOutOfRange(offset_days))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let now = self.clock.now_ts();
        let mut scheduled = Vec::with_capacity(reminders.len());
        let mut mirror = Vec::with_capacity(reminders.len());

        for (offset_days, remind_at) in reminders {
            let due_at = remind_at.timestamp();
            if due_at <= now {
                info!(offset_days, due_at, "reminder time already passed, skipping");
                continue;
            }

            let payload = ReminderPayload::new(payable_id, offset_days, due_at);
            let job_id = payload.job_id.clone();

            if self.store.index_insert(&job_id, due_at, true)? {
                let ttl = self.config.payload_ttl(due_at, now);
                self.store.payload_put(&job_id, &payload.encode()?, ttl)?;
                self.store.entity_add(payable_id, &job_id)?;
                debug!(job_id = %job_id, due_at, ttl, "reminder scheduled");
            } else {
                self.refresh(&job_id, payload, now)?;
            }

            mirror.push(ScheduledReminder {
                offset_days,
                due_at: remind_at,
                job_id: job_id.to_string(),
            });
            scheduled.push(job_id);
        }

        if !mirror.is_empty() {
            if let Some(accessor) = &self.mirror {
                if let Err(e) = accessor.record_schedule(payable_id, &mirror) {
                    warn!(error = %e, "failed to mirror schedule onto payable");
                }
            }
        }

        Ok(scheduled)
    }

    /// Remove every job scheduled for a payable. Returns how many were removed.
    #[instrument(skip_all, fields(payable_id = %payable_id))]
    pub fn cancel(&self, payable_id: PayableId) -> Result<usize, StoreError> {
        let members = self.store.entity_members(payable_id)?;
        self.store.purge(&members)?;
        self.store.entity_clear(payable_id)?;

        if !members.is_empty() {
            if let Some(accessor) = &self.mirror {
                let ids: Vec<String> = members.iter().map(JobId::to_string).collect();
                if let Err(e) = accessor.forget_scheduled(payable_id, &ids) {
                    warn!(error = %e, "failed to clear mirrored schedule");
                }
            }
        }

        info!(removed = members.len(), "reminders cancelled");
        Ok(members.len())
    }

    /// The job already sits in the index: keep its score, rewrite the payload
    /// with a fresh TTL and preserve its attempt count.
    fn refresh(
        &self,
        job_id: &JobId,
        fresh: ReminderPayload,
        now: i64,
    ) -> Result<(), EnqueueError> {
        let due_at = self.store.index_score(job_id)?.unwrap_or(fresh.due_at);
        let payload = match self.store.payload_get(job_id)? {
            Some(raw) => match ReminderPayload::decode(&raw) {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "replacing malformed payload");
                    fresh
                }
            },
            None => fresh,
        };

        let ttl = self.config.payload_ttl(due_at, now);
        self.store.payload_put(job_id, &payload.encode()?, ttl)?;
        self.store.entity_add(payload.payable_id, job_id)?;
        debug!(job_id = %job_id, due_at, ttl, attempts = payload.attempts, "reminder refreshed");
        Ok(())
    }
}
