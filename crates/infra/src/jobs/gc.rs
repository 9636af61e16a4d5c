//! Reclaiming stale jobs.
//!
//! A job whose due instant lies more than the grace window in the past was
//! either lost by a crashed worker or only partially written. The sweep pops
//! such entries with the same atomic pop-due used by workers, so it never
//! races a worker for an entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use payremind_core::{Clock, PayableId};
use payremind_payables::PayableAccessor;

use super::config::ReminderConfig;
use super::store::{ScheduleStore, StoreError};
use super::types::JobId;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GcReport {
    /// Index entries reclaimed
    pub examined: usize,
    /// Of those, how many still had a stored payload
    pub pruned: usize,
    /// Entries due at or before this instant were eligible
    pub cutoff: i64,
}

pub struct GarbageCollector<S: ScheduleStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: ReminderConfig,
    mirror: Option<Arc<dyn PayableAccessor>>,
}

impl<S: ScheduleStore> GarbageCollector<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: ReminderConfig) -> Self {
        Self {
            store,
            clock,
            config,
            mirror: None,
        }
    }

    /// Also drop mirrored schedule entries of reclaimed jobs.
    pub fn with_mirror(mut self, accessor: Arc<dyn PayableAccessor>) -> Self {
        self.mirror = Some(accessor);
        self
    }

    /// Reclaim up to `gc_batch_size` jobs due before `now - grace_window`,
    /// oldest first.
    pub fn sweep(&self) -> Result<GcReport, StoreError> {
        let grace = i64::try_from(self.config.grace_window.as_secs()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ts().saturating_sub(grace);

        let stale = self
            .store
            .index_pop_due(cutoff, self.config.gc_batch_size)?;
        if stale.is_empty() {
            return Ok(GcReport {
                cutoff,
                ..GcReport::default()
            });
        }

        let mut pruned = 0;
        let mut by_payable: BTreeMap<PayableId, Vec<String>> = BTreeMap::new();
        let job_ids: Vec<JobId> = stale.into_iter().map(|e| e.job_id).collect();
        for job_id in &job_ids {
            if self.store.payload_delete(job_id)? {
                pruned += 1;
            }
            match job_id.payable_id() {
                Some(pid) => by_payable.entry(pid).or_default().push(job_id.to_string()),
                None => warn!(job_id = %job_id, "reclaimed job with unrecognised id"),
            }
        }
        self.store.purge(&job_ids)?;

        if let Some(accessor) = &self.mirror {
            for (pid, ids) in &by_payable {
                if let Err(e) = accessor.forget_scheduled(*pid, ids) {
                    debug!(payable_id = %pid, error = %e, "failed to clear mirrored schedule");
                }
            }
        }

        let report = GcReport {
            examined: job_ids.len(),
            pruned,
            cutoff,
        };
        info!(
            examined = report.examined,
            pruned = report.pruned,
            cutoff,
            "stale reminder jobs reclaimed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::jobs::store::InMemoryScheduleStore;
    use payremind_core::ManualClock;

    const T0: i64 = 1_700_000_000;

    fn seed(store: &InMemoryScheduleStore, due_at: i64) -> JobId {
        let pid = PayableId::new();
        let id = JobId::for_reminder(pid, 1, due_at);
        store.index_insert(&id, due_at, true).unwrap();
        store.payload_put(&id, "{}", 100_000).unwrap();
        store.entity_add(pid, &id).unwrap();
        id
    }

    fn setup(
        batch: usize,
    ) -> (
        Arc<InMemoryScheduleStore>,
        GarbageCollector<Arc<InMemoryScheduleStore>>,
    ) {
        let clock = Arc::new(ManualClock::at_ts(T0));
        let store = InMemoryScheduleStore::arc(clock.clone());
        let gc = GarbageCollector::new(
            store.clone(),
            clock,
            ReminderConfig::default().with_gc(Duration::from_secs(60), batch),
        );
        (store, gc)
    }

    #[test]
    fn reclaims_only_entries_older_than_grace() {
        let (store, gc) = setup(2000);
        let stale = seed(&store, T0 - 3601);
        let edge = seed(&store, T0 - 3600);
        let recent = seed(&store, T0 - 10);

        let report = gc.sweep().unwrap();

        assert_eq!(report.cutoff, T0 - 3600);
        assert_eq!(report.examined, 2);
        assert_eq!(report.pruned, 2);
        for id in [&stale, &edge] {
            assert!(store.index_score(id).unwrap().is_none());
            assert!(!store.has_payload(id));
            assert!(store.entity_members(id.payable_id().unwrap()).unwrap().is_empty());
        }
        assert_eq!(store.index_score(&recent).unwrap(), Some(T0 - 10));
        assert!(store.has_payload(&recent));
    }

    #[test]
    fn sweep_is_bounded_by_batch_size() {
        let (store, gc) = setup(3);
        for i in 0..5 {
            seed(&store, T0 - 10_000 - i);
        }

        assert_eq!(gc.sweep().unwrap().examined, 3);
        assert_eq!(gc.sweep().unwrap().examined, 2);
        assert_eq!(
            gc.sweep().unwrap(),
            GcReport {
                examined: 0,
                pruned: 0,
                cutoff: T0 - 3600
            }
        );
    }

    #[test]
    fn entries_without_payload_are_still_reclaimed() {
        let (store, gc) = setup(2000);
        let id = seed(&store, T0 - 7200);
        store.payload_delete(&id).unwrap();

        let report = gc.sweep().unwrap();
        assert_eq!((report.examined, report.pruned), (1, 0));
        assert_eq!(store.index_len(), 0);
    }
}
