//! Schedule storage: time index, payload store and per-payable job sets.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use payremind_core::{Clock, PayableId};

use super::types::JobId;

/// One time-index entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct IndexEntry {
    pub due_at: i64,
    pub job_id: JobId,
}

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
    #[error("payload serialization error: {0}")]
    Serialization(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<super::types::PayloadError> for StoreError {
    fn from(e: super::types::PayloadError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// The three stores the scheduler works against.
///
/// Operations are individually atomic; nothing is transactional across calls.
/// `index_pop_due` is the only operation concurrent workers coordinate on and
/// must never hand the same entry to two callers.
pub trait ScheduleStore: Send + Sync {
    /// Insert or move an index entry. With `only_if_absent`, an existing entry
    /// is left untouched. Returns whether a new entry was created.
    fn index_insert(
        &self,
        job_id: &JobId,
        due_at: i64,
        only_if_absent: bool,
    ) -> Result<bool, StoreError>;

    fn index_score(&self, job_id: &JobId) -> Result<Option<i64>, StoreError>;

    /// Smallest entry, without removing it.
    fn index_peek_min(&self) -> Result<Option<IndexEntry>, StoreError>;

    /// Atomically remove and return up to `limit` smallest entries with
    /// `due_at <= max_due`.
    fn index_pop_due(&self, max_due: i64, limit: usize) -> Result<Vec<IndexEntry>, StoreError>;

    /// Entries with `min <= due_at <= max` (open bounds when `None`), smallest first.
    fn index_range(
        &self,
        min: Option<i64>,
        max: Option<i64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError>;

    fn index_remove(&self, job_id: &JobId) -> Result<bool, StoreError>;

    /// Write a payload that expires after `ttl_secs`.
    fn payload_put(&self, job_id: &JobId, payload: &str, ttl_secs: u64)
    -> Result<(), StoreError>;

    fn payload_get(&self, job_id: &JobId) -> Result<Option<String>, StoreError>;

    fn payload_delete(&self, job_id: &JobId) -> Result<bool, StoreError>;

    fn entity_add(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError>;

    fn entity_remove(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError>;

    fn entity_members(&self, payable_id: PayableId) -> Result<Vec<JobId>, StoreError>;

    fn entity_clear(&self, payable_id: PayableId) -> Result<(), StoreError>;

    /// Remove every trace of the given jobs: index entry, payload and the
    /// link in the owning payable's job set (located through the job id).
    fn purge(&self, job_ids: &[JobId]) -> Result<(), StoreError>;
}

impl<S> ScheduleStore for Arc<S>
where
    S: ScheduleStore + ?Sized,
{
    fn index_insert(
        &self,
        job_id: &JobId,
        due_at: i64,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        (**self).index_insert(job_id, due_at, only_if_absent)
    }

    fn index_score(&self, job_id: &JobId) -> Result<Option<i64>, StoreError> {
        (**self).index_score(job_id)
    }

    fn index_peek_min(&self) -> Result<Option<IndexEntry>, StoreError> {
        (**self).index_peek_min()
    }

    fn index_pop_due(&self, max_due: i64, limit: usize) -> Result<Vec<IndexEntry>, StoreError> {
        (**self).index_pop_due(max_due, limit)
    }

    fn index_range(
        &self,
        min: Option<i64>,
        max: Option<i64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        (**self).index_range(min, max, limit)
    }

    fn index_remove(&self, job_id: &JobId) -> Result<bool, StoreError> {
        (**self).index_remove(job_id)
    }

    fn payload_put(
        &self,
        job_id: &JobId,
        payload: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        (**self).payload_put(job_id, payload, ttl_secs)
    }

    fn payload_get(&self, job_id: &JobId) -> Result<Option<String>, StoreError> {
        (**self).payload_get(job_id)
    }

    fn payload_delete(&self, job_id: &JobId) -> Result<bool, StoreError> {
        (**self).payload_delete(job_id)
    }

    fn entity_add(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        (**self).entity_add(payable_id, job_id)
    }

    fn entity_remove(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        (**self).entity_remove(payable_id, job_id)
    }

    fn entity_members(&self, payable_id: PayableId) -> Result<Vec<JobId>, StoreError> {
        (**self).entity_members(payable_id)
    }

    fn entity_clear(&self, payable_id: PayableId) -> Result<(), StoreError> {
        (**self).entity_clear(payable_id)
    }

    fn purge(&self, job_ids: &[JobId]) -> Result<(), StoreError> {
        (**self).purge(job_ids)
    }
}

#[derive(Debug, Clone)]
struct StoredPayload {
    value: String,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    index: BTreeSet<IndexEntry>,
    scores: HashMap<JobId, i64>,
    payloads: HashMap<JobId, StoredPayload>,
    entity_sets: HashMap<PayableId, BTreeSet<JobId>>,
    failing_peeks: u32,
    failing_payload_reads: u32,
}

impl Inner {
    fn remove_from_index(&mut self, job_id: &JobId) -> bool {
        match self.scores.remove(job_id) {
            Some(due_at) => self.index.remove(&IndexEntry {
                due_at,
                job_id: job_id.clone(),
            }),
            None => false,
        }
    }

    fn remove_from_entity_set(&mut self, payable_id: PayableId, job_id: &JobId) {
        if let Some(set) = self.entity_sets.get_mut(&payable_id) {
            set.remove(job_id);
            if set.is_empty() {
                self.entity_sets.remove(&payable_id);
            }
        }
    }
}

/// In-memory schedule store for tests/dev.
///
/// Payload TTLs are checked lazily against the injected clock, so tests can
/// expire payloads by advancing a [`payremind_core::ManualClock`]. Peeks and
/// payload reads can be made to fail a number of times to simulate an
/// unhealthy backend.
#[derive(Debug)]
pub struct InMemoryScheduleStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryScheduleStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Number of live index entries.
    pub fn index_len(&self) -> usize {
        self.lock().map(|i| i.index.len()).unwrap_or(0)
    }

    /// Whether a payload is stored and not yet expired.
    pub fn has_payload(&self, job_id: &JobId) -> bool {
        let now = self.clock.now_ts();
        self.lock()
            .map(|i| i.payloads.get(job_id).is_some_and(|p| p.expires_at > now))
            .unwrap_or(false)
    }

    /// Make the next `n` index peeks fail with [`StoreError::Connection`].
    pub fn fail_next_peeks(&self, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_peeks = n;
        }
    }

    /// Make the next `n` payload reads fail with [`StoreError::Command`].
    pub fn fail_payload_reads(&self, n: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.failing_payload_reads = n;
        }
    }

    /// Seconds until the payload expires, if present.
    pub fn payload_ttl(&self, job_id: &JobId) -> Option<i64> {
        let now = self.clock.now_ts();
        let inner = self.lock().ok()?;
        inner
            .payloads
            .get(job_id)
            .map(|p| p.expires_at - now)
            .filter(|ttl| *ttl > 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn index_insert(
        &self,
        job_id: &JobId,
        due_at: i64,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let existed = inner.scores.contains_key(job_id);
        if existed && only_if_absent {
            return Ok(false);
        }
        inner.remove_from_index(job_id);
        inner.scores.insert(job_id.clone(), due_at);
        inner.index.insert(IndexEntry {
            due_at,
            job_id: job_id.clone(),
        });
        Ok(!existed)
    }

    fn index_score(&self, job_id: &JobId) -> Result<Option<i64>, StoreError> {
        Ok(self.lock()?.scores.get(job_id).copied())
    }

    fn index_peek_min(&self) -> Result<Option<IndexEntry>, StoreError> {
        let mut inner = self.lock()?;
        if inner.failing_peeks > 0 {
            inner.failing_peeks -= 1;
            return Err(StoreError::Connection("simulated outage".to_string()));
        }
        Ok(inner.index.first().cloned())
    }

    fn index_pop_due(&self, max_due: i64, limit: usize) -> Result<Vec<IndexEntry>, StoreError> {
        let mut inner = self.lock()?;
        let mut popped = Vec::new();
        while popped.len() < limit {
            match inner.index.first() {
                Some(entry) if entry.due_at <= max_due => {}
                _ => break,
            }
            if let Some(entry) = inner.index.pop_first() {
                inner.scores.remove(&entry.job_id);
                popped.push(entry);
            }
        }
        Ok(popped)
    }

    fn index_range(
        &self,
        min: Option<i64>,
        max: Option<i64>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .index
            .iter()
            .skip_while(|e| min.is_some_and(|m| e.due_at < m))
            .take_while(|e| max.is_none_or(|m| e.due_at <= m))
            .take(limit)
            .cloned()
            .collect())
    }

    fn index_remove(&self, job_id: &JobId) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove_from_index(job_id))
    }

    fn payload_put(
        &self,
        job_id: &JobId,
        payload: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let expires_at = self
            .clock
            .now_ts()
            .saturating_add(i64::try_from(ttl_secs).unwrap_or(i64::MAX));
        self.lock()?.payloads.insert(
            job_id.clone(),
            StoredPayload {
                value: payload.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn payload_get(&self, job_id: &JobId) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ts();
        let mut inner = self.lock()?;
        if inner.failing_payload_reads > 0 {
            inner.failing_payload_reads -= 1;
            return Err(StoreError::Command("simulated read failure".to_string()));
        }
        match inner.payloads.get(job_id) {
            Some(p) if p.expires_at > now => Ok(Some(p.value.clone())),
            Some(_) => {
                inner.payloads.remove(job_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn payload_delete(&self, job_id: &JobId) -> Result<bool, StoreError> {
        Ok(self.lock()?.payloads.remove(job_id).is_some())
    }

    fn entity_add(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        self.lock()?
            .entity_sets
            .entry(payable_id)
            .or_default()
            .insert(job_id.clone());
        Ok(())
    }

    fn entity_remove(&self, payable_id: PayableId, job_id: &JobId) -> Result<(), StoreError> {
        self.lock()?.remove_from_entity_set(payable_id, job_id);
        Ok(())
    }

    fn entity_members(&self, payable_id: PayableId) -> Result<Vec<JobId>, StoreError> {
        Ok(self
            .lock()?
            .entity_sets
            .get(&payable_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn entity_clear(&self, payable_id: PayableId) -> Result<(), StoreError> {
        self.lock()?.entity_sets.remove(&payable_id);
        Ok(())
    }

    fn purge(&self, job_ids: &[JobId]) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for job_id in job_ids {
            inner.remove_from_index(job_id);
            inner.payloads.remove(job_id);
            if let Some(pid) = job_id.payable_id() {
                inner.remove_from_entity_set(pid, job_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payremind_core::ManualClock;
    use proptest::prelude::*;

    const T0: i64 = 1_700_000_000;

    fn store() -> (Arc<ManualClock>, InMemoryScheduleStore) {
        let clock = Arc::new(ManualClock::at_ts(T0));
        let store = InMemoryScheduleStore::new(clock.clone());
        (clock, store)
    }

    fn job(offset: i64, due_at: i64) -> (PayableId, JobId) {
        let pid = PayableId::new();
        (pid, JobId::for_reminder(pid, offset, due_at))
    }

    #[test]
    fn insert_if_absent_keeps_existing_score() {
        let (_, store) = store();
        let (_, id) = job(1, T0 + 100);

        assert!(store.index_insert(&id, T0 + 100, true).unwrap());
        assert!(!store.index_insert(&id, T0 + 50, true).unwrap());
        assert_eq!(store.index_score(&id).unwrap(), Some(T0 + 100));

        // plain insert moves it, still one entry
        store.index_insert(&id, T0 + 500, false).unwrap();
        assert_eq!(store.index_score(&id).unwrap(), Some(T0 + 500));
        assert_eq!(store.index_len(), 1);
    }

    #[test]
    fn peek_returns_smallest_without_removing() {
        let (_, store) = store();
        let (_, late) = job(1, T0 + 100);
        let (_, early) = job(2, T0 + 10);
        store.index_insert(&late, T0 + 100, true).unwrap();
        store.index_insert(&early, T0 + 10, true).unwrap();

        let min = store.index_peek_min().unwrap().unwrap();
        assert_eq!(min.job_id, early);
        assert_eq!(store.index_len(), 2);
    }

    #[test]
    fn pop_due_only_takes_due_entries_up_to_limit() {
        let (_, store) = store();
        let ids: Vec<JobId> = (0..4)
            .map(|i| {
                let (_, id) = job(i, T0 + i);
                store.index_insert(&id, T0 + i, true).unwrap();
                id
            })
            .collect();

        let popped = store.index_pop_due(T0 + 2, 2).unwrap();
        assert_eq!(
            popped.iter().map(|e| e.job_id.clone()).collect::<Vec<_>>(),
            vec![ids[0].clone(), ids[1].clone()]
        );

        let popped = store.index_pop_due(T0 + 2, 10).unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].job_id, ids[2]);

        assert!(store.index_pop_due(T0 + 2, 10).unwrap().is_empty());
        assert_eq!(store.index_len(), 1);
    }

    #[test]
    fn range_respects_bounds() {
        let (_, store) = store();
        for i in 0..5 {
            let (_, id) = job(i, T0 + i * 10);
            store.index_insert(&id, T0 + i * 10, true).unwrap();
        }

        let rows = store.index_range(Some(T0 + 10), Some(T0 + 30), 100).unwrap();
        assert_eq!(
            rows.iter().map(|e| e.due_at).collect::<Vec<_>>(),
            vec![T0 + 10, T0 + 20, T0 + 30]
        );
        assert_eq!(store.index_range(None, None, 2).unwrap().len(), 2);
        assert_eq!(store.index_range(None, Some(T0 - 1), 10).unwrap().len(), 0);
    }

    #[test]
    fn payload_expires_after_ttl() {
        let (clock, store) = store();
        let (_, id) = job(1, T0 + 100);
        store.payload_put(&id, "{}", 60).unwrap();

        clock.advance_secs(59);
        assert_eq!(store.payload_get(&id).unwrap().as_deref(), Some("{}"));
        assert_eq!(store.payload_ttl(&id), Some(1));

        clock.advance_secs(1);
        assert!(store.payload_get(&id).unwrap().is_none());
    }

    #[test]
    fn purge_clears_index_payload_and_entity_link() {
        let (_, store) = store();
        let (pid, id) = job(1, T0 + 100);
        let other = JobId::for_reminder(pid, 2, T0 + 50);

        for j in [&id, &other] {
            store.payload_put(j, "{}", 600).unwrap();
            store.index_insert(j, T0 + 100, true).unwrap();
            store.entity_add(pid, j).unwrap();
        }

        store.purge(std::slice::from_ref(&id)).unwrap();

        assert!(store.index_score(&id).unwrap().is_none());
        assert!(!store.has_payload(&id));
        assert_eq!(store.entity_members(pid).unwrap(), vec![other.clone()]);
        assert!(store.has_payload(&other));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: pop-due never hands out an entry that is not yet due,
        /// and never leaves a due entry behind when the limit allows.
        #[test]
        fn pop_due_never_returns_future_entries(
            offsets in prop::collection::vec(-500i64..500i64, 1..40),
            limit in 1usize..50,
        ) {
            let (_, store) = store();
            for (i, off) in offsets.iter().enumerate() {
                let (_, id) = job(i as i64, T0 + off);
                store.index_insert(&id, T0 + off, true).unwrap();
            }

            let popped = store.index_pop_due(T0, limit).unwrap();
            prop_assert!(popped.iter().all(|e| e.due_at <= T0));
            prop_assert!(popped.len() <= limit);

            let due_total = offsets.iter().filter(|o| **o <= 0).count();
            prop_assert_eq!(popped.len(), due_total.min(limit));
        }
    }
}
