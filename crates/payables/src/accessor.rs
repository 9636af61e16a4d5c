//! Payable store contract and an in-memory implementation for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use payremind_core::PayableId;

use crate::payable::{Payable, PayableStatus, Recipients, ReminderRecord, ScheduledReminder};

/// Payable store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessorError {
    #[error("payable store unavailable: {0}")]
    Unavailable(String),
    #[error("payable store timed out")]
    Timeout,
    #[error("payable store error: {0}")]
    Storage(String),
}

/// Read/write access to payables, as needed by the reminder scheduler.
///
/// Implementations talk to the real record store (and decrypt fields). Every
/// call may block on IO; callers bound them with a timeout.
pub trait PayableAccessor: Send + Sync {
    /// Look up a payable. `Ok(None)` means it does not exist.
    fn find_by_id(&self, id: PayableId) -> Result<Option<Payable>, AccessorError>;

    /// Append a reminder record and advance the status to `notified` in one
    /// update. Returns `false` if the payable no longer exists.
    fn append_reminder(&self, id: PayableId, record: ReminderRecord)
    -> Result<bool, AccessorError>;

    /// Who should be notified about this payable.
    fn recipients_for(&self, payable: &Payable) -> Result<Recipients, AccessorError>;

    /// Mirror the scheduled jobs onto the payable for display.
    fn record_schedule(
        &self,
        _id: PayableId,
        _entries: &[ScheduledReminder],
    ) -> Result<(), AccessorError> {
        Ok(())
    }

    /// Drop mirrored entries for jobs that no longer exist.
    fn forget_scheduled(&self, _id: PayableId, _job_ids: &[String]) -> Result<(), AccessorError> {
        Ok(())
    }
}

impl<S> PayableAccessor for Arc<S>
where
    S: PayableAccessor + ?Sized,
{
    fn find_by_id(&self, id: PayableId) -> Result<Option<Payable>, AccessorError> {
        (**self).find_by_id(id)
    }

    fn append_reminder(
        &self,
        id: PayableId,
        record: ReminderRecord,
    ) -> Result<bool, AccessorError> {
        (**self).append_reminder(id, record)
    }

    fn recipients_for(&self, payable: &Payable) -> Result<Recipients, AccessorError> {
        (**self).recipients_for(payable)
    }

    fn record_schedule(
        &self,
        id: PayableId,
        entries: &[ScheduledReminder],
    ) -> Result<(), AccessorError> {
        (**self).record_schedule(id, entries)
    }

    fn forget_scheduled(&self, id: PayableId, job_ids: &[String]) -> Result<(), AccessorError> {
        (**self).forget_scheduled(id, job_ids)
    }
}

#[derive(Debug, Default)]
struct Inner {
    payables: HashMap<PayableId, Payable>,
    failing_lookups: u32,
}

/// In-memory payable store for tests/dev.
///
/// Every payable shares the same configured recipients. Lookups can be made
/// to fail a number of times to simulate an unreachable store.
#[derive(Debug)]
pub struct InMemoryPayables {
    inner: RwLock<Inner>,
    recipients: Recipients,
}

impl InMemoryPayables {
    pub fn new(recipients: Recipients) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            recipients,
        }
    }

    pub fn arc(recipients: Recipients) -> Arc<Self> {
        Arc::new(Self::new(recipients))
    }

    pub fn insert(&self, payable: Payable) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.payables.insert(payable.id, payable);
    }

    pub fn get(&self, id: PayableId) -> Option<Payable> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.payables.get(&id).cloned()
    }

    pub fn remove(&self, id: PayableId) -> Option<Payable> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.payables.remove(&id)
    }

    /// Returns `false` if the payable does not exist.
    pub fn set_status(&self, id: PayableId, status: PayableStatus) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.payables.get_mut(&id) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    /// Make the next `n` lookups fail with [`AccessorError::Unavailable`].
    pub fn fail_next_lookups(&self, n: u32) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.failing_lookups = n;
    }
}

impl Default for InMemoryPayables {
    fn default() -> Self {
        Self::new(Recipients::default())
    }
}

impl PayableAccessor for InMemoryPayables {
    fn find_by_id(&self, id: PayableId) -> Result<Option<Payable>, AccessorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AccessorError::Storage("lock poisoned".to_string()))?;
        if inner.failing_lookups > 0 {
            inner.failing_lookups -= 1;
            return Err(AccessorError::Unavailable("simulated outage".to_string()));
        }
        Ok(inner.payables.get(&id).cloned())
    }

    fn append_reminder(
        &self,
        id: PayableId,
        record: ReminderRecord,
    ) -> Result<bool, AccessorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AccessorError::Storage("lock poisoned".to_string()))?;
        match inner.payables.get_mut(&id) {
            Some(p) => {
                p.reminders.push(record);
                p.status = PayableStatus::Notified;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn recipients_for(&self, _payable: &Payable) -> Result<Recipients, AccessorError> {
        Ok(self.recipients.clone())
    }

    fn record_schedule(
        &self,
        id: PayableId,
        entries: &[ScheduledReminder],
    ) -> Result<(), AccessorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AccessorError::Storage("lock poisoned".to_string()))?;
        if let Some(p) = inner.payables.get_mut(&id) {
            p.scheduled_jobs = entries.to_vec();
        }
        Ok(())
    }

    fn forget_scheduled(&self, id: PayableId, job_ids: &[String]) -> Result<(), AccessorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| AccessorError::Storage("lock poisoned".to_string()))?;
        if let Some(p) = inner.payables.get_mut(&id) {
            p.scheduled_jobs.retain(|s| !job_ids.contains(&s.job_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::payable::Channel;

    fn record(offset_days: i64) -> ReminderRecord {
        ReminderRecord {
            offset_days,
            scheduled_for: Utc::now(),
            sent_at: Utc::now(),
            channels: vec![Channel::Email],
            success: true,
        }
    }

    #[test]
    fn append_reminder_marks_payable_notified() {
        let store = InMemoryPayables::default();
        let payable = Payable::new(PayableId::new(), Utc::now(), 500);
        let id = payable.id;
        store.insert(payable);

        assert!(store.append_reminder(id, record(2)).unwrap());

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, PayableStatus::Notified);
        assert!(stored.has_reminder_for(2));
    }

    #[test]
    fn append_reminder_on_missing_payable_returns_false() {
        let store = InMemoryPayables::default();
        assert!(!store.append_reminder(PayableId::new(), record(1)).unwrap());
    }

    #[test]
    fn simulated_outage_fails_exactly_n_lookups() {
        let store = InMemoryPayables::default();
        let payable = Payable::new(PayableId::new(), Utc::now(), 500);
        let id = payable.id;
        store.insert(payable);
        store.fail_next_lookups(2);

        assert!(store.find_by_id(id).is_err());
        assert!(store.find_by_id(id).is_err());
        assert!(store.find_by_id(id).unwrap().is_some());
    }

    #[test]
    fn forget_scheduled_only_drops_named_jobs() {
        let store = InMemoryPayables::default();
        let payable = Payable::new(PayableId::new(), Utc::now(), 500);
        let id = payable.id;
        store.insert(payable);

        let entries = vec![
            ScheduledReminder {
                offset_days: 7,
                due_at: Utc::now(),
                job_id: "a".to_string(),
            },
            ScheduledReminder {
                offset_days: 2,
                due_at: Utc::now(),
                job_id: "b".to_string(),
            },
        ];
        store.record_schedule(id, &entries).unwrap();
        store.forget_scheduled(id, &["a".to_string()]).unwrap();

        let left = store.get(id).unwrap().scheduled_jobs;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].job_id, "b");
    }
}
