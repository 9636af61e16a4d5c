//! Read-only views over the schedule, for operators and tooling.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use payremind_core::{BusinessId, PayableId};
use payremind_payables::{Payable, PayableAccessor, PayableStatus};

use super::store::{IndexEntry, ScheduleStore, StoreError};
use super::types::{JobId, ReminderPayload};

/// One job of a payable as currently stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledJobView {
    pub job_id: JobId,
    /// `None` once the job has left the index
    pub due_at: Option<i64>,
    /// `None` if the payload expired or cannot be decoded
    pub payload: Option<ReminderPayload>,
    /// Only filled by an inspector built [`with_payables`](Inspector::with_payables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payable: Option<PayableView>,
}

/// Summary of the payable a job belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayableView {
    pub payable_id: PayableId,
    pub business_id: Option<BusinessId>,
    pub name: Option<String>,
    pub reference: Option<String>,
    pub currency: Option<String>,
    pub amount: u64,
    pub status: PayableStatus,
    pub due_at: DateTime<Utc>,
}

impl From<&Payable> for PayableView {
    fn from(p: &Payable) -> Self {
        Self {
            payable_id: p.id,
            business_id: p.business_id,
            name: p.name.clone(),
            reference: p.reference.clone(),
            currency: p.currency.clone(),
            amount: p.amount,
            status: p.status,
            due_at: p.due_at,
        }
    }
}

pub struct Inspector<S: ScheduleStore> {
    store: S,
    payables: Option<Arc<dyn PayableAccessor>>,
}

impl<S: ScheduleStore> Inspector<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            payables: None,
        }
    }

    /// Attach a [`PayableView`] to every job view this inspector returns.
    pub fn with_payables(mut self, accessor: Arc<dyn PayableAccessor>) -> Self {
        self.payables = Some(accessor);
        self
    }

    /// The `limit` earliest jobs in the index.
    pub fn list_next_due(&self, limit: usize) -> Result<Vec<IndexEntry>, StoreError> {
        self.store.index_range(None, None, limit)
    }

    /// Jobs due within `[start, end]`; a missing bound is open.
    pub fn list_window(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        self.store.index_range(
            start.map(|t| t.timestamp()),
            end.map(|t| t.timestamp()),
            limit,
        )
    }

    /// Load payloads (and payables, if attached) for listed entries.
    pub fn describe(&self, entries: Vec<IndexEntry>) -> Result<Vec<ScheduledJobView>, StoreError> {
        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = self.load_payload(&entry.job_id)?;
            views.push(ScheduledJobView {
                job_id: entry.job_id,
                due_at: Some(entry.due_at),
                payload,
                payable: None,
            });
        }
        self.hydrate(&mut views);
        Ok(views)
    }

    pub fn job_ids_for(&self, payable_id: PayableId) -> Result<Vec<JobId>, StoreError> {
        self.store.entity_members(payable_id)
    }

    /// Every job linked to a payable, soonest first; jobs no longer in the
    /// index sort last.
    pub fn jobs_for(&self, payable_id: PayableId) -> Result<Vec<ScheduledJobView>, StoreError> {
        let mut views = Vec::new();
        for job_id in self.store.entity_members(payable_id)? {
            let due_at = self.store.index_score(&job_id)?;
            let payload = self.load_payload(&job_id)?;
            views.push(ScheduledJobView {
                job_id,
                due_at,
                payload,
                payable: None,
            });
        }

        views.sort_by_key(|v| (v.due_at.is_none(), v.due_at, v.job_id.clone()));
        self.hydrate(&mut views);
        Ok(views)
    }

    fn load_payload(&self, job_id: &JobId) -> Result<Option<ReminderPayload>, StoreError> {
        Ok(match self.store.payload_get(job_id)? {
            Some(raw) => ReminderPayload::decode(&raw)
                .map_err(|e| warn!(job_id = %job_id, error = %e, "undecodable payload"))
                .ok(),
            None => None,
        })
    }

    /// One lookup per distinct payable; lookup failures leave `payable` empty.
    fn hydrate(&self, views: &mut [ScheduledJobView]) {
        let Some(accessor) = &self.payables else {
            return;
        };

        let mut seen: BTreeMap<PayableId, Option<PayableView>> = BTreeMap::new();
        for view in views.iter_mut() {
            let Some(pid) = view
                .payload
                .as_ref()
                .map(|p| p.payable_id)
                .or_else(|| view.job_id.payable_id())
            else {
                continue;
            };
            view.payable = seen
                .entry(pid)
                .or_insert_with(|| match accessor.find_by_id(pid) {
                    Ok(found) => found.as_ref().map(PayableView::from),
                    Err(e) => {
                        warn!(payable_id = %pid, error = %e, "payable lookup failed");
                        None
                    }
                })
                .clone();
        }
    }
}
