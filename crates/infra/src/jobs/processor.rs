//! Reminder processing: decide, notify, record.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use payremind_core::Clock;
use payremind_payables::{
    AccessorError, Channel, NotificationError, NotificationSender, PayableAccessor, PayableStatus,
    ReminderMessage, ReminderRecord,
};

use super::types::ReminderPayload;

/// Why a job was dropped without sending anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "reason", content = "status", rename_all = "snake_case")]
pub enum DiscardReason {
    NotFound,
    Terminal(PayableStatus),
    AlreadyReminded,
}

/// Successful handling of a job. Either way the job is finished.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    Sent { channels: Vec<Channel> },
    Discarded(DiscardReason),
}

/// Transient processing failure; the job is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("payable store: {0}")]
    Accessor(#[from] AccessorError),
    #[error("notification: {0}")]
    Notification(#[from] NotificationError),
    #[error("processing timed out after {0:?}")]
    Timeout(Duration),
    #[error("processing thread panicked")]
    Panicked,
    #[error("failed to spawn processing thread: {0}")]
    Spawn(String),
    #[error("{0} processing threads still running")]
    Saturated(usize),
}

/// Helper threads allowed to run at once unless configured otherwise.
pub const DEFAULT_HELPER_LIMIT: usize = 4;

/// Counts a running helper thread until dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Turns a due job into at most one notification.
///
/// A [`ReminderRecord`] for the job's offset marks it delivered, so running
/// the same job again after a success sends nothing.
#[derive(Clone)]
pub struct ReminderProcessor {
    accessor: Arc<dyn PayableAccessor>,
    sender: Arc<dyn NotificationSender>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<AtomicUsize>,
    helper_limit: usize,
}

impl std::fmt::Debug for ReminderProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReminderProcessor")
            .field("clock", &self.clock)
            .field("in_flight", &self.in_flight())
            .field("helper_limit", &self.helper_limit)
            .finish_non_exhaustive()
    }
}

impl ReminderProcessor {
    pub fn new(
        accessor: Arc<dyn PayableAccessor>,
        sender: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accessor,
            sender,
            clock,
            in_flight: Arc::new(AtomicUsize::new(0)),
            helper_limit: DEFAULT_HELPER_LIMIT,
        }
    }

    /// Cap on helper threads alive at once, counting timed-out runs that
    /// have not returned yet.
    pub fn with_helper_limit(mut self, limit: usize) -> Self {
        self.helper_limit = limit.max(1);
        self
    }

    /// Helper threads currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn process(&self, payload: &ReminderPayload) -> Result<ProcessOutcome, ProcessError> {
        let Some(payable) = self.accessor.find_by_id(payload.payable_id)? else {
            debug!(job_id = %payload.job_id, "payable not found, discarding");
            return Ok(ProcessOutcome::Discarded(DiscardReason::NotFound));
        };

        if payable.status.is_terminal() {
            debug!(job_id = %payload.job_id, status = %payable.status, "payable closed, discarding");
            return Ok(ProcessOutcome::Discarded(DiscardReason::Terminal(
                payable.status,
            )));
        }

        if payable.has_reminder_for(payload.offset_days) {
            debug!(job_id = %payload.job_id, "reminder already sent, discarding");
            return Ok(ProcessOutcome::Discarded(DiscardReason::AlreadyReminded));
        }

        let recipients = self.accessor.recipients_for(&payable)?;
        if recipients.is_empty() {
            return Err(NotificationError::NoRecipients.into());
        }

        let message = ReminderMessage::for_payable(&payable, payload.offset_days);
        self.sender.send(&recipients, &message)?;

        let channels = recipients.channels();
        let record = ReminderRecord {
            offset_days: payload.offset_days,
            scheduled_for: payable.due_at - chrono::Duration::days(payload.offset_days),
            sent_at: self.clock.now(),
            channels: channels.clone(),
            success: true,
        };
        if !self.accessor.append_reminder(payable.id, record)? {
            warn!(job_id = %payload.job_id, "payable disappeared after reminder was sent");
        }

        info!(
            job_id = %payload.job_id,
            payable_id = %payload.payable_id,
            offset_days = payload.offset_days,
            attempts = payload.attempts,
            "reminder sent"
        );
        Ok(ProcessOutcome::Sent { channels })
    }

    /// Run [`process`](Self::process) on a helper thread and give up after
    /// `timeout`.
    ///
    /// A timed-out run keeps going in the background and may still complete;
    /// the retry that follows is then discarded by the reminder record. Once
    /// `helper_limit` runs are stuck, further calls fail with
    /// [`ProcessError::Saturated`] without spawning anything.
    pub fn process_with_timeout(
        &self,
        payload: &ReminderPayload,
        timeout: Duration,
    ) -> Result<ProcessOutcome, ProcessError> {
        let running = self.in_flight();
        if running >= self.helper_limit {
            warn!(job_id = %payload.job_id, running, "processing threads saturated");
            return Err(ProcessError::Saturated(running));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let processor = self.clone();
        let job = payload.clone();
        let guard = InFlight::enter(&self.in_flight);

        thread::Builder::new()
            .name("reminder-process".to_string())
            .spawn(move || {
                let _guard = guard;
                let _ = tx.send(processor.process(&job));
            })
            .map_err(|e| ProcessError::Spawn(e.to_string()))?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ProcessError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProcessError::Panicked),
        }
    }
}
