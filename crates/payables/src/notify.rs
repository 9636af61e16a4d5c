//! Notification transport contract.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::payable::{Payable, Recipients};

/// Notification transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
    #[error("no recipients configured")]
    NoRecipients,
}

/// A rendered reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderMessage {
    pub subject: String,
    pub body: String,
}

impl ReminderMessage {
    /// Render the reminder sent `offset_days` before the payable is due.
    pub fn for_payable(payable: &Payable, offset_days: i64) -> Self {
        let reference = payable
            .reference
            .as_deref()
            .or(payable.name.as_deref())
            .unwrap_or("payable");
        let subject = format!(
            "[Reminder] {} due on {}",
            payable.label(),
            payable.due_at.format("%Y-%m-%d")
        );
        let body = format!(
            "Payable {} of {} {} is due on {} (scheduled {} day(s) in advance).",
            reference,
            payable.currency.as_deref().unwrap_or(""),
            payable.display_amount(),
            payable.due_at.format("%Y-%m-%d %H:%M UTC"),
            offset_days,
        );
        Self { subject, body }
    }
}

/// Sends reminders (email, SMS, ...).
pub trait NotificationSender: Send + Sync {
    fn send(
        &self,
        recipients: &Recipients,
        message: &ReminderMessage,
    ) -> Result<(), NotificationError>;
}

impl<S> NotificationSender for Arc<S>
where
    S: NotificationSender + ?Sized,
{
    fn send(
        &self,
        recipients: &Recipients,
        message: &ReminderMessage,
    ) -> Result<(), NotificationError> {
        (**self).send(recipients, message)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<(Recipients, ReminderMessage)>,
    failing_sends: u32,
    delay: Option<Duration>,
}

/// Sender that records messages instead of delivering them (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingSender {
    inner: Mutex<Recorded>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` sends fail with [`NotificationError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.lock().failing_sends = n;
    }

    /// Block every send for `delay` before recording it.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<(Recipients, ReminderMessage)> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NotificationSender for RecordingSender {
    fn send(
        &self,
        recipients: &Recipients,
        message: &ReminderMessage,
    ) -> Result<(), NotificationError> {
        let delay = {
            let mut inner = self.lock();
            if inner.failing_sends > 0 {
                inner.failing_sends -= 1;
                return Err(NotificationError::Unavailable("simulated outage".to_string()));
            }
            inner.delay
        };

        if let Some(d) = delay {
            std::thread::sleep(d);
        }

        debug!(subject = %message.subject, "recorded reminder");
        self.lock().sent.push((recipients.clone(), message.clone()));
        Ok(())
    }
}
