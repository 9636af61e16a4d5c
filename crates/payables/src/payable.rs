use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use payremind_core::{BusinessId, PayableId};

/// Payable status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayableStatus {
    /// Created and awaiting payment; stored as `pending` by older records.
    #[serde(alias = "pending")]
    Active,
    /// At least one reminder went out.
    Notified,
    Cancelled,
    Completed,
}

impl PayableStatus {
    /// Reminders no longer apply once a payable reaches a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PayableStatus::Cancelled | PayableStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayableStatus::Active => "active",
            PayableStatus::Notified => "notified",
            PayableStatus::Cancelled => "cancelled",
            PayableStatus::Completed => "completed",
        }
    }
}

impl core::fmt::Display for PayableStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery channel of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
}

/// Who receives reminders for a payable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

impl Recipients {
    pub fn new(emails: Vec<String>, phones: Vec<String>) -> Self {
        Self { emails, phones }
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.phones.is_empty()
    }

    /// Channels a message to these recipients goes out on.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels = Vec::with_capacity(2);
        if !self.emails.is_empty() {
            channels.push(Channel::Email);
        }
        if !self.phones.is_empty() {
            channels.push(Channel::Sms);
        }
        channels
    }
}

/// Outcome of one sent reminder, appended to the payable.
///
/// A record for a given `offset_days` marks that reminder as delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub offset_days: i64,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub channels: Vec<Channel>,
    pub success: bool,
}

/// Mirror of one scheduled job, kept on the payable for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReminder {
    pub offset_days: i64,
    pub due_at: DateTime<Utc>,
    pub job_id: String,
}

/// The fields of a payable the scheduler reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payable {
    pub id: PayableId,
    pub business_id: Option<BusinessId>,
    pub name: Option<String>,
    pub reference: Option<String>,
    pub currency: Option<String>,
    /// Amount in smallest currency unit (e.g., cents).
    pub amount: u64,
    pub due_at: DateTime<Utc>,
    pub status: PayableStatus,
    #[serde(default)]
    pub reminders: Vec<ReminderRecord>,
    #[serde(default)]
    pub scheduled_jobs: Vec<ScheduledReminder>,
}

impl Payable {
    pub fn new(id: PayableId, due_at: DateTime<Utc>, amount: u64) -> Self {
        Self {
            id,
            business_id: None,
            name: None,
            reference: None,
            currency: None,
            amount,
            due_at,
            status: PayableStatus::Active,
            reminders: Vec::new(),
            scheduled_jobs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_business(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self
    }

    /// Whether a reminder for this offset has already been recorded.
    pub fn has_reminder_for(&self, offset_days: i64) -> bool {
        self.reminders.iter().any(|r| r.offset_days == offset_days)
    }

    /// Human label: name, falling back to reference.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.reference.as_deref())
            .unwrap_or("payable")
    }

    /// `amount` rendered in major units with two decimals.
    pub fn display_amount(&self) -> String {
        format!("{}.{:02}", self.amount / 100, self.amount % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn due() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn terminal_statuses() {
        assert!(!PayableStatus::Active.is_terminal());
        assert!(!PayableStatus::Notified.is_terminal());
        assert!(PayableStatus::Cancelled.is_terminal());
        assert!(PayableStatus::Completed.is_terminal());
    }

    #[test]
    fn legacy_pending_status_reads_as_active() {
        let status: PayableStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(status, PayableStatus::Active);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"active\"");
    }

    #[test]
    fn channels_follow_recipients() {
        let both = Recipients::new(vec!["a@b.co".into()], vec!["+1555".into()]);
        assert_eq!(both.channels(), vec![Channel::Email, Channel::Sms]);

        let email_only = Recipients::new(vec!["a@b.co".into()], vec![]);
        assert_eq!(email_only.channels(), vec![Channel::Email]);

        assert!(Recipients::default().channels().is_empty());
    }

    #[test]
    fn label_prefers_name_then_reference() {
        let p = Payable::new(PayableId::new(), due(), 1250).with_reference("INV-7");
        assert_eq!(p.label(), "INV-7");

        let p = p.with_name("Office rent");
        assert_eq!(p.label(), "Office rent");
    }

    #[test]
    fn display_amount_uses_two_decimals() {
        let p = Payable::new(PayableId::new(), due(), 120_005);
        assert_eq!(p.display_amount(), "1200.05");
    }
}
