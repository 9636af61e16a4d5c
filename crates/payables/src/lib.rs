//! Payables as seen by the reminder scheduler.
//!
//! The payable record store and the notification transport live outside this
//! workspace. This crate holds the view of a payable the scheduler needs, the
//! collaborator contracts it calls, and in-memory implementations of those
//! contracts for tests and local development.

pub mod accessor;
pub mod notify;
pub mod payable;

pub use accessor::{AccessorError, InMemoryPayables, PayableAccessor};
pub use notify::{NotificationError, NotificationSender, RecordingSender, ReminderMessage};
pub use payable::{
    Channel, Payable, PayableStatus, Recipients, ReminderRecord, ScheduledReminder,
};
