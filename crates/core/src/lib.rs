//! `payremind-core`: shared building blocks.
//!
//! Strongly-typed identifiers, the domain error model and the clock
//! abstraction used by everything that reasons about due instants.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{BusinessId, PayableId};
