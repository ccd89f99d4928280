//! `taskgate-core`: shared primitives for the dispatch subsystem.
//!
//! Identifiers, the injectable clock and the small error type used when
//! parsing them. No IO lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::JobId;
