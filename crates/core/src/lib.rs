//! `fiscalq-core`: shared building blocks for the consultation queue.
//!
//! This crate contains **pure** primitives (no storage, no runtime): identifiers,
//! the domain error model, and the clock seam every time-dependent component reads from.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{CompanyId, JobId};
