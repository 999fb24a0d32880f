//! Consultation job system: storage, retry bookkeeping and recurrence.
//!
//! ## Components
//!
//! - `JobStore`: atomic persistence for jobs (in-memory or SQLite)
//! - `Transition`: the compare-and-set state changes a store applies
//! - `QueueManager`: admission, claiming, outcome reporting, schedule expansion

pub mod manager;
pub mod sqlite;
pub mod store;
pub mod types;

pub use manager::{QueueError, QueueManager, STALLED_DETAIL};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{EnqueueSummary, JobFilter, JobStats, Transition};
