//! `fiscalq-queue`
//!
//! **Responsibility:** the consultation job domain, free of storage and runtime.
//!
//! - `job`: the job record, its lifecycle states and admission spec
//! - `failure`: the closed failure-kind enumeration decided by the automation boundary
//! - `retry`: the retry policy (pure decision over attempts + failure kind)
//! - `recurrence`: the recurrence expander (pure next-occurrence math)
//! - `consultation`: collaborator capabilities consumed by the queue (portal automation, company directory)

pub mod consultation;
pub mod failure;
pub mod job;
pub mod recurrence;
pub mod retry;

pub use consultation::{
    CompanyDirectory, ConsultationFailure, ConsultationRunner, Credentials, DirectoryError, Message,
};
pub use failure::FailureKind;
pub use job::{CreatedBy, ExecutionType, Job, JobSpec, JobStatus, NewJob, Recurrence, CANCELLED_DETAIL};
pub use recurrence::next_occurrence;
pub use retry::{RetryDecision, RetryPolicy};
