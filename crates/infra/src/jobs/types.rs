//! Store-level job types: state transitions, filters, statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fiscalq_core::{CompanyId, JobId};
use fiscalq_queue::{FailureKind, Job, JobStatus, CANCELLED_DETAIL};

/// A state change applied atomically by the store.
///
/// Each transition is only legal from one status; the store rejects it with a
/// conflict when the job is anywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `processing -> completed`
    Complete { at: DateTime<Utc> },
    /// `processing -> pending`, not claimable before `scheduled_at`
    Retry {
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        kind: FailureKind,
        detail: String,
    },
    /// `processing -> failed`
    Fail {
        at: DateTime<Utc>,
        attempts: u32,
        kind: FailureKind,
        detail: String,
    },
    /// `pending -> failed` on operator request
    Cancel { at: DateTime<Utc> },
}

impl Transition {
    /// Status the job must hold for this transition to apply.
    pub fn required_status(&self) -> JobStatus {
        match self {
            Transition::Complete { .. } | Transition::Retry { .. } | Transition::Fail { .. } => {
                JobStatus::Processing
            }
            Transition::Cancel { .. } => JobStatus::Pending,
        }
    }

    /// Apply to an in-memory record. Callers check [`Self::required_status`] first.
    pub fn apply(self, job: &mut Job) {
        match self {
            Transition::Complete { at } => {
                job.status = JobStatus::Completed;
                job.processed_at = Some(at);
            }
            Transition::Retry {
                attempts,
                scheduled_at,
                kind,
                detail,
            } => {
                job.status = JobStatus::Pending;
                job.attempts = attempts;
                job.scheduled_at = Some(scheduled_at);
                job.failure_kind = Some(kind);
                job.error_detail = Some(detail);
            }
            Transition::Fail {
                at,
                attempts,
                kind,
                detail,
            } => {
                job.status = JobStatus::Failed;
                job.processed_at = Some(at);
                job.attempts = attempts;
                job.failure_kind = Some(kind);
                job.error_detail = Some(detail);
            }
            Transition::Cancel { at } => {
                job.status = JobStatus::Failed;
                job.processed_at = Some(at);
                job.error_detail = Some(CANCELLED_DETAIL.to_string());
            }
        }
    }
}

/// Listing filter, newest jobs first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub company_id: Option<CompanyId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            company_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.company_id.is_none_or(|c| job.company_id == c)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}

/// Result of a bulk enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    pub admitted: Vec<JobId>,
    /// Companies that already had a pending or processing job.
    pub skipped: Vec<CompanyId>,
}
