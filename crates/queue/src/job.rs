//! Consultation job record and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fiscalq_core::{CompanyId, DomainError, DomainResult, JobId};

use crate::failure::FailureKind;

/// Error detail stored on a job cancelled by an operator.
pub const CANCELLED_DETAIL: &str = "cancelled by operator";

macro_rules! string_enum {
    ($t:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {}: {other}",
                        stringify!($t)
                    ))),
                }
            }
        }
    };
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed (possibly not yet due)
    Pending,
    /// Claimed by the worker, consultation in flight
    Processing,
    /// Consultation succeeded
    Completed,
    /// Terminal failure (fatal, exhausted, or cancelled)
    Failed,
}

string_enum!(JobStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Immediate,
    Scheduled,
}

string_enum!(ExecutionType {
    Immediate => "immediate",
    Scheduled => "scheduled",
});

/// Rule for re-creating a scheduled job after its occurrence terminates.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

string_enum!(Recurrence {
    None => "none",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

/// Who created a job: an operator, or the recurrence expander.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    #[default]
    Manual,
    Recurrence,
}

string_enum!(CreatedBy {
    Manual => "manual",
    Recurrence => "recurrence",
});

/// Operator request to admit a consultation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub company_id: CompanyId,
    #[serde(default)]
    pub priority: i32,
    /// Falls back to the queue's configured default when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_schedule_active")]
    pub schedule_active: bool,
}

fn default_schedule_active() -> bool {
    true
}

impl JobSpec {
    /// An immediate, non-recurring consultation for one company.
    pub fn immediate(company_id: CompanyId) -> Self {
        Self {
            company_id,
            priority: 0,
            max_attempts: None,
            execution_type: ExecutionType::Immediate,
            recurrence: Recurrence::None,
            scheduled_at: None,
            schedule_active: true,
        }
    }

    /// A scheduled consultation, optionally recurring.
    pub fn scheduled(
        company_id: CompanyId,
        scheduled_at: Option<DateTime<Utc>>,
        recurrence: Recurrence,
    ) -> Self {
        Self {
            execution_type: ExecutionType::Scheduled,
            recurrence,
            scheduled_at,
            ..Self::immediate(company_id)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_schedule_active(mut self, active: bool) -> Self {
        self.schedule_active = active;
        self
    }

    /// Check field ranges and cross-field consistency.
    ///
    /// Company existence is checked by the queue manager against the directory.
    pub fn validate(&self, max_attempts_ceiling: u32) -> DomainResult<()> {
        if let Some(max) = self.max_attempts {
            if max < 1 {
                return Err(DomainError::validation("max_attempts must be >= 1"));
            }
            if max > max_attempts_ceiling {
                return Err(DomainError::validation(format!(
                    "max_attempts must be <= {max_attempts_ceiling}"
                )));
            }
        }

        match self.execution_type {
            ExecutionType::Immediate => {
                if self.recurrence != Recurrence::None {
                    return Err(DomainError::validation(
                        "recurrence requires execution_type = scheduled",
                    ));
                }
                if self.scheduled_at.is_some() {
                    return Err(DomainError::validation(
                        "scheduled_at is only accepted for scheduled jobs",
                    ));
                }
            }
            ExecutionType::Scheduled => {}
        }

        Ok(())
    }

    /// Build the record to insert, starting in `pending` with no attempts.
    pub fn into_new_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> NewJob {
        NewJob {
            company_id: self.company_id,
            status: JobStatus::Pending,
            priority: self.priority,
            created_at: now,
            scheduled_at: self.scheduled_at,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            execution_type: self.execution_type,
            recurrence: self.recurrence,
            schedule_active: self.schedule_active,
            created_by: CreatedBy::Manual,
        }
    }
}

/// A job that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub company_id: CompanyId,
    pub status: JobStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub execution_type: ExecutionType,
    pub recurrence: Recurrence,
    pub schedule_active: bool,
    pub created_by: CreatedBy,
}

impl NewJob {
    /// Materialize with the id the store assigned.
    pub fn with_id(self, id: JobId) -> Job {
        Job {
            id,
            company_id: self.company_id,
            status: self.status,
            priority: self.priority,
            created_at: self.created_at,
            processed_at: None,
            scheduled_at: self.scheduled_at,
            claimed_at: None,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error_detail: None,
            failure_kind: None,
            execution_type: self.execution_type,
            recurrence: self.recurrence,
            schedule_active: self.schedule_active,
            created_by: self.created_by,
            expanded: false,
        }
    }
}

/// One queued consultation request for a single company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Non-owning reference to the company collaborator.
    pub company_id: CompanyId,
    pub status: JobStatus,
    /// Higher is served first.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Set once when the job becomes terminal; immutable afterwards.
    pub processed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// When the current (or last) claim happened.
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_detail: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub execution_type: ExecutionType,
    pub recurrence: Recurrence,
    pub schedule_active: bool,
    pub created_by: CreatedBy,
    /// Whether the successor occurrence has already been spawned.
    pub expanded: bool,
}

impl Job {
    /// Pending and due at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn is_recurring(&self) -> bool {
        self.execution_type == ExecutionType::Scheduled && self.recurrence != Recurrence::None
    }

    /// Terminal occurrence of an active recurring schedule whose successor is not spawned yet.
    pub fn needs_expansion(&self) -> bool {
        self.is_recurring() && self.schedule_active && self.status.is_terminal() && !self.expanded
    }

    /// Ordering key for claiming: priority desc, then created_at asc, then id asc.
    pub fn claim_order(&self, other: &Job) -> core::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_at.cmp(&other.created_at))
            .then(self.id.cmp(&other.id))
    }

    /// The next occurrence of this schedule, due at `scheduled_at`.
    pub fn successor(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> NewJob {
        NewJob {
            company_id: self.company_id,
            status: JobStatus::Pending,
            priority: self.priority,
            created_at: now,
            scheduled_at: Some(scheduled_at),
            attempts: 0,
            max_attempts: self.max_attempts,
            execution_type: ExecutionType::Scheduled,
            recurrence: self.recurrence,
            schedule_active: self.schedule_active,
            created_by: CreatedBy::Recurrence,
        }
    }
}
