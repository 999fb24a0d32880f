//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fiscalq_core::{CompanyId, JobId};
use fiscalq_queue::{Job, JobStatus, NewJob};

use super::types::{JobFilter, JobStats, Transition};

/// Durable table of consultation jobs.
///
/// Every method is atomic with respect to concurrent callers: the worker and the
/// scheduler loop share one store and coordinate only through these operations.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a job and return it with its newly assigned id.
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Compare-and-set state change; fails with `Conflict` when the job is not in
    /// [`Transition::required_status`].
    async fn update_status(&self, id: JobId, transition: Transition) -> Result<Job, JobStoreError>;

    /// Claim the highest-priority ready job whose company has nothing `processing`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Pending jobs due at `now`, ordered by priority desc then created_at asc.
    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Terminal occurrences of active recurring schedules not expanded yet.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Mark `parent` expanded and insert its successor in one step.
    ///
    /// Returns `None` when the parent was already expanded.
    async fn spawn_occurrence(
        &self,
        parent: JobId,
        successor: NewJob,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn set_schedule_active(&self, id: JobId, active: bool) -> Result<Job, JobStoreError>;

    /// Whether the company has a job `pending` or `processing`.
    async fn has_active_job(&self, company_id: CompanyId) -> Result<bool, JobStoreError>;

    /// Jobs still `processing` that were claimed before `claimed_before`.
    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("corrupt job record: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// The backing storage cannot be read or written at all.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl JobStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, Job>,
    last_id: i64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn sort_ready(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.claim_order(b));
}

fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut state = self.state.write().unwrap();
        state.last_id += 1;
        let job = job.with_id(JobId::new(state.last_id));
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let state = self.state.read().unwrap();
        state.jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn update_status(&self, id: JobId, transition: Transition) -> Result<Job, JobStoreError> {
        let mut state = self.state.write().unwrap();
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        let expected = transition.required_status();
        if job.status != expected {
            return Err(JobStoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }

        transition.apply(job);
        Ok(job.clone())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.state.write().unwrap();

        let locked: HashSet<CompanyId> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing)
            .map(|j| j.company_id)
            .collect();

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now) && !locked.contains(&j.company_id))
            .min_by(|a, b| a.claim_order(b))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.read().unwrap();
        let mut ready: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .cloned()
            .collect();
        sort_ready(&mut ready);
        Ok(ready)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.needs_expansion() && j.processed_at.is_none_or(|at| at <= now))
            .cloned()
            .collect())
    }

    async fn spawn_occurrence(
        &self,
        parent: JobId,
        successor: NewJob,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut state = self.state.write().unwrap();
        let parent_job = state
            .jobs
            .get_mut(&parent)
            .ok_or(JobStoreError::NotFound(parent))?;
        if parent_job.expanded {
            return Ok(None);
        }
        parent_job.expanded = true;

        state.last_id += 1;
        let job = successor.with_id(JobId::new(state.last_id));
        state.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn set_schedule_active(&self, id: JobId, active: bool) -> Result<Job, JobStoreError> {
        let mut state = self.state.write().unwrap();
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.schedule_active = active;
        Ok(job.clone())
    }

    async fn has_active_job(&self, company_id: CompanyId) -> Result<bool, JobStoreError> {
        let state = self.state.read().unwrap();
        Ok(state.jobs.values().any(|j| {
            j.company_id == company_id
                && matches!(j.status, JobStatus::Pending | JobStatus::Processing)
        }))
    }

    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing && j.claimed_at.is_none_or(|at| at < claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.state.read().unwrap();
        let mut result: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        sort_newest_first(&mut result);
        Ok(result
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let state = self.state.read().unwrap();
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(id).await
    }

    async fn update_status(&self, id: JobId, transition: Transition) -> Result<Job, JobStoreError> {
        (**self).update_status(id, transition).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now).await
    }

    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_ready(now).await
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_due_schedules(now).await
    }

    async fn spawn_occurrence(
        &self,
        parent: JobId,
        successor: NewJob,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).spawn_occurrence(parent, successor).await
    }

    async fn set_schedule_active(&self, id: JobId, active: bool) -> Result<Job, JobStoreError> {
        (**self).set_schedule_active(id, active).await
    }

    async fn has_active_job(&self, company_id: CompanyId) -> Result<bool, JobStoreError> {
        (**self).has_active_job(company_id).await
    }

    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_stalled(claimed_before).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
