//! Queue manager: admission, claiming, outcome reporting and recurrence spawning.
//!
//! All coordination with the scheduler loop goes through the [`JobStore`]; the
//! manager holds no mutable state of its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use fiscalq_core::{Clock, CompanyId, JobId};
use fiscalq_queue::{
    next_occurrence, CompanyDirectory, DirectoryError, FailureKind, Job, JobSpec, JobStatus,
    RetryDecision, RetryPolicy,
};

use crate::config::QueueConfig;

use super::store::{JobStore, JobStoreError};
use super::types::{EnqueueSummary, JobFilter, JobStats, Transition};

/// Error detail recorded when a stalled claim is recovered.
pub const STALLED_DETAIL: &str = "stalled: no outcome reported";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    /// The admission request was rejected; nothing was stored.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The requested transition does not match the job's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Store(JobStoreError),
}

impl QueueError {
    /// Whether the loops must stop: storage can no longer be read or written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_unavailable())
    }
}

impl From<JobStoreError> for QueueError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => QueueError::NotFound(id),
            JobStoreError::Conflict { .. } => QueueError::InvalidState(err.to_string()),
            other => QueueError::Store(other),
        }
    }
}

/// Front door of the consultation queue.
pub struct QueueManager<S, D> {
    store: S,
    directory: D,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    policy: RetryPolicy,
}

impl<S: JobStore, D: CompanyDirectory> QueueManager<S, D> {
    pub fn new(store: S, directory: D, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        let policy = config.retry_policy();
        Self {
            store,
            directory,
            clock,
            config,
            policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and insert a new job in `pending` with no attempts.
    #[instrument(skip(self, spec), fields(company_id = %spec.company_id), err)]
    pub async fn admit(&self, spec: JobSpec) -> Result<Job, QueueError> {
        spec.validate(self.config.max_attempts_ceiling)
            .map_err(|e| QueueError::InvalidSpec(e.to_string()))?;
        self.ensure_company(spec.company_id).await?;

        let job = self
            .store
            .insert(spec.into_new_job(self.config.default_max_attempts, self.now()))
            .await?;

        info!(
            job_id = %job.id,
            company_id = %job.company_id,
            priority = job.priority,
            execution_type = %job.execution_type,
            recurrence = %job.recurrence,
            "job admitted"
        );
        Ok(job)
    }

    /// Admit one immediate job per company, skipping companies that already have
    /// a job `pending` or `processing`.
    ///
    /// Unknown companies reject the whole batch before anything is inserted.
    #[instrument(skip(self, company_ids), fields(companies = company_ids.len()), err)]
    pub async fn enqueue_companies(
        &self,
        company_ids: &[CompanyId],
        priority: i32,
    ) -> Result<EnqueueSummary, QueueError> {
        for &company_id in company_ids {
            self.ensure_company(company_id).await?;
        }

        let mut summary = EnqueueSummary::default();
        for &company_id in company_ids {
            if self.store.has_active_job(company_id).await? {
                debug!(company_id = %company_id, "company already queued; skipping");
                summary.skipped.push(company_id);
                continue;
            }

            let job = self
                .store
                .insert(
                    JobSpec::immediate(company_id)
                        .with_priority(priority)
                        .into_new_job(self.config.default_max_attempts, self.now()),
                )
                .await?;
            summary.admitted.push(job.id);
        }

        info!(
            admitted = summary.admitted.len(),
            skipped = summary.skipped.len(),
            "companies enqueued"
        );
        Ok(summary)
    }

    /// Claim the next ready job, honouring per-company exclusion.
    pub async fn claim(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.store.claim_next(self.now()).await?)
    }

    /// Mark a processing job completed and spawn its next occurrence if it recurs.
    #[instrument(skip(self), err)]
    pub async fn report_success(&self, id: JobId, retrieved: usize) -> Result<Job, QueueError> {
        let now = self.now();
        let job = self
            .store
            .update_status(id, Transition::Complete { at: now })
            .await?;

        info!(job_id = %id, company_id = %job.company_id, retrieved, "job completed");
        self.expand_after_terminal(&job).await;
        Ok(job)
    }

    /// Record a failed execution and apply the retry policy.
    #[instrument(skip(self, detail), err)]
    pub async fn report_failure(
        &self,
        id: JobId,
        kind: FailureKind,
        detail: impl Into<String> + Send,
    ) -> Result<Job, QueueError> {
        let detail = detail.into();
        let current = self.store.get(id).await?;
        if current.status != JobStatus::Processing {
            return Err(QueueError::InvalidState(format!(
                "job {id} is {}, expected {}",
                current.status,
                JobStatus::Processing
            )));
        }

        let now = self.now();
        let attempts = current.attempts.saturating_add(1);
        let decision = self.policy.decide(attempts, current.max_attempts, kind, now);

        let transition = match decision {
            RetryDecision::Retry { next_scheduled_at } => Transition::Retry {
                attempts,
                scheduled_at: next_scheduled_at,
                kind,
                detail,
            },
            RetryDecision::Exhausted | RetryDecision::Fatal => Transition::Fail {
                at: now,
                attempts,
                kind,
                detail,
            },
        };

        let job = self.store.update_status(id, transition).await?;

        match decision {
            RetryDecision::Retry { next_scheduled_at } => info!(
                job_id = %id,
                company_id = %job.company_id,
                kind = %kind,
                attempts,
                max_attempts = job.max_attempts,
                next_scheduled_at = %next_scheduled_at,
                "job failed; retry scheduled"
            ),
            RetryDecision::Exhausted => warn!(
                job_id = %id,
                company_id = %job.company_id,
                kind = %kind,
                attempts,
                reason = kind.operator_message(),
                "job failed; retries exhausted"
            ),
            RetryDecision::Fatal => warn!(
                job_id = %id,
                company_id = %job.company_id,
                kind = %kind,
                attempts,
                reason = kind.operator_message(),
                "job failed; not retryable"
            ),
        }

        if job.status.is_terminal() {
            self.expand_after_terminal(&job).await;
        }
        Ok(job)
    }

    /// Cancel a job that has not been claimed yet.
    ///
    /// A cancelled occurrence of a recurring schedule is terminal, so the series
    /// continues with the next occurrence.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: JobId) -> Result<Job, QueueError> {
        let job = self
            .store
            .update_status(id, Transition::Cancel { at: self.now() })
            .await
            .map_err(|e| match e {
                JobStoreError::Conflict { actual, .. } => QueueError::InvalidState(format!(
                    "job {id} is {actual}; only pending jobs can be cancelled"
                )),
                other => other.into(),
            })?;

        info!(job_id = %id, company_id = %job.company_id, "job cancelled");
        self.expand_after_terminal(&job).await;
        Ok(job)
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job, QueueError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_ready(now).await?)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueueError> {
        Ok(self.store.stats().await?)
    }

    /// Enable or disable future spawning for a schedule; history is untouched.
    #[instrument(skip(self), err)]
    pub async fn set_schedule_active(&self, id: JobId, active: bool) -> Result<Job, QueueError> {
        let job = self.store.set_schedule_active(id, active).await?;
        info!(job_id = %id, company_id = %job.company_id, active, "schedule toggled");
        Ok(job)
    }

    /// Fail every claim older than the stall timeout as a `Timeout`.
    ///
    /// Goes through [`Self::report_failure`], so retries and recurrence apply.
    pub async fn recover_stalled(&self) -> Result<Vec<Job>, QueueError> {
        let stall = chrono::Duration::from_std(self.config.stall_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .now()
            .checked_sub_signed(stall)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.recover_claimed_before(cutoff).await
    }

    /// Fail every claim left by a previous process, regardless of age.
    ///
    /// Only sound before this process starts its own worker: with no execution
    /// in flight, every `processing` row is orphaned.
    pub async fn recover_orphaned(&self) -> Result<Vec<Job>, QueueError> {
        self.recover_claimed_before(self.now()).await
    }

    async fn recover_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let mut recovered = Vec::new();
        for job in self.store.list_stalled(cutoff).await? {
            match self
                .report_failure(job.id, FailureKind::Timeout, STALLED_DETAIL)
                .await
            {
                Ok(job) => {
                    warn!(job_id = %job.id, company_id = %job.company_id, "recovered stalled job");
                    recovered.push(job);
                }
                // the worker reported an outcome in the meantime
                Err(QueueError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Spawn successors for every terminal occurrence not expanded yet.
    ///
    /// Idempotent: an occurrence already expanded (by an earlier tick or by the
    /// outcome report itself) is skipped.
    pub async fn expand_due_schedules(&self) -> Result<Vec<Job>, QueueError> {
        let mut spawned = Vec::new();
        for parent in self.store.list_due_schedules(self.now()).await? {
            match self.spawn_next(&parent).await {
                Ok(Some(job)) => spawned.push(job),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(job_id = %parent.id, error = %e, "failed to expand schedule"),
            }
        }
        Ok(spawned)
    }

    async fn spawn_next(&self, parent: &Job) -> Result<Option<Job>, QueueError> {
        if !parent.needs_expansion() {
            return Ok(None);
        }

        let now = self.now();
        // an occurrence cancelled ahead of its slot still owns that slot
        let anchor = match (parent.processed_at, parent.scheduled_at) {
            (Some(done), Some(slot)) => done.max(slot),
            (done, slot) => done.or(slot).unwrap_or(now),
        };
        let Some(next_at) = next_occurrence(parent.recurrence, anchor) else {
            warn!(job_id = %parent.id, anchor = %anchor, "next occurrence out of range");
            return Ok(None);
        };

        let spawned = self
            .store
            .spawn_occurrence(parent.id, parent.successor(next_at, now))
            .await?;

        if let Some(job) = &spawned {
            info!(
                parent_id = %parent.id,
                job_id = %job.id,
                company_id = %job.company_id,
                recurrence = %job.recurrence,
                scheduled_at = %next_at,
                "spawned next occurrence"
            );
        }
        Ok(spawned)
    }

    /// Best effort: the scheduler loop retries whatever fails here.
    async fn expand_after_terminal(&self, job: &Job) {
        if let Err(e) = self.spawn_next(job).await {
            warn!(job_id = %job.id, error = %e, "deferred schedule expansion to scheduler");
        }
    }

    async fn ensure_company(&self, company_id: CompanyId) -> Result<(), QueueError> {
        if self.directory.company_exists(company_id).await? {
            Ok(())
        } else {
            Err(QueueError::InvalidSpec(format!("company {company_id} does not exist")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consultation::InMemoryCompanyDirectory;
    use crate::jobs::InMemoryJobStore;
    use chrono::{Duration, TimeZone};
    use fiscalq_core::ManualClock;
    use fiscalq_queue::{CreatedBy, Credentials, Recurrence};

    type Manager = QueueManager<Arc<InMemoryJobStore>, InMemoryCompanyDirectory>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials {
            login: "login".to_string(),
            password: "secret".to_string(),
            state_registration: "110042490114".to_string(),
        }
    }

    fn manager() -> (Manager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let directory = InMemoryCompanyDirectory::new();
        for id in [1, 2, 7] {
            directory.add(CompanyId::new(id), credentials());
        }
        let manager = QueueManager::new(
            InMemoryJobStore::arc(),
            directory,
            clock.clone(),
            QueueConfig::default(),
        );
        (manager, clock)
    }

    fn company_7() -> JobSpec {
        JobSpec::immediate(CompanyId::new(7)).with_max_attempts(3)
    }

    #[tokio::test]
    async fn admit_then_get_status_is_pending() {
        let (m, _) = manager();
        let job = m.admit(company_7()).await.unwrap();

        let status = m.get_status(job.id).await.unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.attempts, 0);
        assert_eq!(status.max_attempts, 3);
    }

    #[tokio::test]
    async fn admit_rejects_unknown_company_and_bad_fields() {
        let (m, _) = manager();

        let err = m.admit(JobSpec::immediate(CompanyId::new(99))).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));

        let err = m.admit(company_7().with_max_attempts(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));

        assert_eq!(m.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn timeout_returns_job_to_pending_with_base_backoff() {
        let (m, _) = manager();
        let job = m.admit(company_7()).await.unwrap();

        let claimed = m.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        let failed = m
            .report_failure(job.id, FailureKind::Timeout, "network drop")
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.scheduled_at, Some(t0() + Duration::seconds(60)));
        assert_eq!(failed.error_detail.as_deref(), Some("network drop"));
    }

    #[tokio::test]
    async fn three_transient_failures_exhaust_the_job() {
        let (m, clock) = manager();
        let job = m.admit(company_7()).await.unwrap();

        let mut previous_due = None;
        for attempt in 1..=3u32 {
            let claimed = m.claim().await.unwrap().expect("job should be ready");
            assert_eq!(claimed.id, job.id);

            let after = m
                .report_failure(job.id, FailureKind::Timeout, "network drop")
                .await
                .unwrap();
            assert_eq!(after.attempts, attempt);
            assert!(after.attempts <= after.max_attempts);

            if attempt < 3 {
                assert_eq!(after.status, JobStatus::Pending);
                let due = after.scheduled_at.unwrap();
                if let Some(prev) = previous_due {
                    assert!(due > prev);
                }
                previous_due = Some(due);
                assert!(m.claim().await.unwrap().is_none());
                clock.set(due);
            } else {
                assert_eq!(after.status, JobStatus::Failed);
                assert!(after.processed_at.is_some());
                assert_eq!(after.failure_kind, Some(FailureKind::Timeout));
            }
        }

        // terminal: nothing left to claim, and reporting again is a state conflict
        assert!(m.claim().await.unwrap().is_none());
        let err = m
            .report_failure(job.id, FailureKind::Timeout, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidState(_)));
    }

    #[tokio::test]
    async fn captcha_is_fatal_even_with_attempts_left() {
        let (m, _) = manager();
        let job = m.admit(company_7().with_max_attempts(5)).await.unwrap();
        m.claim().await.unwrap();

        let failed = m
            .report_failure(job.id, FailureKind::CaptchaBlocked, "captcha")
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.failure_kind, Some(FailureKind::CaptchaBlocked));
        assert!(m.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn weekly_completion_spawns_one_successor() {
        let (m, clock) = manager();
        let job = m
            .admit(JobSpec::scheduled(CompanyId::new(7), None, Recurrence::Weekly))
            .await
            .unwrap();
        m.claim().await.unwrap();

        clock.advance(Duration::minutes(3));
        let completed_at = clock.now();
        m.report_success(job.id, 4).await.unwrap();

        // the outcome report already expanded; scheduler ticks find nothing to do
        assert!(m.expand_due_schedules().await.unwrap().is_empty());
        assert!(m.expand_due_schedules().await.unwrap().is_empty());

        let pending = m
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, Some(completed_at + Duration::days(7)));
        assert_eq!(pending[0].created_by, CreatedBy::Recurrence);
        assert!(m.get_status(job.id).await.unwrap().expanded);
    }

    #[tokio::test]
    async fn cancel_only_pending_jobs() {
        let (m, _) = manager();
        let a = m.admit(company_7()).await.unwrap();
        let b = m.admit(JobSpec::immediate(CompanyId::new(1))).await.unwrap();

        let cancelled = m.cancel(a.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_detail.as_deref(), Some(fiscalq_queue::CANCELLED_DETAIL));

        m.claim().await.unwrap();
        assert!(matches!(m.cancel(b.id).await, Err(QueueError::InvalidState(_))));
        assert!(matches!(
            m.cancel(JobId::new(404)).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_occurrence_keeps_series_alive() {
        let (m, _) = manager();
        let due = t0() + Duration::days(1);
        let job = m
            .admit(JobSpec::scheduled(CompanyId::new(2), Some(due), Recurrence::Daily))
            .await
            .unwrap();

        m.cancel(job.id).await.unwrap();
        let pending = m
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, Some(due + Duration::days(1)));
    }

    #[tokio::test]
    async fn repeated_cancels_skip_one_slot_each() {
        let (m, _) = manager();
        let mut due = t0() + Duration::days(7);
        let mut current = m
            .admit(JobSpec::scheduled(CompanyId::new(7), Some(due), Recurrence::Weekly))
            .await
            .unwrap();

        for _ in 0..3 {
            m.cancel(current.id).await.unwrap();
            let pending = m
                .list_jobs(&JobFilter {
                    status: Some(JobStatus::Pending),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(pending.len(), 1);
            assert_ne!(pending[0].id, current.id);
            assert_eq!(pending[0].scheduled_at, Some(due + Duration::days(7)));

            due += Duration::days(7);
            current = pending[0].clone();
        }
    }

    #[tokio::test]
    async fn disabled_schedule_completes_without_successor() {
        let (m, _) = manager();
        let job = m
            .admit(JobSpec::scheduled(CompanyId::new(7), None, Recurrence::Daily))
            .await
            .unwrap();
        m.claim().await.unwrap();
        m.set_schedule_active(job.id, false).await.unwrap();

        let done = m.report_success(job.id, 0).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(m.expand_due_schedules().await.unwrap().is_empty());
        assert_eq!(m.stats().await.unwrap().total, 1);

        // re-enabling lets the next scheduler tick resume the series
        m.set_schedule_active(job.id, true).await.unwrap();
        assert_eq!(m.expand_due_schedules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn enqueue_companies_skips_active_ones() {
        let (m, _) = manager();
        m.admit(company_7()).await.unwrap();

        let summary = m
            .enqueue_companies(&[CompanyId::new(1), CompanyId::new(7), CompanyId::new(1)], 5)
            .await
            .unwrap();
        assert_eq!(summary.admitted.len(), 1);
        assert_eq!(summary.skipped, vec![CompanyId::new(7), CompanyId::new(1)]);

        let err = m
            .enqueue_companies(&[CompanyId::new(2), CompanyId::new(404)], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec(_)));
        assert!(!m.store().has_active_job(CompanyId::new(2)).await.unwrap());
    }

    #[tokio::test]
    async fn stalled_claims_are_recovered_as_timeouts() {
        let (m, clock) = manager();
        let job = m.admit(company_7()).await.unwrap();
        m.claim().await.unwrap();

        clock.advance(Duration::minutes(30));
        assert!(m.recover_stalled().await.unwrap().is_empty());

        clock.advance(Duration::minutes(31));
        let recovered = m.recover_stalled().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, job.id);
        assert_eq!(recovered[0].status, JobStatus::Pending);
        assert_eq!(recovered[0].attempts, 1);
        assert_eq!(recovered[0].error_detail.as_deref(), Some(STALLED_DETAIL));
    }

    #[tokio::test]
    async fn orphaned_claims_are_recovered_at_startup_regardless_of_age() {
        let (m, clock) = manager();
        let job = m.admit(company_7()).await.unwrap();
        m.claim().await.unwrap();

        clock.advance(Duration::seconds(1));
        assert!(m.recover_stalled().await.unwrap().is_empty());

        let recovered = m.recover_orphaned().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, job.id);
        assert_eq!(recovered[0].status, JobStatus::Pending);
        assert_eq!(recovered[0].error_detail.as_deref(), Some(STALLED_DETAIL));

        // the company is claimable again once the backoff elapses
        clock.set(recovered[0].scheduled_at.unwrap());
        assert_eq!(m.claim().await.unwrap().unwrap().id, job.id);
    }

    #[tokio::test]
    async fn store_conflicts_map_to_invalid_state() {
        let (m, _) = manager();
        let job = m.admit(company_7()).await.unwrap();

        let err = m.report_success(job.id, 0).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState(_)));
        assert!(!err.is_fatal());
        assert!(QueueError::Store(JobStoreError::Unavailable("down".into())).is_fatal());
    }
}
