use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fiscalq_queue::{
    CompanyDirectory, ConsultationFailure, ConsultationRunner, FailureKind, Job, JobStatus, Message,
};

use crate::config::WorkerConfig;
use crate::consultation::ConsultationSink;
use crate::jobs::{JobStore, QueueError, QueueManager};

use super::{idle, LoopError, LoopHandle};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub paused: bool,
    pub uptime_secs: u64,
}

/// Where a processed job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying,
    Failed,
    /// The outcome could not be recorded (the job changed state meanwhile).
    Dropped,
}

impl JobOutcome {
    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => JobOutcome::Completed,
            JobStatus::Pending => JobOutcome::Retrying,
            JobStatus::Failed => JobOutcome::Failed,
            JobStatus::Processing => JobOutcome::Dropped,
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    inner: LoopHandle,
    paused: watch::Sender<bool>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop claiming after the in-flight job, until [`Self::resume`].
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.paused = self.is_paused();
        stats
    }

    pub async fn finished(&mut self) -> Result<(), LoopError> {
        self.inner.finished().await
    }

    /// Request graceful shutdown; the in-flight job is completed first.
    pub async fn shutdown(self) -> Result<(), LoopError> {
        self.inner.shutdown().await
    }
}

/// The single execution slot: claims jobs and runs one consultation at a time.
pub struct ConsultationWorker<S, D, R, K> {
    manager: Arc<QueueManager<S, D>>,
    runner: Arc<R>,
    sink: K,
    config: WorkerConfig,
}

impl<S, D, R, K> ConsultationWorker<S, D, R, K>
where
    S: JobStore,
    D: CompanyDirectory,
    R: ConsultationRunner,
    K: ConsultationSink,
{
    pub fn new(manager: Arc<QueueManager<S, D>>, runner: Arc<R>, sink: K, config: WorkerConfig) -> Self {
        Self {
            manager,
            runner,
            sink,
            config,
        }
    }

    /// Claim and process one job. `None` when nothing is ready.
    pub async fn process_next(&self) -> Result<Option<(Job, JobOutcome)>, QueueError> {
        let Some(job) = self.manager.claim().await? else {
            return Ok(None);
        };

        info!(
            worker = %self.config.name,
            job_id = %job.id,
            company_id = %job.company_id,
            attempts = job.attempts,
            "claimed job"
        );

        let started = Instant::now();
        let result = match self.consult(&job).await {
            Ok(messages) => self.record_messages(&job, &messages).await.map(|()| messages.len()),
            Err(failure) => Err(failure),
        };

        let reported = match result {
            Ok(retrieved) => self.manager.report_success(job.id, retrieved).await,
            Err(failure) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    kind = %failure.kind,
                    detail = %failure.detail,
                    "consultation failed"
                );
                self.manager
                    .report_failure(job.id, failure.kind, failure.detail)
                    .await
            }
        };

        let outcome = match reported {
            Ok(updated) => JobOutcome::from_status(updated.status),
            // stall recovery or an operator got there first
            Err(QueueError::InvalidState(reason)) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    %reason,
                    "outcome not recorded; a re-run replaces any messages stored for this job"
                );
                JobOutcome::Dropped
            }
            Err(e) => return Err(e),
        };

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job processed"
        );
        Ok(Some((job, outcome)))
    }

    /// Look up credentials and run the consultation, bounded by the timeout.
    ///
    /// Runner panics and overruns become classified failures.
    async fn consult(&self, job: &Job) -> Result<Vec<Message>, ConsultationFailure> {
        let credentials = match self.manager.directory().credentials(job.company_id).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                return Err(ConsultationFailure::new(
                    FailureKind::Rejected,
                    format!("company {} is unknown or inactive", job.company_id),
                ));
            }
            Err(e) => return Err(ConsultationFailure::new(FailureKind::Unknown, e.to_string())),
        };

        let runner = Arc::clone(&self.runner);
        let timeout = self.config.consultation_timeout;
        let task = tokio::spawn(async move { runner.run_consultation(&credentials, timeout).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ConsultationFailure::new(
                FailureKind::Unknown,
                format!("consultation crashed: {join_err}"),
            )),
            Err(_) => {
                abort.abort();
                Err(ConsultationFailure::new(
                    FailureKind::Timeout,
                    format!("consultation exceeded {}s", timeout.as_secs_f64()),
                ))
            }
        }
    }

    async fn record_messages(&self, job: &Job, messages: &[Message]) -> Result<(), ConsultationFailure> {
        self.sink
            .store(job, messages, self.manager.now())
            .await
            .map_err(|e| ConsultationFailure::new(FailureKind::Unknown, format!("failed to store results: {e}")))
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (paused_tx, paused_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let name = self.config.name.clone();
        let join = tokio::spawn(self.run(shutdown_rx, paused_rx, stats.clone()));

        WorkerHandle {
            inner: LoopHandle::new(name, shutdown_tx, join),
            paused: paused_tx,
            stats,
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        mut paused: watch::Receiver<bool>,
        stats: Arc<Mutex<WorkerStats>>,
    ) -> Result<(), LoopError> {
        info!(worker = %self.config.name, "consultation worker started");
        let start_time = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            stats.lock().unwrap().uptime_secs = start_time.elapsed().as_secs();

            if *paused.borrow_and_update() {
                debug!(worker = %self.config.name, "worker paused");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.process_next().await {
                Ok(Some((_, outcome))) => {
                    {
                        let mut s = stats.lock().unwrap();
                        s.jobs_processed += 1;
                        match outcome {
                            JobOutcome::Completed => s.jobs_succeeded += 1,
                            JobOutcome::Retrying => s.jobs_retried += 1,
                            JobOutcome::Failed => s.jobs_failed += 1,
                            JobOutcome::Dropped => {}
                        }
                    }
                    if idle(&mut shutdown, self.config.inter_job_pause).await {
                        break;
                    }
                }
                Ok(None) => {
                    if idle(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(worker = %self.config.name, error = %e, "worker stopping: job store unavailable");
                    return Err(LoopError::StoreUnavailable(e.to_string()));
                }
                Err(e) => {
                    warn!(worker = %self.config.name, error = %e, "worker iteration failed");
                    if idle(&mut shutdown, self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.config.name, "consultation worker stopped");
        Ok(())
    }
}
