use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fiscalq_queue::CompanyDirectory;

use crate::config::SchedulerConfig;
use crate::jobs::{JobStore, QueueError, QueueManager};

use super::{LoopError, LoopHandle};

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: usize,
    pub spawned: usize,
}

/// Periodic loop that recovers stalled claims and spawns due occurrences.
///
/// It never executes consultations; that is the worker's job.
pub struct SchedulerLoop<S, D> {
    manager: Arc<QueueManager<S, D>>,
    config: SchedulerConfig,
}

impl<S: JobStore, D: CompanyDirectory> SchedulerLoop<S, D> {
    pub fn new(manager: Arc<QueueManager<S, D>>, config: SchedulerConfig) -> Self {
        Self { manager, config }
    }

    /// Run a single tick. Safe to repeat: expansion is idempotent.
    pub async fn tick(&self) -> Result<TickReport, QueueError> {
        let recovered = match self.manager.recover_stalled().await {
            Ok(jobs) => jobs.len(),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "stalled job recovery failed");
                0
            }
        };

        let spawned = self.manager.expand_due_schedules().await?.len();
        Ok(TickReport { recovered, spawned })
    }

    /// Spawn the loop on the current tokio runtime. The first tick runs immediately.
    pub fn spawn(self) -> LoopHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        LoopHandle::new("scheduler", shutdown_tx, join)
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), LoopError> {
        info!(tick_secs = self.config.tick_interval.as_secs(), "scheduler loop started");
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(report) if report == TickReport::default() => {
                    debug!("scheduler tick: nothing to do")
                }
                Ok(report) => info!(
                    recovered = report.recovered,
                    spawned = report.spawned,
                    "scheduler tick"
                ),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "scheduler loop stopping: job store unavailable");
                    return Err(LoopError::StoreUnavailable(e.to_string()));
                }
                Err(e) => warn!(error = %e, "scheduler tick failed"),
            }
        }

        info!("scheduler loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use fiscalq_core::{CompanyId, JobId, ManualClock};
    use fiscalq_queue::{CreatedBy, Credentials, Job, JobSpec, JobStatus, NewJob, Recurrence};

    use crate::config::QueueConfig;
    use crate::consultation::InMemoryCompanyDirectory;
    use crate::jobs::{
        InMemoryJobStore, JobFilter, JobStats, JobStoreError, Transition,
    };

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 7, 7, 0, 0).unwrap()
    }

    fn directory() -> InMemoryCompanyDirectory {
        let dir = InMemoryCompanyDirectory::new();
        dir.add(
            CompanyId::new(1),
            Credentials {
                login: "l".to_string(),
                password: "p".to_string(),
                state_registration: "ie".to_string(),
            },
        );
        dir
    }

    fn scheduler_with(
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
    ) -> SchedulerLoop<Arc<InMemoryJobStore>, InMemoryCompanyDirectory> {
        let manager = QueueManager::new(store, directory(), clock, QueueConfig::default());
        SchedulerLoop::new(
            Arc::new(manager),
            SchedulerConfig {
                tick_interval: StdDuration::from_millis(10),
            },
        )
    }

    /// Insert a weekly job and force it to `completed` behind the manager's back.
    async fn completed_weekly(store: &InMemoryJobStore, at: DateTime<Utc>) -> Job {
        let job = store
            .insert(JobSpec::scheduled(CompanyId::new(1), None, Recurrence::Weekly).into_new_job(3, t0()))
            .await
            .unwrap();
        store.claim_next(t0()).await.unwrap();
        store
            .update_status(job.id, Transition::Complete { at })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_ticks_spawn_exactly_one_successor() {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        let completed_at = t0() + Duration::minutes(2);
        clock.set(completed_at);
        completed_weekly(&store, completed_at).await;

        let scheduler = scheduler_with(store.clone(), clock);
        assert_eq!(scheduler.tick().await.unwrap().spawned, 1);
        assert_eq!(scheduler.tick().await.unwrap().spawned, 0);

        let pending = store
            .list(&JobFilter {
                status: Some(JobStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scheduled_at, Some(completed_at + Duration::days(7)));
        assert_eq!(pending[0].created_by, CreatedBy::Recurrence);
    }

    #[tokio::test]
    async fn tick_recovers_stalled_claims() {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        store
            .insert(JobSpec::immediate(CompanyId::new(1)).into_new_job(3, t0()))
            .await
            .unwrap();
        store.claim_next(t0()).await.unwrap();

        clock.advance(Duration::hours(2));
        let scheduler = scheduler_with(store.clone(), clock);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report, TickReport { recovered: 1, spawned: 0 });
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn spawned_loop_expands_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        completed_weekly(&store, t0()).await;

        let handle = scheduler_with(store.clone(), clock).spawn();
        for _ in 0..200 {
            if store.stats().await.unwrap().pending == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(handle.name(), "scheduler");
        handle.shutdown().await.unwrap();
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    /// A store whose backing storage is gone.
    struct DownStore;

    fn down<T>() -> Result<T, JobStoreError> {
        Err(JobStoreError::Unavailable("disk detached".to_string()))
    }

    #[async_trait]
    impl JobStore for DownStore {
        async fn insert(&self, _: NewJob) -> Result<Job, JobStoreError> {
            down()
        }
        async fn get(&self, _: JobId) -> Result<Job, JobStoreError> {
            down()
        }
        async fn update_status(&self, _: JobId, _: Transition) -> Result<Job, JobStoreError> {
            down()
        }
        async fn claim_next(&self, _: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
            down()
        }
        async fn list_ready(&self, _: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            down()
        }
        async fn list_due_schedules(&self, _: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            down()
        }
        async fn spawn_occurrence(&self, _: JobId, _: NewJob) -> Result<Option<Job>, JobStoreError> {
            down()
        }
        async fn set_schedule_active(&self, _: JobId, _: bool) -> Result<Job, JobStoreError> {
            down()
        }
        async fn has_active_job(&self, _: CompanyId) -> Result<bool, JobStoreError> {
            down()
        }
        async fn list_stalled(&self, _: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
            down()
        }
        async fn list(&self, _: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
            down()
        }
        async fn stats(&self) -> Result<JobStats, JobStoreError> {
            down()
        }
    }

    #[tokio::test]
    async fn unavailable_store_stops_the_loop() {
        let manager = QueueManager::new(
            DownStore,
            directory(),
            Arc::new(ManualClock::new(t0())),
            QueueConfig::default(),
        );
        let mut handle = SchedulerLoop::new(
            Arc::new(manager),
            SchedulerConfig {
                tick_interval: StdDuration::from_millis(10),
            },
        )
        .spawn();

        let result = tokio::time::timeout(StdDuration::from_secs(5), handle.finished())
            .await
            .expect("loop should stop by itself");
        assert!(matches!(result, Err(LoopError::StoreUnavailable(_))));
    }
}
