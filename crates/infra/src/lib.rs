//! Infrastructure layer: job storage, the queue manager, the scheduler and worker
//! loops, and the adapters for the consultation collaborators.

pub mod config;
pub mod consultation;
pub mod jobs;
pub mod workers;

pub use config::{
    AutomationConfig, ConfigError, FiscalqConfig, QueueConfig, SchedulerConfig, StorageConfig,
    WorkerConfig,
};
pub use jobs::{
    EnqueueSummary, InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError, QueueError,
    QueueManager, SqliteJobStore, Transition,
};
pub use workers::{ConsultationWorker, LoopError, LoopHandle, SchedulerLoop, WorkerHandle};
