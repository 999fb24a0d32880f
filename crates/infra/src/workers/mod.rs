//! Long-running loops: the scheduler and the consultation worker.
//!
//! Both are independent tokio tasks that talk to each other only through the job
//! store. Each is controlled through a handle; dropping the handle also stops it.

pub mod consultation_worker;
pub mod scheduler_loop;

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use consultation_worker::{ConsultationWorker, JobOutcome, WorkerHandle, WorkerStats};
pub use scheduler_loop::{SchedulerLoop, TickReport};

/// Why a loop stopped on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoopError {
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("loop task panicked: {0}")]
    Panicked(String),
}

/// Handle to control and join a background loop.
#[derive(Debug)]
pub struct LoopHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<Result<(), LoopError>>>,
}

impl LoopHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        shutdown: watch::Sender<bool>,
        join: JoinHandle<Result<(), LoopError>>,
    ) -> Self {
        Self {
            name: name.into(),
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the loop to stop by itself. Cancel-safe.
    pub async fn finished(&mut self) -> Result<(), LoopError> {
        let Some(join) = self.join.as_mut() else {
            return Ok(());
        };
        let result = join.await;
        self.join = None;
        match result {
            Ok(result) => result,
            Err(e) => Err(LoopError::Panicked(e.to_string())),
        }
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) -> Result<(), LoopError> {
        let _ = self.shutdown.send(true);
        self.finished().await
    }
}

/// Sleep for `duration` unless shutdown is requested first. Returns `true` on shutdown.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
