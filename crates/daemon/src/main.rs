use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{error, info, warn};

use fiscalq_core::SystemClock;
use fiscalq_infra::consultation::{CommandRunner, SqliteCompanyDirectory, SqliteConsultationSink};
use fiscalq_infra::{ConsultationWorker, FiscalqConfig, QueueManager, SchedulerLoop, SqliteJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FiscalqConfig::from_env().context("failed to load configuration")?;
    fiscalq_observability::init_with(&config.log_format);

    let store = SqliteJobStore::connect(&config.storage.database_url)
        .await
        .with_context(|| format!("failed to open job store at {}", config.storage.database_url))?;
    let directory = SqliteCompanyDirectory::from_pool(store.pool().clone())
        .await
        .context("failed to open company directory")?;
    let sink = SqliteConsultationSink::from_pool(store.pool().clone())
        .await
        .context("failed to open consultation sink")?;
    let runner = Arc::new(CommandRunner::from_config(&config.automation));

    let manager = Arc::new(QueueManager::new(
        store,
        directory,
        Arc::new(SystemClock),
        config.queue.clone(),
    ));

    // nothing runs yet, so any claim still open was left by a crash
    let recovered = manager
        .recover_orphaned()
        .await
        .context("failed to recover stalled jobs")?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "recovered jobs left processing by a previous run");
    }

    let mut scheduler = SchedulerLoop::new(manager.clone(), config.scheduler.clone()).spawn();
    let mut worker = ConsultationWorker::new(manager, runner, sink, config.worker.clone()).spawn();
    info!(
        database = %config.storage.database_url,
        runner = %config.automation.program.display(),
        "fiscalq daemon running"
    );

    let stopped = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            None
        }
        res = scheduler.finished() => Some(("scheduler", res)),
        res = worker.finished() => Some(("worker", res)),
    };

    if let Err(e) = worker.shutdown().await {
        error!(error = %e, "worker stopped with error");
    }
    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "scheduler stopped with error");
    }

    match stopped {
        None => {
            info!("fiscalq daemon stopped");
            Ok(())
        }
        Some((name, Err(e))) => Err(e).with_context(|| format!("{name} loop failed")),
        Some((name, Ok(()))) => bail!("{name} loop exited unexpectedly"),
    }
}
