//! Server assembly: wires repositories, supervisors, the outbound
//! dispatcher, and the scheduled-job runner, then waits for shutdown

use crate::config::Config;
use crate::error::{MailError, MailResult};
use crate::events::{EventBus, LoggingEventBus};
use crate::inbound::InboundProcessor;
use crate::jobs::JobRunner;
use crate::outbound::OutboundDispatcher;
use crate::repository::{self, Repositories};
use crate::status::StatusRegistry;
use crate::storage::{BlobStore, MemoryBlobStore};
use crate::sync::{FolderSynchronizer, SupervisorSet};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown budget for all IMAP sessions
const IMAP_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);
/// Graceful shutdown budget for the job runner
const JOBS_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
/// Orphaned references older than this are expired by the cleanup job
const ORPHAN_TTL_DAYS: i64 = 30;

/// Run the relay until the cancellation token fires, then shut down
/// within the budgets.
pub async fn run(config: Config, cancel: CancellationToken) -> MailResult<()> {
    let pool = repository::connect(
        &config.database.mailstack_dsn,
        config.database.max_connections,
    )
    .await?;
    let repos = Repositories::new(pool);

    let registry = StatusRegistry::new();
    let bus: Arc<dyn EventBus> = Arc::new(LoggingEventBus::new());
    let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

    let processor = InboundProcessor::new(repos.clone(), Arc::clone(&blobs), Arc::clone(&bus));
    let synchronizer = FolderSynchronizer::new(repos.clone(), processor, registry.clone());

    let mut supervisors = SupervisorSet::new(cancel.child_token());
    supervisors
        .start(&repos, &synchronizer, &registry, &config.sync)
        .await?;

    let dispatcher = Arc::new(OutboundDispatcher::new(
        repos.clone(),
        Arc::clone(&blobs),
        Arc::clone(&bus),
        cancel.child_token(),
    ));
    let dispatcher_handle = tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.run().await }
    });

    let runner = build_job_runner(&config, repos.clone(), registry.clone(), dispatcher);
    let jobs_handle = tokio::spawn({
        let pod = config.pod.clone();
        let jobs_cancel = cancel.child_token();
        async move { runner.run(&pod, jobs_cancel).await }
    });

    info!(port = config.http.port, "mailstack server running");
    cancel.cancelled().await;
    info!("shutdown requested");

    supervisors.shutdown(IMAP_SHUTDOWN_BUDGET).await;

    if tokio::time::timeout(JOBS_SHUTDOWN_BUDGET, jobs_handle)
        .await
        .is_err()
    {
        warn!("job runner did not stop within the shutdown budget");
    }
    if let Err(e) = dispatcher_handle.await {
        warn!(error = %e, "dispatcher task ended abnormally");
    }

    info!("shutdown complete");
    Ok(())
}

/// Register the singleton background jobs against the configured
/// cron expressions.
fn build_job_runner(
    config: &Config,
    repos: Repositories,
    registry: StatusRegistry,
    dispatcher: Arc<OutboundDispatcher>,
) -> JobRunner {
    let mut runner = JobRunner::new();

    let heartbeat_registry = registry;
    runner.register(
        "heartbeat",
        "heartbeat",
        &config.cron.heartbeat,
        move || {
            let registry = heartbeat_registry.clone();
            Box::pin(async move {
                let snapshot = registry.snapshot().await;
                let connected = snapshot.values().filter(|h| h.connected()).count();
                info!(
                    mailboxes = snapshot.len(),
                    connected,
                    "heartbeat"
                );
                Ok(())
            })
        },
    );

    runner.register(
        "scheduled_send",
        "outbound",
        &config.cron.scheduled_send,
        move || {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                let promoted = dispatcher.dispatch_due().await?;
                if promoted > 0 {
                    info!(promoted, "scheduled-send tick dispatched emails");
                }
                Ok(())
            })
        },
    );

    let orphan_repos = repos;
    runner.register(
        "orphan_cleanup",
        "maintenance",
        &config.cron.orphan_cleanup,
        move || {
            let repos = orphan_repos.clone();
            Box::pin(async move {
                let cutoff = Utc::now() - ChronoDuration::days(ORPHAN_TTL_DAYS);
                let removed = repos.orphans.delete_older_than(cutoff).await?;
                if removed > 0 {
                    info!(removed, "expired unresolved orphan references");
                }
                Ok(())
            })
        },
    );

    runner
}

/// Run schema migrations against the mailstack database
pub async fn migrate(config: &Config) -> MailResult<()> {
    let pool = repository::connect(&config.database.mailstack_dsn, 2).await?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| MailError::internal(format!("migration failed: {}", e)))?;
    info!("migrations applied");
    Ok(())
}
