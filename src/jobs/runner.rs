//! Cron-driven job execution
//!
//! Jobs register with a seconds-precision cron expression and a group
//! name. A per-group mutex, built once at startup, keeps a slow job
//! from overlapping itself when the next tick fires; a panic boundary
//! turns a crashing job into a logged internal error.

use crate::config::PodIdentity;
use crate::error::{MailError, MailResult};
use crate::jobs::leader::LeaderElector;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lease object name shared by all replicas
const LEASE_NAME: &str = "mailstack-jobs";

/// A job body; invoked on every tick the group lock can be taken
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, MailResult<()>> + Send + Sync>;

/// One registered job
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub group: String,
    pub schedule: String,
    pub run: JobFn,
}

/// Cron runner coordinated across replicas by a distributed lease
pub struct JobRunner {
    jobs: Vec<JobSpec>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Register a job. `schedule` is a 6-field cron expression with
    /// seconds; jobs sharing `group` never run concurrently in-process.
    pub fn register<F>(&mut self, name: &str, group: &str, schedule: &str, job: F)
    where
        F: Fn() -> BoxFuture<'static, MailResult<()>> + Send + Sync + 'static,
    {
        self.jobs.push(JobSpec {
            name: name.to_string(),
            group: group.to_string(),
            schedule: schedule.to_string(),
            run: Arc::new(job),
        });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Run until cancelled. Inside a cluster the cron scheduler only
    /// runs while this replica holds the lease; outside a cluster
    /// election is skipped and scheduling is local.
    pub async fn run(self, pod: &PodIdentity, cancel: CancellationToken) -> MailResult<()> {
        // The lock map is constructed once here and immutable afterwards
        let mut locks: HashMap<String, Arc<Mutex<()>>> = HashMap::new();
        for job in &self.jobs {
            locks
                .entry(job.group.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())));
        }
        let locks = Arc::new(locks);

        if !pod.in_cluster() {
            info!("no pod identity, scheduling jobs locally without election");
            let mut scheduler = self.start_scheduler(&locks).await?;
            cancel.cancelled().await;
            scheduler
                .shutdown()
                .await
                .map_err(|e| MailError::internal(format!("scheduler shutdown: {}", e)))?;
            return Ok(());
        }

        let namespace = pod
            .namespace
            .as_deref()
            .ok_or_else(|| MailError::internal("pod namespace missing"))?;
        let identity = pod
            .name
            .as_deref()
            .ok_or_else(|| MailError::internal("pod name missing"))?;

        let client = kube::Client::try_default()
            .await
            .map_err(|e| MailError::internal(format!("kube client: {}", e)))?;
        let elector = LeaderElector::new(client, namespace, LEASE_NAME, identity);
        let mut leadership = elector.run(cancel.child_token());

        let mut scheduler: Option<JobScheduler> = None;
        loop {
            tokio::select! {
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_leader = *leadership.borrow_and_update();
                    if is_leader && scheduler.is_none() {
                        info!("became leader, starting cron scheduler");
                        scheduler = Some(self.start_scheduler(&locks).await?);
                    } else if !is_leader {
                        if let Some(mut active) = scheduler.take() {
                            // In-flight jobs finish; no new ticks fire
                            info!("lost leadership, stopping cron scheduler");
                            if let Err(e) = active.shutdown().await {
                                warn!(error = %e, "scheduler shutdown failed");
                            }
                        } else {
                            debug!("not leader");
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        if let Some(mut active) = scheduler.take() {
            if let Err(e) = active.shutdown().await {
                warn!(error = %e, "scheduler shutdown failed");
            }
        }
        Ok(())
    }

    async fn start_scheduler(
        &self,
        locks: &Arc<HashMap<String, Arc<Mutex<()>>>>,
    ) -> MailResult<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| MailError::internal(format!("scheduler init: {}", e)))?;

        for spec in &self.jobs {
            let job_name = spec.name.clone();
            let schedule = spec.schedule.clone();
            let spec = spec.clone();
            let locks = Arc::clone(locks);

            let job = Job::new_async(schedule.as_str(), move |_uuid, _handle| {
                let spec = spec.clone();
                let locks = Arc::clone(&locks);
                Box::pin(async move {
                    run_job(&spec, &locks).await;
                })
            })
            .map_err(|e| MailError::internal(format!("invalid cron for {}: {}", job_name, e)))?;

            scheduler
                .add(job)
                .await
                .map_err(|e| MailError::internal(format!("scheduler add: {}", e)))?;
        }

        scheduler
            .start()
            .await
            .map_err(|e| MailError::internal(format!("scheduler start: {}", e)))?;
        info!(jobs = self.jobs.len(), "cron scheduler running");
        Ok(scheduler)
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// One tick: take the group lock (skip if the previous run is still
/// going), then run the body behind a panic boundary.
async fn run_job(spec: &JobSpec, locks: &HashMap<String, Arc<Mutex<()>>>) {
    let Some(lock) = locks.get(&spec.group) else {
        error!(job = %spec.name, group = %spec.group, "job group has no lock, skipping");
        return;
    };

    let Ok(_guard) = lock.try_lock() else {
        warn!(job = %spec.name, group = %spec.group, "previous run still active, skipping tick");
        return;
    };

    debug!(job = %spec.name, "job tick");
    let body = (spec.run)();
    match tokio::spawn(body).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(job = %spec.name, error = %e, kind = e.kind().as_str(), "job failed");
        }
        Err(join_error) if join_error.is_panic() => {
            // Recovered panic becomes an internal error with the payload
            let e = MailError::internal(format!("job panicked: {}", join_error));
            error!(job = %spec.name, error = %e, "job panicked");
        }
        Err(join_error) => {
            error!(job = %spec.name, error = %join_error, "job task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_lock_skips_overlapping_runs() {
        let mut locks = HashMap::new();
        locks.insert("g".to_string(), Arc::new(Mutex::new(())));

        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let spec = JobSpec {
            name: "count".into(),
            group: "g".into(),
            schedule: "* * * * * *".into(),
            run: Arc::new(move || {
                let counter = Arc::clone(&counter_clone);
                Box::pin(async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            }),
        };

        // Hold the lock across a tick: the job must be skipped
        let lock = Arc::clone(&locks["g"]);
        let guard = lock.lock().await;
        run_job(&spec, &locks).await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 0);
        drop(guard);

        run_job(&spec, &locks).await;
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let mut locks = HashMap::new();
        locks.insert("g".to_string(), Arc::new(Mutex::new(())));

        let spec = JobSpec {
            name: "boom".into(),
            group: "g".into(),
            schedule: "* * * * * *".into(),
            run: Arc::new(|| Box::pin(async { panic!("job blew up") })),
        };

        // Must not propagate the panic
        run_job(&spec, &locks).await;
    }

    #[test]
    fn test_register_builds_specs() {
        let mut runner = JobRunner::new();
        runner.register("heartbeat", "heartbeat", "0 * * * * *", || {
            Box::pin(async { Ok(()) })
        });
        runner.register("cleanup", "maintenance", "0 0 4 * * *", || {
            Box::pin(async { Ok(()) })
        });
        assert_eq!(runner.job_count(), 2);
    }
}
