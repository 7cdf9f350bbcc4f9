// src/poller.rs

//! The main dispatch loop: polls the Job Store for dispatchable jobs and
//! runs each on its own task — one logical worker per in-flight job,
//! independent jobs progressing concurrently.
//!
//! Spawns one task per unit of work, tracks them in a `JoinSet`, and
//! drains `join_next()` so a panicking job task is observed rather than
//! silently lost.

use crate::job_store::SharedJobStore;
use crate::model::JobStatus;
use crate::orchestrator::Orchestrator;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs the poll loop until `shutdown` resolves. Each dispatchable job is
/// spawned once and tracked until it completes so the same job is never
/// started twice concurrently.
pub async fn run(
    job_store: SharedJobStore,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    info!(poll_interval_secs = poll_interval.as_secs(), "fleet orchestrator poller starting");

    let mut tasks: JoinSet<(Uuid, anyhow::Result<()>)> = JoinSet::new();
    let in_flight: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match job_store.fetch_pending_jobs().await {
                    Ok(jobs) => {
                        let mut in_flight_guard = in_flight.lock().await;
                        for job in jobs {
                            if job.status != JobStatus::Pending || in_flight_guard.contains(&job.id) {
                                continue;
                            }
                            in_flight_guard.insert(job.id);
                            let orchestrator = orchestrator.clone();
                            let job_id = job.id;
                            tasks.spawn(async move {
                                let result = orchestrator.run_job(job_id).await.map_err(anyhow::Error::from);
                                (job_id, result)
                            });
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to poll job store for pending jobs, will retry next tick");
                    }
                }
            }
            Some(joined) = tasks.join_next() => {
                let in_flight = in_flight.clone();
                match joined {
                    Ok((job_id, Ok(()))) => {
                        info!(%job_id, "job run finished");
                        in_flight.lock().await.remove(&job_id);
                    }
                    Ok((job_id, Err(e))) => {
                        error!(%job_id, error = %e, "job run ended in error");
                        in_flight.lock().await.remove(&job_id);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "job task panicked");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("shutdown signal received, draining in-flight job tasks");
                while tasks.join_next().await.is_some() {}
                break;
            }
        }
    }
}
