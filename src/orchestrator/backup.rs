// src/orchestrator/backup.rs

//! P4 batch SCP backup (spec §4.5 Phase 1): exports each host's server
//! configuration profile, optionally fanned out to a bounded worker pool.
//! A backup failure is a warning, never fatal to the job.

use super::{JobRunState, Orchestrator};
use crate::bmc::{BmcCredentials, ScpTarget};
use crate::model::StepStatus;
use tokio::sync::Semaphore;
use std::sync::Arc;
use tracing::warn;

pub(crate) async fn run(orchestrator: &Orchestrator, state: &mut JobRunState) {
    let step = orchestrator.record_step(state, "scp_backup", StepStatus::Running, None, None).await;

    let parallel = state.job.details.get_bool("parallel_backups", false);
    let max_parallel = state.job.details.get_u64("max_parallel_backups", orchestrator.config.max_parallel_backups as u64) as usize;

    let targets: Vec<(String, crate::model::BmcEndpoint, BmcCredentials)> = state
        .hosts
        .iter()
        .filter_map(|host| {
            let bundle = state.credentials.get(&host.id)?;
            Some((
                host.id.clone(),
                host.bmc.clone(),
                BmcCredentials { username: bundle.username.clone(), password: bundle.password.clone() },
            ))
        })
        .collect();

    let mut failures = Vec::new();

    if parallel && max_parallel > 1 {
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut tasks = Vec::with_capacity(targets.len());
        for (host_id, bmc_endpoint, creds) in targets {
            let semaphore = semaphore.clone();
            let bmc = orchestrator.bmc.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = bmc.export_scp(&bmc_endpoint, &creds, ScpTarget::All).await;
                (host_id, result)
            }));
        }
        for task in tasks {
            if let Ok((host_id, Err(e))) = task.await {
                failures.push((host_id, e.to_string()));
            }
        }
    } else {
        for (host_id, bmc_endpoint, creds) in targets {
            if let Err(e) = orchestrator.bmc.export_scp(&bmc_endpoint, &creds, ScpTarget::All).await {
                failures.push((host_id, e.to_string()));
            }
        }
    }

    for (host_id, error) in &failures {
        warn!(host_id, error, "SCP backup failed, continuing without blocking the job");
    }

    let status = if failures.is_empty() { StepStatus::Completed } else { StepStatus::Warning };
    orchestrator
        .update_step(
            state,
            step,
            "scp_backup",
            status,
            Some(serde_json::json!({ "failures": failures })),
            None,
        )
        .await;
}
