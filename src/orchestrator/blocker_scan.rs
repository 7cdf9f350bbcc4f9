// src/orchestrator/blocker_scan.rs

//! P3 comprehensive blocker scan (spec §4.5 Phase 1.5): runs after HA
//! disable, the "point of no return". Applies pre-supplied resolutions,
//! auto-skips for scheduled jobs when configured, otherwise pauses.

use super::{JobRunState, Orchestrator, PhaseOutcome};
use crate::model::{JobStatus, StepStatus};
use serde_json::Map;
use std::collections::HashMap;
use tracing::{info, warn};

pub(crate) async fn run(orchestrator: &Orchestrator, state: &mut JobRunState) -> crate::error::Result<PhaseOutcome> {
    let step = orchestrator
        .record_step(state, "blocker_scan", StepStatus::Running, None, None)
        .await;

    let scheduled = state.job.details.get_bool("scheduled_execution", false);
    let auto_skip = orchestrator.config.scheduled_auto_skip_blocked_hosts
        || state.job.details.get_bool("scheduled_auto_skip_blocked_hosts", false);

    let mut unresolved: HashMap<String, Vec<crate::model::MaintenanceBlocker>> = HashMap::new();
    let mut newly_skipped: Vec<String> = Vec::new();

    for host in state.hosts.clone() {
        let Some(hv) = &host.hypervisor else { continue };
        let blockers = match orchestrator.hypervisor.scan_maintenance_blockers(&hv.host_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(host_id = %host.id, error = %e, "blocker scan failed for host, treating as no blockers found");
                continue;
            }
        };
        if blockers.is_empty() {
            continue;
        }

        if state.job.details.resolutions_for_host(&host.id).is_some() {
            info!(host_id = %host.id, "pre-supplied resolution present for blocked host, will apply in per-host loop");
            continue;
        }

        if scheduled && auto_skip {
            warn!(host_id = %host.id, "scheduled job auto-skipping host with unresolvable blockers");
            newly_skipped.push(host.id.clone());
            continue;
        }

        unresolved.insert(host.id.clone(), blockers);
    }

    if !newly_skipped.is_empty() {
        let mut skip_list = state.job.details.skipped_hosts();
        skip_list.extend(newly_skipped);
        let mut patch = Map::new();
        patch.insert(
            "skipped_hosts".into(),
            serde_json::to_value(skip_list.into_iter().collect::<Vec<_>>()).unwrap(),
        );
        orchestrator.job_store.patch_job(state.job.id, None, Some(patch.clone())).await?;
        state.job.details.merge(patch);
    }

    if !unresolved.is_empty() {
        let blocker_map = serde_json::to_value(&unresolved).unwrap_or(serde_json::Value::Null);
        warn!(count = unresolved.len(), "pausing job for operator intervention on unresolved maintenance blockers");

        // The journal-side copy is the recovery safety net if the job-status
        // write below fails (spec §4.5).
        orchestrator
            .update_step(
                state,
                step,
                "blocker_scan",
                StepStatus::Paused,
                Some(serde_json::json!({ "maintenance_blockers": blocker_map.clone() })),
                None,
            )
            .await;

        let mut patch = Map::new();
        patch.insert("maintenance_blockers".into(), blocker_map);
        orchestrator
            .job_store
            .patch_job(state.job.id, Some(JobStatus::Paused), Some(patch))
            .await?;
        return Ok(PhaseOutcome::Stop);
    }

    orchestrator.update_step(state, step, "blocker_scan", StepStatus::Completed, None, None).await;
    Ok(PhaseOutcome::Continue)
}
