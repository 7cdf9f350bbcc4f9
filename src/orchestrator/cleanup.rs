// src/orchestrator/cleanup.rs

//! Cancellation cleanup (spec §4.7): unwinds maintenance/HA/BMC job-queue
//! state and writes the cancellation record. Every step here logs and
//! continues on failure rather than raising — cleanup must never itself
//! leave the job stuck.

use super::{JobRunState, Orchestrator};
use crate::bmc::BmcCredentials;
use crate::model::JobStatus;
use std::time::Duration;
use tracing::{error, warn};

pub(crate) async fn on_cancel(orchestrator: &Orchestrator, state: &mut JobRunState) {
    let job_id = state.job.id;

    // 1. Note the in-flight firmware risk, if any.
    if state.cleanup.firmware_in_progress {
        state
            .cleanup
            .record_action("firmware application was in flight at cancellation; host state is unverified");
        warn!(%job_id, "cancelling while firmware apply is in flight; leaving BMC job state for operator review");
    }

    // 2. Exit maintenance on every host we placed into it.
    for host_id in state.cleanup.hosts_in_maintenance.clone() {
        let Some(host) = state.hosts.iter().find(|h| h.id == host_id) else { continue };
        let Some(hv) = &host.hypervisor else { continue };
        match orchestrator.hypervisor.exit_maintenance(&hv.host_id).await {
            Ok(()) => state.cleanup.record_action("exit_maintenance"),
            Err(e) => warn!(%job_id, host_id, error = %e, "failed to exit maintenance during cancellation cleanup"),
        }
    }
    state.cleanup.hosts_in_maintenance.clear();

    // 3. Restore HA if we disabled it. Failure here is the worst outcome.
    orchestrator.re_enable_ha_if_needed(state).await;
    let ha_restore_failed = state
        .cleanup
        .cleanup_actions
        .iter()
        .any(|a| a.starts_with("ha_restore_failed"));
    if ha_restore_failed {
        error!(%job_id, "HA restore failed during cancellation cleanup");
    }

    // 4. Clear the BMC job queue of the currently-processing host, if any.
    if let Some(host_id) = state.cleanup.currently_processing.clone() {
        if let Some(host) = state.hosts.iter().find(|h| h.id == host_id).cloned() {
            if let Some(bundle) = state.credentials.get(&host_id).cloned() {
                let creds = BmcCredentials { username: bundle.username, password: bundle.password };
                match orchestrator.bmc.clear_stale_jobs(&host.bmc, &creds, Duration::from_secs(0)).await {
                    Ok(()) => state.cleanup.record_action("clear_job_queue"),
                    Err(e) => warn!(%job_id, host_id, error = %e, "failed to clear BMC job queue during cancellation cleanup"),
                }
            }
        }
    }
    state.cleanup.currently_processing = None;

    // 5. Write the cancellation record.
    let mut patch = serde_json::Map::new();
    patch.insert(
        "cleanup_actions".into(),
        serde_json::to_value(&state.cleanup.cleanup_actions).unwrap_or_default(),
    );
    patch.insert("ha_restore_failed".into(), serde_json::Value::Bool(ha_restore_failed));
    let _ = orchestrator
        .job_store
        .patch_job(job_id, Some(JobStatus::Cancelled), Some(patch))
        .await;
}
