// src/orchestrator/preflight.rs

//! P0 target resolution and P1 pre-flight (spec §4.5, §4.6).

use super::{JobRunState, Orchestrator, PhaseOutcome};
use crate::bmc::BmcCredentials;
use crate::error::{EngineError, Result};
use crate::model::{HostCredentialsBundle, JobStatus, StepStatus, TargetScope};
use tracing::{info, warn};

/// P0: materialise the ordered list of eligible hosts from `target_scope`.
/// An empty resolved set fails the job.
pub(crate) async fn resolve_target_set(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
) -> Result<PhaseOutcome> {
    let step = orchestrator
        .record_step(state, "resolve_target_set", StepStatus::Running, None, None)
        .await;

    let mut hosts = match &state.job.target_scope {
        TargetScope::ServerIds(ids) => orchestrator.inventory.hosts_by_ids(ids).await?,
        TargetScope::ServerGroup(group) => orchestrator.inventory.hosts_by_group(group).await?,
        TargetScope::Cluster(cluster) => orchestrator.inventory.hosts_by_cluster(cluster).await?,
    };

    // Cluster targets additionally require the host to be online/connected.
    if matches!(state.job.target_scope, TargetScope::Cluster(_)) {
        let mut online = Vec::with_capacity(hosts.len());
        for host in hosts {
            let Some(hv) = &host.hypervisor else {
                online.push(host);
                continue;
            };
            let connected = orchestrator
                .hypervisor
                .live_host_status(&hv.host_id)
                .await
                .map(|s| s.connected)
                .unwrap_or(false);
            if connected {
                online.push(host);
            } else {
                warn!(host_id = %host.id, "excluding disconnected host from cluster target set");
            }
        }
        hosts = online;
    }

    if hosts.is_empty() {
        orchestrator
            .update_step(state, step, "resolve_target_set", StepStatus::Failed, None, Some("no eligible hosts".into()))
            .await;
        orchestrator
            .job_store
            .patch_job(state.job.id, Some(JobStatus::Failed), None)
            .await?;
        return Err(EngineError::NoEligibleHosts);
    }

    info!(count = hosts.len(), "resolved target host set");
    let names = hosts.iter().map(|h| h.id.clone()).collect::<Vec<_>>();
    orchestrator
        .update_step(
            state,
            step,
            "resolve_target_set",
            StepStatus::Completed,
            Some(serde_json::json!({ "hosts": names })),
            None,
        )
        .await;
    state.hosts = hosts;
    Ok(PhaseOutcome::Continue)
}

/// P1 pre-flight: per host, resolve credentials, probe connectivity,
/// optionally cache blocker/update results. Fails the job outright on any
/// connectivity failure. May early-exit "no updates needed".
pub(crate) async fn run_preflight(orchestrator: &Orchestrator, state: &mut JobRunState) -> Result<PhaseOutcome> {
    let step = orchestrator.record_step(state, "preflight", StepStatus::Running, None, None).await;
    let check_updates = orchestrator.config.check_updates_in_preflight
        || state.job.details.get_bool("check_updates_in_preflight", false);
    let firmware_source = state.job.details.firmware_source();
    let skipped = state.job.details.skipped_hosts();

    for index in 0..state.hosts.len() {
        let host = state.hosts[index].clone();
        if skipped.contains(&host.id) {
            continue;
        }

        let (username, password) = orchestrator.credentials.resolve(&host.id).await?;
        let creds = BmcCredentials { username: username.clone(), password: password.clone() };

        let reachable = orchestrator.bmc.ping(&host.bmc, &creds).await.unwrap_or(false);
        if !reachable {
            orchestrator
                .update_step(
                    state,
                    step,
                    "preflight",
                    StepStatus::Failed,
                    None,
                    Some(format!("host {} failed BMC connectivity probe", host.id)),
                )
                .await;
            orchestrator.job_store.patch_job(state.job.id, Some(JobStatus::Failed), None).await?;
            return Err(EngineError::Internal(format!("preflight connectivity probe failed for {}", host.id)));
        }

        let mut bundle = HostCredentialsBundle {
            username,
            password,
            validated: true,
            cached_blockers: None,
            cached_available_updates: None,
            needs_update: true,
        };

        if check_updates && matches!(firmware_source, crate::model::FirmwareSource::DellOnlineCatalog) {
            if let Some(catalog_url) = state.job.details.get_str("dell_catalog_url") {
                match orchestrator.bmc.check_available_catalog_updates(&host.bmc, &creds, catalog_url).await {
                    Ok(result) => {
                        bundle.needs_update = !result.available.is_empty();
                        bundle.cached_available_updates = Some(result.available);
                    }
                    Err(e) => {
                        warn!(host_id = %host.id, error = %e, "pre-flight catalog check failed, assuming update needed");
                    }
                }
            }
        }

        state.credentials.insert(host.id.clone(), bundle);
    }

    if check_updates && state.credentials.values().all(|c| !c.needs_update) {
        info!("all hosts already current, completing job without disabling HA");
        orchestrator
            .update_step(
                state,
                step,
                "preflight",
                StepStatus::Completed,
                Some(serde_json::json!({ "summary": "all hosts current" })),
                None,
            )
            .await;
        orchestrator.job_store.patch_job(state.job.id, Some(JobStatus::Completed), None).await?;
        return Ok(PhaseOutcome::Stop);
    }

    orchestrator.update_step(state, step, "preflight", StepStatus::Completed, None, None).await;
    Ok(PhaseOutcome::Continue)
}
