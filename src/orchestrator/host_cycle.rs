// src/orchestrator/host_cycle.rs

//! P5 sequential per-host loop, steps (a) through (l) of spec §4.6.

use super::{JobRunState, Orchestrator};
use crate::bmc::{ApplyTime, BmcCredentials, RecoveryAction, ScpTarget};
use crate::error::{EngineError, Result};
use crate::hypervisor::probe;
use crate::model::{BlockerSeverity, FirmwareSource, JobStatus, PowerOffStrategy, StepStatus};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

pub(crate) enum HostOutcome {
    Cancelled,
    InterventionPause,
    Updated,
    Skipped,
    Failed,
}

struct HostCycleError {
    step_name: String,
    message: String,
}

impl HostCycleError {
    fn new(step_name: &str, message: impl Into<String>) -> Self {
        Self { step_name: step_name.to_string(), message: message.into() }
    }
}

pub(crate) async fn run_host(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    index: usize,
) -> Result<HostOutcome> {
    let host = state.hosts[index].clone();
    let job_id = state.job.id;

    // (a) Cancellation checkpoint.
    let current = orchestrator
        .job_store
        .fetch_job(job_id)
        .await?
        .ok_or_else(|| EngineError::JobStore(format!("job {job_id} vanished mid-run")))?;
    if current.status == JobStatus::Cancelled {
        info!(host_id = %host.id, "cancellation observed before host start");
        super::cleanup::on_cancel(orchestrator, state).await;
        return Ok(HostOutcome::Cancelled);
    }
    if current.details.graceful_cancel() {
        info!(host_id = %host.id, "graceful cancel observed before host start, stopping cleanly");
        orchestrator.re_enable_ha_if_needed(state).await;
        let mut patch = serde_json::Map::new();
        patch.insert("graceful_cancel".into(), serde_json::Value::Bool(true));
        patch.insert("stopped_before_host".into(), serde_json::json!(index + 1));
        orchestrator.job_store.patch_job(job_id, Some(JobStatus::Cancelled), Some(patch)).await?;
        return Ok(HostOutcome::Cancelled);
    }

    if current.details.skipped_hosts().contains(&host.id) {
        info!(host_id = %host.id, "host is in skipped_hosts, skipping without contact");
        orchestrator
            .record_step(state, &format!("skipped:{}", host.id), StepStatus::Skipped, None, None)
            .await;
        return Ok(HostOutcome::Skipped);
    }

    state.cleanup.currently_processing = Some(host.id.clone());
    let Some(creds) = state.credentials.get(&host.id).cloned() else {
        return Ok(HostOutcome::Skipped);
    };
    let bmc_creds = BmcCredentials { username: creds.username.clone(), password: creds.password.clone() };

    let result = run_host_phases(orchestrator, state, index, &bmc_creds).await;

    state.cleanup.currently_processing = None;
    state.cleanup.firmware_in_progress = false;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(cycle_err) => {
            let continue_on_failure = state.job.details.get_bool("continue_on_failure", false);
            if continue_on_failure {
                warn!(host_id = %host.id, step = %cycle_err.step_name, error = %cycle_err.message, "host failed, continuing per continue_on_failure");
                orchestrator
                    .record_step(
                        state,
                        &format!("host_failed:{}", host.id),
                        StepStatus::Failed,
                        None,
                        Some(cycle_err.message),
                    )
                    .await;
                Ok(HostOutcome::Failed)
            } else {
                warn!(host_id = %host.id, step = %cycle_err.step_name, error = %cycle_err.message, "host failed, pausing for operator intervention");
                orchestrator.re_enable_ha_if_needed(state).await;
                orchestrator
                    .record_step(
                        state,
                        &format!("host_failed:{}", host.id),
                        StepStatus::Paused,
                        Some(serde_json::json!({ "failed_step": cycle_err.step_name })),
                        Some(cycle_err.message),
                    )
                    .await;
                orchestrator.job_store.patch_job(job_id, Some(JobStatus::Paused), None).await?;
                Ok(HostOutcome::InterventionPause)
            }
        }
    }
}

async fn run_host_phases(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    index: usize,
    bmc_creds: &BmcCredentials,
) -> std::result::Result<HostOutcome, HostCycleError> {
    let host = state.hosts[index].clone();

    // (b) Per-host pre-update check.
    let needs_update = state
        .credentials
        .get(&host.id)
        .map(|c| c.needs_update)
        .unwrap_or(true);

    if !needs_update {
        info!(host_id = %host.id, "host already current, skipping straight to verify/exit-maintenance");
        verify_host(orchestrator, state, &host, bmc_creds).await.map_err(|e| HostCycleError::new("verify", e.to_string()))?;
        if state.cleanup.hosts_in_maintenance.contains(&host.id) {
            exit_maintenance(orchestrator, state, &host).await.map_err(|e| HostCycleError::new("exit_maintenance", e.to_string()))?;
        }
        power_on_tracked_vms(orchestrator, state, &host).await;
        maybe_wait_for_rebalance(orchestrator, state).await.map_err(|e| HostCycleError::new("rebalance_wait", e.to_string()))?;
        return Ok(HostOutcome::Skipped);
    }

    // (c) Enter maintenance.
    enter_maintenance(orchestrator, state, &host, bmc_creds)
        .await
        .map_err(|e| HostCycleError::new("enter_maintenance", e.to_string()))?;

    // (d) Apply firmware.
    state.cleanup.firmware_in_progress = true;
    let reboot_required = apply_firmware(orchestrator, state, &host, bmc_creds)
        .await
        .map_err(|e| HostCycleError::new("apply_firmware", e.to_string()))?;

    // Mid-host cancellation checkpoint: firmware has just been applied and
    // the host may be about to reboot. Unlike the checkpoint at the top of
    // `run_host`, this one still finds the host in maintenance with its BMC
    // job queue worth clearing, so cancellation observed here runs the full
    // five-step cleanup rather than a bare "stop before next host".
    if is_cancelled(orchestrator, state).await.map_err(|e| HostCycleError::new("cancellation_check", e.to_string()))? {
        super::cleanup::on_cancel(orchestrator, state).await;
        return Ok(HostOutcome::Cancelled);
    }

    // (e) Reboot wait.
    if reboot_required {
        reboot_wait(orchestrator, state, &host).await.map_err(|e| HostCycleError::new("reboot_wait", e.to_string()))?;
    }

    // (f) Verify.
    verify_host(orchestrator, state, &host, bmc_creds).await.map_err(|e| HostCycleError::new("verify", e.to_string()))?;

    // (g) Exit maintenance.
    exit_maintenance(orchestrator, state, &host).await.map_err(|e| HostCycleError::new("exit_maintenance", e.to_string()))?;

    // (h) Power on tracked VMs.
    power_on_tracked_vms(orchestrator, state, &host).await;

    // (i) Rebalance wait.
    maybe_wait_for_rebalance(orchestrator, state).await.map_err(|e| HostCycleError::new("rebalance_wait", e.to_string()))?;

    // (j) Refresh hypervisor session for the next host (no adapter-level op
    // is named for this in spec §4.3; logged as a checkpoint only).
    info!(host_id = %host.id, "refreshing hypervisor session before next host");

    // (k) Clear firmware_in_progress / current-host cleanup handles (done by caller).

    Ok(HostOutcome::Updated)
}

async fn is_cancelled(orchestrator: &Orchestrator, state: &JobRunState) -> Result<bool> {
    let current = orchestrator
        .job_store
        .fetch_job(state.job.id)
        .await?
        .ok_or_else(|| EngineError::JobStore(format!("job {} vanished mid-run", state.job.id)))?;
    Ok(current.status == JobStatus::Cancelled)
}

async fn enter_maintenance(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<()> {
    let Some(hv) = &host.hypervisor else { return Ok(()) };
    let step = orchestrator
        .record_step(state, &format!("enter_maintenance:{}", host.id), StepStatus::Running, None, None)
        .await;

    if let Some(resolution) = state.job.details.resolutions_for_host(&host.id) {
        if let Some(vm_names) = resolution.get("power_off_vms").and_then(|v| v.as_array()) {
            let names: Vec<String> = vm_names.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
            if !names.is_empty() {
                let result = orchestrator.hypervisor.power_off_vms(&hv.host_id, &names, true).await?;
                state.cleanup.powered_off_vms.entry(host.id.clone()).or_default().extend(result.vms_powered_off);
            }
        }
    }

    let timeout = Duration::from_secs(
        state.job.details.get_u64("maintenance_timeout", orchestrator.config.maintenance_timeout_secs),
    );
    let mut result = orchestrator.hypervisor.enter_maintenance(&hv.host_id, timeout).await?;

    if !result.success {
        let auto_power_off = state.job.details.get_bool("auto_power_off_enabled", false);
        let blockers = result.maintenance_blockers.clone().unwrap_or_default();
        if auto_power_off && !blockers.is_empty() {
            let strategy = state.job.details.power_off_strategy();
            let targets: Vec<String> = blockers
                .iter()
                .filter(|b| {
                    b.severity == BlockerSeverity::Critical
                        && match strategy {
                            PowerOffStrategy::NonMigratable => b.reason.is_non_migratable(),
                            PowerOffStrategy::All => {
                                b.reason != crate::model::BlockerReason::HypervisorControlPlaneVm
                            }
                        }
                })
                .map(|b| b.vm_name.clone())
                .collect();

            if !targets.is_empty() {
                let power_off = orchestrator.hypervisor.power_off_vms(&hv.host_id, &targets, true).await?;
                state.cleanup.powered_off_vms.entry(host.id.clone()).or_default().extend(power_off.vms_powered_off);
                result = orchestrator.hypervisor.enter_maintenance(&hv.host_id, timeout).await?;
            }
        }
    }

    if !result.success {
        orchestrator
            .update_step(
                state,
                step,
                &format!("enter_maintenance:{}", host.id),
                StepStatus::Failed,
                Some(serde_json::json!({ "blockers": result.maintenance_blockers })),
                Some("failed to enter maintenance mode".into()),
            )
            .await;
        return Err(EngineError::Internal(format!("host {} could not enter maintenance", host.id)));
    }

    state.cleanup.hosts_in_maintenance.push(host.id.clone());
    orchestrator
        .update_step(
            state,
            step,
            &format!("enter_maintenance:{}", host.id),
            StepStatus::Completed,
            Some(serde_json::json!({ "vms_evacuated": result.vms_evacuated })),
            None,
        )
        .await;
    let _ = bmc_creds;
    Ok(())
}

/// Returns `true` if the apply step determined a reboot is required.
async fn apply_firmware(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<bool> {
    let step = orchestrator
        .record_step(state, &format!("apply_firmware:{}", host.id), StepStatus::Running, None, None)
        .await;

    if state.job.details.get_bool("clear_stale_jobs_before_update", true) {
        let max_age_hours = state.job.details.get_u64("stale_job_max_age_hours", 24);
        orchestrator.bmc.clear_stale_jobs(&host.bmc, bmc_creds, Duration::from_secs(max_age_hours * 3600)).await?;
    }

    let (reboot_required, recovery_attempts) = match state.job.details.firmware_source() {
        FirmwareSource::DellOnlineCatalog => apply_from_catalog(orchestrator, state, host, bmc_creds).await?,
        FirmwareSource::LocalRepository => (apply_from_local_repository(orchestrator, state, host, bmc_creds).await?, 0),
        FirmwareSource::Manual => (apply_manual(orchestrator, state, host, bmc_creds).await?, 0),
    };

    orchestrator
        .update_step(
            state,
            step,
            &format!("apply_firmware:{}", host.id),
            StepStatus::Completed,
            Some(serde_json::json!({ "reboot_required": reboot_required, "recovery_attempts": recovery_attempts })),
            None,
        )
        .await;
    Ok(reboot_required)
}

fn stall_recovery_action_from(action: Option<&str>) -> RecoveryAction {
    match action {
        Some("clear_queue") => RecoveryAction::ClearQueue,
        Some("none") => RecoveryAction::None,
        _ => RecoveryAction::Reboot,
    }
}

async fn apply_from_catalog(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<(bool, u32)> {
    let catalog_url = state
        .job
        .details
        .get_str("dell_catalog_url")
        .ok_or_else(|| EngineError::Config("firmware_source=dell_online_catalog requires dell_catalog_url".into()))?
        .to_string();
    let max_passes = state.job.details.get_u64("max_catalog_passes", orchestrator.config.max_catalog_passes as u64).max(1);
    let stall_timeout = Duration::from_secs(state.job.details.get_u64("stall_timeout_minutes", 15) * 60);
    let max_stall_retries = state.job.details.get_u64("max_stall_retries", 2) as u32;
    let recovery_action = stall_recovery_action_from(state.job.details.get_str("stall_recovery_action"));

    let mut reboot_required = false;
    let mut recovery_attempts = 0u32;
    for pass in 0..max_passes {
        let result = orchestrator.bmc.initiate_catalog_update(&host.bmc, bmc_creds, &catalog_url).await?;
        if let Some(job_id) = &result.job_id {
            let job_result = orchestrator
                .bmc
                .wait_for_job_with_recovery(
                    &host.bmc,
                    bmc_creds,
                    job_id,
                    Duration::from_secs(2700),
                    stall_timeout,
                    max_stall_retries,
                    recovery_action,
                )
                .await?;
            recovery_attempts += job_result.recovery_attempts;
            let message = job_result.message.unwrap_or_default();
            if crate::bmc::redfish::is_no_applicable_updates_message(&message) {
                info!(host_id = %host.id, pass, "catalog update reports no applicable updates");
                break;
            }
        }

        orchestrator.bmc.wait_for_all_jobs_complete(&host.bmc, bmc_creds, Duration::from_secs(2700), Duration::from_secs(15)).await?;
        reboot_required = true;
        orchestrator.bmc.graceful_reboot(&host.bmc, bmc_creds).await?;

        let rescan = orchestrator.bmc.check_available_catalog_updates(&host.bmc, bmc_creds, &catalog_url).await?;
        if rescan.available.is_empty() {
            break;
        }
    }
    Ok((reboot_required, recovery_attempts))
}

async fn apply_from_local_repository(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<bool> {
    let component_filter = state.job.details.get_str_list("component_filter");
    let catalog_url = state.job.details.get_str("dell_catalog_url").unwrap_or_default().to_string();
    let applicable = orchestrator.bmc.check_available_catalog_updates(&host.bmc, bmc_creds, &catalog_url).await?;

    let mut applied_any = false;
    for update in applicable.available {
        if !component_filter.is_empty() && !component_filter.contains(&update.name) {
            continue;
        }
        match orchestrator
            .bmc
            .initiate_simple_update(&host.bmc, bmc_creds, &update.name, ApplyTime::OnReset)
            .await
        {
            Ok(_task_uri) => applied_any = true,
            Err(e) => warn!(host_id = %host.id, component = %update.name, error = %e, "local repository package not applicable, continuing"),
        }
    }
    Ok(applied_any)
}

async fn apply_manual(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<bool> {
    let firmware_uri = state
        .job
        .details
        .get_str("firmware_uri")
        .ok_or_else(|| EngineError::Config("firmware_source=manual requires firmware_uri".into()))?
        .to_string();
    orchestrator.bmc.initiate_simple_update(&host.bmc, bmc_creds, &firmware_uri, ApplyTime::OnReset).await?;
    Ok(true)
}

async fn reboot_wait(orchestrator: &Orchestrator, state: &mut JobRunState, host: &crate::model::TargetHost) -> Result<()> {
    let step = orchestrator
        .record_step(state, &format!("reboot_wait:{}", host.id), StepStatus::Running, None, None)
        .await;

    sleep(Duration::from_secs(180)).await;

    let bmc_deadline = tokio::time::Instant::now() + Duration::from_secs(1800);
    let Some(bundle) = state.credentials.get(&host.id).cloned() else {
        return Err(EngineError::Internal("missing credentials for reboot wait".into()));
    };
    let creds = BmcCredentials { username: bundle.username, password: bundle.password };
    loop {
        if orchestrator.bmc.ping(&host.bmc, &creds).await.unwrap_or(false) {
            break;
        }
        if tokio::time::Instant::now() >= bmc_deadline {
            orchestrator
                .update_step(state, step, &format!("reboot_wait:{}", host.id), StepStatus::Failed, None, Some("BMC never became reachable after reboot".into()))
                .await;
            return Err(EngineError::Timeout(Duration::from_secs(1800)));
        }
        sleep(Duration::from_secs(10)).await;
    }

    let Some(hv) = &host.hypervisor else {
        orchestrator.update_step(state, step, &format!("reboot_wait:{}", host.id), StepStatus::Completed, None, None).await;
        return Ok(());
    };

    let phase2_start = tokio::time::Instant::now();
    let phase2_deadline = phase2_start + Duration::from_secs(1800);
    let mut vcenter_fallback_used = false;
    loop {
        let elapsed = phase2_start.elapsed();
        let connect_timeout = probe::escalating_timeout(elapsed);
        if probe::probe_with_fallback(hv.management_address, hv.fallback_address, connect_timeout).await {
            break;
        }

        if elapsed >= Duration::from_secs(600) {
            let connected = orchestrator
                .hypervisor
                .live_host_status(&hv.host_id)
                .await
                .map(|s| s.connected)
                .unwrap_or(false);
            if connected {
                vcenter_fallback_used = true;
                break;
            }
        }

        if tokio::time::Instant::now() >= phase2_deadline {
            orchestrator
                .update_step(state, step, &format!("reboot_wait:{}", host.id), StepStatus::Failed, None, Some("no sign of life on hypervisor surface after reboot".into()))
                .await;
            return Err(EngineError::Timeout(Duration::from_secs(1800)));
        }
        sleep(Duration::from_secs(10)).await;
    }

    orchestrator
        .update_step(
            state,
            step,
            &format!("reboot_wait:{}", host.id),
            StepStatus::Completed,
            Some(serde_json::json!({ "vcenter_fallback_used": vcenter_fallback_used })),
            None,
        )
        .await;
    Ok(())
}

async fn verify_host(
    orchestrator: &Orchestrator,
    state: &mut JobRunState,
    host: &crate::model::TargetHost,
    bmc_creds: &BmcCredentials,
) -> Result<()> {
    let step = orchestrator.record_step(state, &format!("verify:{}", host.id), StepStatus::Running, None, None).await;
    let inventory = orchestrator.bmc.firmware_inventory(&host.bmc, bmc_creds).await?;
    orchestrator
        .update_step(
            state,
            step,
            &format!("verify:{}", host.id),
            StepStatus::Completed,
            Some(serde_json::json!({ "firmware_inventory": inventory })),
            None,
        )
        .await;
    Ok(())
}

async fn exit_maintenance(orchestrator: &Orchestrator, state: &mut JobRunState, host: &crate::model::TargetHost) -> Result<()> {
    let Some(hv) = &host.hypervisor else { return Ok(()) };
    let step = orchestrator.record_step(state, &format!("exit_maintenance:{}", host.id), StepStatus::Running, None, None).await;

    let _ = orchestrator.hypervisor.wait_for_connected(&hv.host_id, Duration::from_secs(300)).await;
    orchestrator.hypervisor.exit_maintenance(&hv.host_id).await?;
    state.cleanup.hosts_in_maintenance.retain(|id| id != &host.id);

    orchestrator.update_step(state, step, &format!("exit_maintenance:{}", host.id), StepStatus::Completed, None, None).await;
    Ok(())
}

async fn power_on_tracked_vms(orchestrator: &Orchestrator, state: &mut JobRunState, host: &crate::model::TargetHost) {
    let Some(hv) = &host.hypervisor else { return };
    let Some(vm_names) = state.cleanup.powered_off_vms.remove(&host.id) else { return };
    if vm_names.is_empty() {
        return;
    }

    let step = orchestrator.record_step(state, &format!("power_on:{}", host.id), StepStatus::Running, None, None).await;
    match orchestrator.hypervisor.power_on_vms(&hv.host_id, &vm_names, Duration::from_secs(300)).await {
        Ok(result) => {
            orchestrator
                .update_step(
                    state,
                    step,
                    &format!("power_on:{}", host.id),
                    StepStatus::Completed,
                    Some(serde_json::json!({ "powered_on": result.vms_powered_on, "failed": result.vms_failed })),
                    None,
                )
                .await;
        }
        Err(e) => {
            warn!(host_id = %host.id, error = %e, "powering on VMs after maintenance failed; operator needs capacity back regardless");
            orchestrator
                .update_step(state, step, &format!("power_on:{}", host.id), StepStatus::Warning, None, Some(e.to_string()))
                .await;
        }
    }
}

async fn maybe_wait_for_rebalance(orchestrator: &Orchestrator, state: &mut JobRunState) -> Result<()> {
    let Some(cluster) = state.cluster_name.clone() else { return Ok(()) };
    if !state.job.details.get_bool("rebalance_wait_enabled", true) {
        return Ok(());
    }

    let timeout = Duration::from_secs(
        state.job.details.get_u64("rebalance_wait_timeout", orchestrator.config.rebalance_wait_timeout_secs),
    );
    let quiet_period = Duration::from_secs(
        state.job.details.get_u64("rebalance_quiet_period", orchestrator.config.rebalance_quiet_period_secs),
    );

    let step = orchestrator.record_step(state, "rebalance_wait", StepStatus::Running, None, None).await;
    let result = orchestrator.hypervisor.wait_for_rebalance(&cluster, timeout, quiet_period).await?;
    if !result.success {
        orchestrator
            .update_step(state, step, "rebalance_wait", StepStatus::Failed, None, Some("cluster migrations did not settle in time".into()))
            .await;
        return Err(EngineError::Timeout(timeout));
    }
    orchestrator
        .update_step(state, step, "rebalance_wait", StepStatus::Completed, Some(serde_json::json!({ "waited_seconds": result.waited_seconds })), None)
        .await;
    Ok(())
}
