// src/orchestrator/mod.rs

//! The rolling-update state machine: a linear sequence with explicit
//! cancellation checkpoints, phases P0 through P7.
//!
//! A single long async function proceeds step by step, each step logged,
//! with state captured in a small struct threaded through rather than a
//! `Mutex` — there is exactly one task per job, so there is no concurrent
//! access to guard against.

mod backup;
mod blocker_scan;
mod cleanup;
mod host_cycle;
mod ordering;
mod preflight;

use crate::bmc::BmcAdapter;
use crate::config::OrchestratorConfig;
use crate::credentials::SharedCredentialsProvider;
use crate::error::Result;
use crate::hypervisor::HypervisorAdapter;
use crate::inventory::SharedHostInventory;
use crate::job_store::SharedJobStore;
use crate::journal::SharedWorkflowJournal;
use crate::metrics;
use crate::model::{CleanupState, HostCredentialsBundle, Job, JobStatus, StepStatus, TargetHost, TargetScope};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    pub job_store: SharedJobStore,
    pub inventory: SharedHostInventory,
    pub credentials: SharedCredentialsProvider,
    pub bmc: Arc<dyn BmcAdapter>,
    pub hypervisor: Arc<dyn HypervisorAdapter>,
    pub journal: SharedWorkflowJournal,
    pub config: OrchestratorConfig,
}

/// Per-job mutable state threaded through the phase functions. Lives only
/// for the duration of one `run_job` call; never shared across tasks.
pub(crate) struct JobRunState {
    pub job: Job,
    pub hosts: Vec<TargetHost>,
    pub credentials: HashMap<String, HostCredentialsBundle>,
    pub cleanup: CleanupState,
    pub cluster_name: Option<String>,
    step_number: u32,
}

impl JobRunState {
    fn new(job: Job) -> Self {
        let cluster_name = match &job.target_scope {
            TargetScope::Cluster(name) => Some(name.clone()),
            _ => None,
        };
        Self {
            job,
            hosts: Vec::new(),
            credentials: HashMap::new(),
            cleanup: CleanupState::default(),
            cluster_name,
            step_number: 0,
        }
    }

    fn next_step(&mut self) -> u32 {
        self.step_number += 1;
        self.step_number
    }
}

/// Outcome of a phase that may ask the caller to stop processing the job
/// (a pause for operator intervention, or a terminal status already set).
pub(crate) enum PhaseOutcome {
    Continue,
    Stop,
}

impl Orchestrator {
    /// Runs a single job end to end. Spec §4.6: P0 target resolution, P0.5
    /// ordering, P1 pre-flight, P2 HA disable, P3 blocker scan, P4 backups,
    /// P5 per-host loop, P6 HA re-enable, P7 terminal status.
    pub async fn run_job(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .job_store
            .fetch_job(job_id)
            .await?
            .ok_or_else(|| crate::error::EngineError::JobStore(format!("job {job_id} vanished")))?;

        let mut state = JobRunState::new(job);
        metrics::JOBS_RUNNING.inc();
        self.job_store.patch_job(job_id, Some(JobStatus::Running), None).await?;

        let result = self.run_job_inner(&mut state).await;

        metrics::JOBS_RUNNING.dec();
        if let Err(e) = &result {
            error!(%job_id, error = %e, "job run ended in an unhandled error");
            self.fail_job(&mut state, "unhandled_error", &e.to_string()).await;
        }
        result
    }

    async fn run_job_inner(&self, state: &mut JobRunState) -> Result<()> {
        let job_id = state.job.id;

        // --- P0: resolve target set ---
        if let PhaseOutcome::Stop = preflight::resolve_target_set(self, state).await? {
            return Ok(());
        }

        // --- P0.5: order adjustment ---
        ordering::reorder_hosts(self, state).await;

        // --- P1: pre-flight ---
        match preflight::run_preflight(self, state).await? {
            PhaseOutcome::Stop => return Ok(()),
            PhaseOutcome::Continue => {}
        }

        // --- P2: HA disable ---
        if let Some(cluster) = state.cluster_name.clone() {
            self.disable_ha(state, &cluster).await?;
        }

        // --- P3: comprehensive blocker scan ---
        match blocker_scan::run(self, state).await? {
            PhaseOutcome::Stop => return Ok(()),
            PhaseOutcome::Continue => {}
        }

        // --- P4: batch SCP backup ---
        if state.job.details.get_bool("backup_scp", true) {
            backup::run(self, state).await;
        }

        // --- P5: sequential per-host loop ---
        let start_index = state
            .job
            .details
            .resume_from_host()
            .and_then(|host_id| state.hosts.iter().position(|h| h.id == host_id))
            .unwrap_or(0);
        if start_index > 0 {
            info!(%job_id, start_index, "resuming per-host loop from resume_from_host, earlier hosts already handled by a prior run");
        }

        let mut any_host_updated = false;
        let mut any_host_failed = false;
        for index in start_index..state.hosts.len() {
            match host_cycle::run_host(self, state, index).await? {
                host_cycle::HostOutcome::Cancelled => return Ok(()),
                host_cycle::HostOutcome::InterventionPause => {
                    self.re_enable_ha_if_needed(state).await;
                    return Ok(());
                }
                host_cycle::HostOutcome::Updated => any_host_updated = true,
                host_cycle::HostOutcome::Skipped => {}
                host_cycle::HostOutcome::Failed => {
                    any_host_failed = true;
                    metrics::HOSTS_TOTAL.with_label_values(&["failed"]).inc();
                }
            }
        }

        // --- P6: HA re-enable ---
        self.re_enable_ha_if_needed(state).await;

        // --- P7: terminal status ---
        let continue_on_failure = state.job.details.get_bool("continue_on_failure", false);
        let final_status = if any_host_failed && !continue_on_failure {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        metrics::JOBS_TOTAL
            .with_label_values(&[if final_status == JobStatus::Completed { "completed" } else { "failed" }])
            .inc();
        let _ = any_host_updated;
        self.job_store.patch_job(job_id, Some(final_status), None).await?;
        Ok(())
    }

    pub(crate) async fn record_step(
        &self,
        state: &mut JobRunState,
        name: &str,
        status: StepStatus,
        details: Option<Value>,
        error: Option<String>,
    ) -> u32 {
        let step_number = state.next_step();
        self.journal
            .record_step(state.job.id, step_number, name, status, details, error)
            .await;
        step_number
    }

    /// Re-records the current step number (an upsert on the same row, the
    /// "paused -> resumed" transition from spec §4.4).
    pub(crate) async fn update_step(
        &self,
        state: &JobRunState,
        step_number: u32,
        name: &str,
        status: StepStatus,
        details: Option<Value>,
        error: Option<String>,
    ) {
        self.journal
            .record_step(state.job.id, step_number, name, status, details, error)
            .await;
    }

    async fn disable_ha(&self, state: &mut JobRunState, cluster: &str) -> Result<()> {
        let step = self.record_step(state, "disable_ha", StepStatus::Running, None, None).await;
        match self.hypervisor.disable_cluster_ha(cluster).await {
            Ok(result) if result.success => {
                state.cleanup.ha_was_disabled = true;
                state.cleanup.prior_ha_config = Some(result.as_snapshot());
                state.cleanup.record_action("disabled cluster HA");
                self.update_step(state, step, "disable_ha", StepStatus::Completed, None, None).await;
            }
            Ok(result) => {
                warn!(cluster, ft_vm = ?result.ft_vm, "HA disable blocked by fault-tolerant VM, proceeding with HA enabled");
                self.update_step(
                    state,
                    step,
                    "disable_ha",
                    StepStatus::Warning,
                    Some(serde_json::json!({ "blocked_by_ft_vm": result.ft_vm })),
                    None,
                )
                .await;
            }
            Err(e) => {
                warn!(cluster, error = %e, "HA disable request failed, proceeding with HA enabled");
                self.update_step(state, step, "disable_ha", StepStatus::Warning, None, Some(e.to_string())).await;
            }
        }
        Ok(())
    }

    /// Always attempted if this run disabled HA: at the normal end of P5,
    /// on an intervention pause, and on every exception path (spec §4.6 P6).
    pub(crate) async fn re_enable_ha_if_needed(&self, state: &mut JobRunState) {
        if !state.cleanup.ha_was_disabled {
            return;
        }
        let Some(cluster) = state.cluster_name.clone() else { return };
        let Some(snapshot) = state.cleanup.prior_ha_config.clone() else { return };

        metrics::HA_REENABLE_ATTEMPTS_TOTAL.inc();
        let step = self.record_step(state, "reenable_ha", StepStatus::Running, None, None).await;
        match self
            .hypervisor
            .enable_cluster_ha(&cluster, snapshot.host_monitoring, snapshot.admission_control)
            .await
        {
            Ok(()) => {
                state.cleanup.ha_was_disabled = false;
                state.cleanup.record_action("enable_cluster_ha");
                self.update_step(state, step, "reenable_ha", StepStatus::Completed, None, None).await;
            }
            Err(e) => {
                metrics::HA_RESTORE_FAILURES_TOTAL.inc();
                error!(cluster, error = %e, "failed to restore cluster HA after this job disabled it");
                state.cleanup.record_action(format!("ha_restore_failed: {e}"));
                self.update_step(state, step, "reenable_ha", StepStatus::Failed, None, Some(e.to_string())).await;
            }
        }
    }

    async fn fail_job(&self, state: &mut JobRunState, step_name: &str, error: &str) {
        self.re_enable_ha_if_needed(state).await;
        self.record_step(state, step_name, StepStatus::Failed, None, Some(error.to_string())).await;
        metrics::JOBS_TOTAL.with_label_values(&["failed"]).inc();
        let _ = self
            .job_store
            .patch_job(state.job.id, Some(JobStatus::Failed), None)
            .await;
    }
}
