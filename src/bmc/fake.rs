// src/bmc/fake.rs

//! In-memory `BmcAdapter`, the same kind of stand-in `InMemoryHypervisorAdapter`
//! provides for `HypervisorAdapter`. Keyed by BMC address rather than a host
//! id, since `BmcEndpoint` only carries an address/username pair. Scripted
//! per-host so tests can drive firmware inventories, catalog job lifecycles
//! (including a stalling job for the recovery path), and job-queue/export
//! call counts without any network I/O.

use super::{
    ApplyTime, BmcAdapter, BmcCredentials, CatalogUpdateResult, CheckUpdatesResult,
    FirmwareComponent, JobResult, JobState, RecoveryAction, ScpExport, ScpTarget, TaskResult,
    TaskState,
};
use crate::error::Result;
use crate::model::{AvailableUpdate, BmcEndpoint};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A two-phase handshake a test uses to observe the fake reaching a specific
/// call before letting it continue, without any wall-clock sleeping.
pub struct PauseHandle {
    pub reached: Arc<Notify>,
    resume: Arc<Notify>,
}

impl PauseHandle {
    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

#[derive(Clone)]
struct CatalogJobScript {
    terminal_state: JobState,
    message: Option<String>,
    /// How many times the job reports a stall before going terminal, capped
    /// by the caller's own `max_stall_retries`.
    required_recoveries: u32,
}

#[derive(Default)]
pub struct InMemoryBmcAdapter {
    reachable: DashMap<IpAddr, bool>,
    firmware: DashMap<IpAddr, Vec<FirmwareComponent>>,
    catalog_update_queue: DashMap<IpAddr, Mutex<VecDeque<Vec<AvailableUpdate>>>>,
    catalog_job_queue: DashMap<IpAddr, Mutex<VecDeque<String>>>,
    catalog_jobs: DashMap<String, CatalogJobScript>,
    recovery_log: DashMap<String, Vec<RecoveryAction>>,
    reboots: DashMap<IpAddr, u32>,
    stale_jobs_cleared: DashMap<IpAddr, u32>,
    scp_exports: DashMap<IpAddr, u32>,
    clear_stale_jobs_failures: DashMap<IpAddr, ()>,
    pause_before_clear_stale_jobs: DashMap<IpAddr, (Arc<Notify>, Arc<Notify>)>,
}

impl InMemoryBmcAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, addr: IpAddr, reachable: bool) {
        self.reachable.insert(addr, reachable);
    }

    pub fn set_firmware_inventory(&self, addr: IpAddr, components: Vec<FirmwareComponent>) {
        self.firmware.insert(addr, components);
    }

    /// Queues one response for the next `check_available_catalog_updates`
    /// call against `addr`. Calls beyond the queue's length see an empty
    /// list, the "catalog fully applied" terminal case.
    pub fn queue_catalog_updates(&self, addr: IpAddr, updates: Vec<AvailableUpdate>) {
        self.catalog_update_queue
            .entry(addr)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(updates);
    }

    /// Queues the job id `initiate_catalog_update` hands back for its next
    /// call against `addr`.
    pub fn queue_catalog_job(&self, addr: IpAddr, job_id: impl Into<String>) {
        self.catalog_job_queue
            .entry(addr)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .push_back(job_id.into());
    }

    /// Scripts `job_id`'s resolution for `wait_for_job_with_recovery`: it
    /// reports a stall `required_recoveries` times before reaching
    /// `terminal_state`.
    pub fn script_job(
        &self,
        job_id: impl Into<String>,
        required_recoveries: u32,
        terminal_state: JobState,
        message: Option<&str>,
    ) {
        self.catalog_jobs.insert(
            job_id.into(),
            CatalogJobScript { terminal_state, message: message.map(str::to_string), required_recoveries },
        );
    }

    pub fn recovery_actions_for(&self, job_id: &str) -> Vec<RecoveryAction> {
        self.recovery_log.get(job_id).map(|r| r.clone()).unwrap_or_default()
    }

    pub fn reboot_count(&self, addr: IpAddr) -> u32 {
        self.reboots.get(&addr).map(|r| *r).unwrap_or(0)
    }

    pub fn stale_jobs_cleared_count(&self, addr: IpAddr) -> u32 {
        self.stale_jobs_cleared.get(&addr).map(|r| *r).unwrap_or(0)
    }

    pub fn scp_export_count(&self, addr: IpAddr) -> u32 {
        self.scp_exports.get(&addr).map(|r| *r).unwrap_or(0)
    }

    /// Makes `clear_stale_jobs` against `addr` fail every call.
    pub fn set_clear_stale_jobs_failure(&self, addr: IpAddr) {
        self.clear_stale_jobs_failures.insert(addr, ());
    }

    /// Makes the next `clear_stale_jobs` call against `addr` block until the
    /// returned handle's `resume` is called, signalling `reached` first so
    /// the caller knows the call is parked there.
    pub fn register_pause_before_clear_stale_jobs(&self, addr: IpAddr) -> PauseHandle {
        let reached = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        self.pause_before_clear_stale_jobs.insert(addr, (reached.clone(), resume.clone()));
        PauseHandle { reached, resume }
    }
}

#[async_trait]
impl BmcAdapter for InMemoryBmcAdapter {
    async fn firmware_inventory(&self, host: &BmcEndpoint, _creds: &BmcCredentials) -> Result<Vec<FirmwareComponent>> {
        Ok(self.firmware.get(&host.address).map(|r| r.clone()).unwrap_or_default())
    }

    async fn initiate_catalog_update(
        &self,
        host: &BmcEndpoint,
        _creds: &BmcCredentials,
        _catalog_url: &str,
    ) -> Result<CatalogUpdateResult> {
        let job_id = self
            .catalog_job_queue
            .get(&host.address)
            .and_then(|q| q.lock().pop_front());
        Ok(CatalogUpdateResult {
            job_id: job_id.clone(),
            task_uri: job_id.map(|id| format!("/redfish/v1/TaskService/Tasks/{id}")),
            no_applicable_updates: false,
        })
    }

    async fn initiate_simple_update(
        &self,
        _host: &BmcEndpoint,
        _creds: &BmcCredentials,
        firmware_uri: &str,
        _apply_time: ApplyTime,
    ) -> Result<String> {
        Ok(format!("/redfish/v1/TaskService/Tasks/simple-update-{firmware_uri}"))
    }

    async fn wait_for_task(
        &self,
        _host: &BmcEndpoint,
        _creds: &BmcCredentials,
        _task_uri: &str,
        _timeout: Duration,
        _poll_interval: Duration,
    ) -> Result<TaskResult> {
        Ok(TaskResult { state: TaskState::Completed, percent_complete: 100, message: None })
    }

    async fn wait_for_job_with_recovery(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        job_id: &str,
        _timeout: Duration,
        _stall_timeout: Duration,
        max_stall_retries: u32,
        recovery_action: RecoveryAction,
    ) -> Result<JobResult> {
        let Some(script) = self.catalog_jobs.get(job_id).map(|r| r.clone()) else {
            return Ok(JobResult {
                job_id: job_id.to_string(),
                state: JobState::Completed,
                percent_complete: 100,
                message: None,
                recovery_attempts: 0,
            });
        };

        let attempts = script.required_recoveries.min(max_stall_retries);
        let mut log = Vec::with_capacity(attempts as usize);
        for _ in 0..attempts {
            log.push(recovery_action);
            match recovery_action {
                RecoveryAction::Reboot => {
                    self.graceful_reboot(host, creds).await?;
                }
                RecoveryAction::ClearQueue => {
                    self.clear_stale_jobs(host, creds, Duration::from_secs(0)).await?;
                }
                RecoveryAction::None => {}
            }
        }
        self.recovery_log.insert(job_id.to_string(), log);

        Ok(JobResult {
            job_id: job_id.to_string(),
            state: script.terminal_state,
            percent_complete: 100,
            message: script.message.clone(),
            recovery_attempts: attempts,
        })
    }

    async fn check_available_catalog_updates(
        &self,
        host: &BmcEndpoint,
        _creds: &BmcCredentials,
        _catalog_url: &str,
    ) -> Result<CheckUpdatesResult> {
        let available = self
            .catalog_update_queue
            .get(&host.address)
            .and_then(|q| q.lock().pop_front())
            .unwrap_or_default();
        Ok(CheckUpdatesResult { available })
    }

    async fn clear_stale_jobs(&self, host: &BmcEndpoint, _creds: &BmcCredentials, _age_threshold: Duration) -> Result<()> {
        // One-shot: removed on use so the second `clear_stale_jobs` call
        // against this host (e.g. from cancellation cleanup) doesn't pause again.
        if let Some((_, (reached, resume))) = self.pause_before_clear_stale_jobs.remove(&host.address) {
            reached.notify_one();
            resume.notified().await;
        }
        if self.clear_stale_jobs_failures.contains_key(&host.address) {
            return Err(crate::error::EngineError::Internal(format!(
                "simulated BMC job-queue clear failure for {}",
                host.address
            )));
        }
        *self.stale_jobs_cleared.entry(host.address).or_insert(0) += 1;
        Ok(())
    }

    async fn wait_for_all_jobs_complete(
        &self,
        _host: &BmcEndpoint,
        _creds: &BmcCredentials,
        _timeout: Duration,
        _poll_interval: Duration,
    ) -> Result<()> {
        Ok(())
    }

    async fn graceful_reboot(&self, host: &BmcEndpoint, _creds: &BmcCredentials) -> Result<()> {
        *self.reboots.entry(host.address).or_insert(0) += 1;
        Ok(())
    }

    async fn power_on(&self, _host: &BmcEndpoint, _creds: &BmcCredentials) -> Result<()> {
        Ok(())
    }

    async fn graceful_shutdown(&self, _host: &BmcEndpoint, _creds: &BmcCredentials) -> Result<()> {
        Ok(())
    }

    async fn export_scp(&self, host: &BmcEndpoint, _creds: &BmcCredentials, _target: ScpTarget) -> Result<ScpExport> {
        *self.scp_exports.entry(host.address).or_insert(0) += 1;
        Ok(ScpExport { content: "{}".to_string(), bytes: 2 })
    }

    async fn ping(&self, host: &BmcEndpoint, _creds: &BmcCredentials) -> Result<bool> {
        Ok(self.reachable.get(&host.address).map(|r| *r).unwrap_or(true))
    }
}
