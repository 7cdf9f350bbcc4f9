// src/bmc/mod.rs

//! Typed Redfish operations against a single Dell iDRAC (spec §4.2).
//!
//! `BmcAdapter` is the trait the orchestrator programs against; `RedfishBmcAdapter`
//! is the production implementation, routing every call through a `Throttler`.

pub mod endpoints;
pub mod errors;
pub mod fake;
pub mod redfish;
pub mod version;

use crate::error::Result;
use crate::model::{AvailableUpdate, BmcEndpoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One row of `firmware_inventory`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FirmwareComponent {
    pub name: String,
    pub version: String,
    pub updateable: bool,
    pub component_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ApplyTime {
    Immediate,
    OnReset,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum TaskState {
    Running,
    Completed,
    Exception,
    Killed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub state: TaskState,
    pub percent_complete: u8,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Scheduled | JobState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub state: JobState,
    pub percent_complete: u8,
    pub message: Option<String>,
    /// Number of stall-recovery actions `wait_for_job_with_recovery` applied
    /// before the job reached a terminal state (spec §8 scenario 4).
    pub recovery_attempts: u32,
}

/// Action to take when a job's `percent_complete` stalls past `stall_timeout`
/// in `wait_for_job_with_recovery` (spec §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Reboot,
    ClearQueue,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogUpdateResult {
    pub job_id: Option<String>,
    pub task_uri: Option<String>,
    /// `true` when the BMC's terminal message matched a "no applicable
    /// updates" indicator rather than scheduling any internal job.
    pub no_applicable_updates: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckUpdatesResult {
    pub available: Vec<AvailableUpdate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScpTarget {
    All,
    Bios,
    Raid,
    Nic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScpExport {
    pub content: String,
    pub bytes: usize,
}

/// Credentials used to authenticate a single BMC call. Kept separate from
/// `BmcEndpoint` (which only names the address/username pair the engine
/// tracks per host) so the adapter trait never has to thread a whole
/// `HostCredentialsBundle` through.
#[derive(Debug, Clone)]
pub struct BmcCredentials {
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait BmcAdapter: Send + Sync {
    async fn firmware_inventory(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
    ) -> Result<Vec<FirmwareComponent>>;

    async fn initiate_catalog_update(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        catalog_url: &str,
    ) -> Result<CatalogUpdateResult>;

    async fn initiate_simple_update(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        firmware_uri: &str,
        apply_time: ApplyTime,
    ) -> Result<String>;

    async fn wait_for_task(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        task_uri: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<TaskResult>;

    async fn wait_for_job_with_recovery(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        job_id: &str,
        timeout: Duration,
        stall_timeout: Duration,
        max_stall_retries: u32,
        recovery_action: RecoveryAction,
    ) -> Result<JobResult>;

    async fn check_available_catalog_updates(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        catalog_url: &str,
    ) -> Result<CheckUpdatesResult>;

    async fn clear_stale_jobs(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        age_threshold: Duration,
    ) -> Result<()>;

    async fn wait_for_all_jobs_complete(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()>;

    async fn graceful_reboot(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()>;

    async fn power_on(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()>;

    async fn graceful_shutdown(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()>;

    async fn export_scp(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        target: ScpTarget,
    ) -> Result<ScpExport>;

    /// Opens then immediately closes a session; the pre-flight connectivity probe.
    async fn ping(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<bool>;
}
