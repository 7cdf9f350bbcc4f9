// src/model.rs

//! Shared data model: jobs, target hosts, credentials, blockers, cleanup state.
//! The job `details` map is deliberately an open JSON object rather than a
//! parsed struct, so callers can set keys this crate doesn't know about
//! without losing them on the next read-modify-write.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use uuid::Uuid;

/// A BMC endpoint plus the credentials used to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BmcEndpoint {
    pub address: IpAddr,
    pub username: String,
}

/// An optional handle into the hypervisor cluster manager's object model for a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HypervisorHostHandle {
    /// The identifier the hypervisor adapter uses to address this host (e.g. a
    /// managed-object reference or hostname), opaque to the engine.
    pub host_id: String,
    /// The address used for TCP/443 reachability checks during reboot-wait.
    pub management_address: IpAddr,
    /// An operator-configured fallback address, tried if `management_address`
    /// is unreachable after the primary hostname check fails.
    pub fallback_address: Option<IpAddr>,
}

/// A logical handle combining a BMC endpoint with an optional hypervisor host
/// handle. Hosts without a hypervisor link are exempt from maintenance/HA/
/// evacuation steps (spec §3 "Target host").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TargetHost {
    pub id: String,
    pub bmc: BmcEndpoint,
    pub hypervisor: Option<HypervisorHostHandle>,
}

impl TargetHost {
    pub fn has_hypervisor_link(&self) -> bool {
        self.hypervisor.is_some()
    }
}

/// Per-host tuple built during pre-flight and read during the sequential
/// update loop. Engine-local; lives for the duration of one job.
#[derive(Debug, Clone, Default)]
pub struct HostCredentialsBundle {
    pub username: String,
    pub password: String,
    pub validated: bool,
    pub cached_blockers: Option<Vec<MaintenanceBlocker>>,
    pub cached_available_updates: Option<Vec<AvailableUpdate>>,
    pub needs_update: bool,
}

/// A firmware update the BMC's catalog or local repository reports as available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailableUpdate {
    pub name: String,
    pub available_version: String,
    pub current_version: String,
    pub criticality: String,
    pub reboot_required: bool,
}

/// Why a VM prevents its host from entering maintenance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockerReason {
    PassthroughDevice,
    LocalStorage,
    Vgpu,
    FaultTolerance,
    HypervisorControlPlaneVm,
    Other,
}

impl BlockerReason {
    /// `power_off_strategy = "non_migratable"` resolves only these reasons (§4.6c).
    pub fn is_non_migratable(self) -> bool {
        matches!(
            self,
            BlockerReason::PassthroughDevice
                | BlockerReason::LocalStorage
                | BlockerReason::Vgpu
                | BlockerReason::FaultTolerance
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockerSeverity {
    Critical,
    Warning,
}

/// A per-host record enumerating VMs that prevent the host from entering maintenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceBlocker {
    pub vm_name: String,
    pub reason: BlockerReason,
    pub severity: BlockerSeverity,
    pub auto_remediable_by_power_off: bool,
}

/// Strategy for auto-resolving blockers in §4.6(c).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffStrategy {
    #[default]
    NonMigratable,
    All,
}

/// Which source of firmware to apply, §6 `firmware_source`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareSource {
    #[default]
    DellOnlineCatalog,
    LocalRepository,
    Manual,
}

/// One of the three ways a job's target set may be expressed (spec §3 "Job").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum TargetScope {
    ServerIds(Vec<String>),
    ServerGroup(String),
    Cluster(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// The open-ended `details` map on a job (§6, §9). The engine reads a known
/// set of keys through the typed accessors below and otherwise treats this
/// as an opaque JSON object whose unrecognised keys are preserved verbatim
/// on every patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDetails(pub serde_json::Map<String, Value>);

impl JobDetails {
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.0.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Merges `patch` into this map, overwriting keys present in `patch` and
    /// leaving every other key untouched (the Job Store's "patch a merged
    /// details map" contract, §6).
    pub fn merge(&mut self, patch: serde_json::Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k, v);
        }
    }

    pub fn graceful_cancel(&self) -> bool {
        self.get_bool("graceful_cancel", false)
    }

    pub fn firmware_source(&self) -> FirmwareSource {
        match self.get_str("firmware_source") {
            Some("local_repository") => FirmwareSource::LocalRepository,
            Some("manual") => FirmwareSource::Manual,
            _ => FirmwareSource::DellOnlineCatalog,
        }
    }

    pub fn power_off_strategy(&self) -> PowerOffStrategy {
        match self.get_str("power_off_strategy") {
            Some("all") => PowerOffStrategy::All,
            _ => PowerOffStrategy::NonMigratable,
        }
    }

    pub fn resolutions_for_host(&self, host_id: &str) -> Option<&Value> {
        self.0
            .get("maintenance_blocker_resolutions")
            .and_then(Value::as_object)
            .and_then(|m| m.get(host_id))
    }

    /// `skipped_hosts` plus the single-host `skip_host` shorthand (§6), unioned.
    pub fn skipped_hosts(&self) -> HashSet<String> {
        let mut set: HashSet<String> = self.get_str_list("skipped_hosts").into_iter().collect();
        if let Some(host_id) = self.skip_host() {
            set.insert(host_id.to_string());
        }
        set
    }

    pub fn skip_host(&self) -> Option<&str> {
        self.get_str("skip_host")
    }

    /// Host id to resume the per-host loop from (§6), e.g. after a previous
    /// run paused or was cancelled partway through the ordered host list.
    pub fn resume_from_host(&self) -> Option<&str> {
        self.get_str("resume_from_host")
    }
}

/// A rolling-cluster-update job, as tracked by the Job Store (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub target_scope: TargetScope,
    pub details: JobDetails,
    pub created_by: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Skipped,
    Warning,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Warning
        )
    }
}

/// A single row of the workflow journal, keyed by (job, step-number) (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub job_id: Uuid,
    pub step_number: u32,
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub details: Value,
    pub error: Option<String>,
}

/// Engine-local per-job bookkeeping required to unwind on cancel or failure (§3).
#[derive(Debug, Clone, Default)]
pub struct CleanupState {
    pub hosts_in_maintenance: Vec<String>,
    pub currently_processing: Option<String>,
    pub firmware_in_progress: bool,
    pub ha_was_disabled: bool,
    pub prior_ha_config: Option<HaConfigSnapshot>,
    pub powered_off_vms: HashMap<String, Vec<String>>,
    pub cleanup_actions: Vec<String>,
}

impl CleanupState {
    pub fn record_action(&mut self, action: impl Into<String>) {
        self.cleanup_actions.push(action.into());
    }
}

/// Cluster HA configuration snapshotted before this job disables it, so it
/// can be restored verbatim on re-enable (§4.6 P2, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HaConfigSnapshot {
    pub host_monitoring: bool,
    pub admission_control: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocker_reason_non_migratable_classification() {
        assert!(BlockerReason::PassthroughDevice.is_non_migratable());
        assert!(BlockerReason::FaultTolerance.is_non_migratable());
        assert!(!BlockerReason::HypervisorControlPlaneVm.is_non_migratable());
        assert!(!BlockerReason::Other.is_non_migratable());
    }

    #[test]
    fn job_details_merge_preserves_unknown_keys() {
        let mut details = JobDetails::default();
        details.set("continue_on_failure", Value::Bool(true));
        details.set("custom_ui_hint", Value::String("keep me".into()));

        let mut patch = serde_json::Map::new();
        patch.insert("continue_on_failure".into(), Value::Bool(false));
        details.merge(patch);

        assert!(!details.get_bool("continue_on_failure", true));
        assert_eq!(details.get_str("custom_ui_hint"), Some("keep me"));
    }

    #[test]
    fn job_details_unknown_keys_default_safely() {
        let details = JobDetails::default();
        assert!(!details.graceful_cancel());
        assert_eq!(details.firmware_source(), FirmwareSource::DellOnlineCatalog);
        assert_eq!(details.power_off_strategy(), PowerOffStrategy::NonMigratable);
    }
}
