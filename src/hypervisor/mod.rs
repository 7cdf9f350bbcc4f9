// src/hypervisor/mod.rs

//! Hypervisor cluster manager operations (spec §4.3): maintenance mode, HA,
//! VM power control, rebalance wait, and control-plane VM location.

pub mod fake;
pub mod probe;

use crate::error::Result;
use crate::model::{HaConfigSnapshot, MaintenanceBlocker};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EnterMaintenanceResult {
    pub success: bool,
    pub vms_evacuated: Vec<String>,
    pub maintenance_blockers: Option<Vec<MaintenanceBlocker>>,
    pub evacuation_blockers: Option<Vec<MaintenanceBlocker>>,
    pub stall_duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveHostStatus {
    pub connected: bool,
    pub in_maintenance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHaStatus {
    pub enabled: bool,
    pub host_monitoring: bool,
    pub admission_control: bool,
    pub fault_tolerance_vm: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DisableHaResult {
    pub success: bool,
    pub was_enabled: bool,
    pub prior_host_monitoring: bool,
    pub prior_admission_control: bool,
    /// Name of the fault-tolerant VM that blocked disable, if any (spec §4.3).
    pub ft_vm: Option<String>,
}

impl DisableHaResult {
    pub fn as_snapshot(&self) -> HaConfigSnapshot {
        HaConfigSnapshot {
            host_monitoring: self.prior_host_monitoring,
            admission_control: self.prior_admission_control,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PowerOffResult {
    pub success: bool,
    pub vms_powered_off: Vec<String>,
    pub vms_failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PowerOnResult {
    pub success: bool,
    pub vms_powered_on: Vec<String>,
    pub vms_already_on: Vec<String>,
    pub vms_failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RebalanceResult {
    pub success: bool,
    pub waited_seconds: u64,
    pub active_migrations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlPlaneLocation {
    pub host_with_control_plane: Option<String>,
    pub control_plane_vm_name: Option<String>,
}

#[async_trait]
pub trait HypervisorAdapter: Send + Sync {
    /// Read-only enumeration of VMs that would block maintenance entry,
    /// without actually evacuating anything. The comprehensive blocker scan
    /// (spec §4.5 Phase 1.5) uses this; `enter_maintenance` surfaces the
    /// same structured blocker list when an actual entry attempt fails.
    async fn scan_maintenance_blockers(&self, host_id: &str) -> Result<Vec<MaintenanceBlocker>>;

    async fn enter_maintenance(
        &self,
        host_id: &str,
        timeout: Duration,
    ) -> Result<EnterMaintenanceResult>;

    async fn exit_maintenance(&self, host_id: &str) -> Result<()>;

    async fn wait_for_connected(&self, host_id: &str, timeout: Duration) -> Result<bool>;

    async fn live_host_status(&self, host_id: &str) -> Result<LiveHostStatus>;

    async fn get_cluster_ha_status(&self, cluster: &str) -> Result<ClusterHaStatus>;

    async fn disable_cluster_ha(&self, cluster: &str) -> Result<DisableHaResult>;

    async fn enable_cluster_ha(
        &self,
        cluster: &str,
        host_monitoring: bool,
        admission_control: bool,
    ) -> Result<()>;

    async fn power_off_vms(
        &self,
        host_id: &str,
        vm_names: &[String],
        graceful: bool,
    ) -> Result<PowerOffResult>;

    async fn power_on_vms(
        &self,
        host_id: &str,
        vm_names: &[String],
        timeout: Duration,
    ) -> Result<PowerOnResult>;

    async fn wait_for_rebalance(
        &self,
        cluster: &str,
        timeout: Duration,
        quiet_period: Duration,
    ) -> Result<RebalanceResult>;

    async fn detect_control_plane_location(
        &self,
        candidate_hosts: &[String],
    ) -> Result<ControlPlaneLocation>;
}
