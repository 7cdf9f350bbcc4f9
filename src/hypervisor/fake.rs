// src/hypervisor/fake.rs

//! In-memory `HypervisorAdapter`, the same kind of stand-in `InMemoryJobStore`
//! and `InMemoryHostInventory` provide for their respective external
//! collaborators. A real deployment backs this trait with whatever cluster
//! manager API it runs (vCenter, oVirt, …) — wire format is explicitly out
//! of scope per spec §1.

use super::{
    ClusterHaStatus, ControlPlaneLocation, DisableHaResult, EnterMaintenanceResult, HypervisorAdapter,
    LiveHostStatus, PowerOffResult, PowerOnResult, RebalanceResult,
};
use crate::error::Result;
use crate::model::MaintenanceBlocker;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Default)]
pub struct InMemoryHypervisorAdapter {
    connected: DashMap<String, bool>,
    in_maintenance: DashMap<String, bool>,
    ha_enabled: DashMap<String, ClusterHaStatus>,
    control_plane_host: DashMap<String, String>,
    /// Critical VMs that must be powered off before `enter_maintenance`
    /// succeeds for a host, keyed by host id.
    blockers: DashMap<String, Vec<MaintenanceBlocker>>,
    powered_off: DashMap<String, HashSet<String>>,
    /// Records the order `enter_maintenance` was called, one id per call.
    maintenance_order: Mutex<Vec<String>>,
}

impl InMemoryHypervisorAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, host_id: impl Into<String>, connected: bool) {
        self.connected.insert(host_id.into(), connected);
    }

    pub fn set_ha(&self, cluster: impl Into<String>, status: ClusterHaStatus) {
        self.ha_enabled.insert(cluster.into(), status);
    }

    pub fn set_control_plane_host(&self, cluster: impl Into<String>, host_id: impl Into<String>) {
        self.control_plane_host.insert(cluster.into(), host_id.into());
    }

    /// Registers VMs that block `host_id` from entering maintenance until
    /// they're powered off via `power_off_vms`.
    pub fn set_maintenance_blockers(&self, host_id: impl Into<String>, blockers: Vec<MaintenanceBlocker>) {
        self.blockers.insert(host_id.into(), blockers);
    }

    pub fn set_in_maintenance(&self, host_id: impl Into<String>, in_maintenance: bool) {
        self.in_maintenance.insert(host_id.into(), in_maintenance);
    }

    pub fn is_in_maintenance(&self, host_id: &str) -> bool {
        self.in_maintenance.get(host_id).map(|r| *r).unwrap_or(false)
    }

    /// The host ids `enter_maintenance` was called against, in call order.
    pub fn maintenance_order(&self) -> Vec<String> {
        self.maintenance_order.lock().clone()
    }

    /// VM names `power_off_vms` has recorded as powered off for `host_id`.
    pub fn powered_off_vms(&self, host_id: &str) -> Vec<String> {
        self.powered_off.get(host_id).map(|r| r.iter().cloned().collect()).unwrap_or_default()
    }

    fn remaining_blockers(&self, host_id: &str) -> Vec<MaintenanceBlocker> {
        let Some(blockers) = self.blockers.get(host_id) else { return Vec::new() };
        let powered_off = self.powered_off.get(host_id);
        blockers
            .iter()
            .filter(|b| !powered_off.as_ref().map(|p| p.contains(&b.vm_name)).unwrap_or(false))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HypervisorAdapter for InMemoryHypervisorAdapter {
    async fn scan_maintenance_blockers(&self, host_id: &str) -> Result<Vec<MaintenanceBlocker>> {
        Ok(self.remaining_blockers(host_id))
    }

    async fn enter_maintenance(&self, host_id: &str, _timeout: Duration) -> Result<EnterMaintenanceResult> {
        self.maintenance_order.lock().push(host_id.to_string());

        let remaining = self.remaining_blockers(host_id);
        if !remaining.is_empty() {
            return Ok(EnterMaintenanceResult {
                success: false,
                maintenance_blockers: Some(remaining),
                ..Default::default()
            });
        }

        self.in_maintenance.insert(host_id.to_string(), true);
        Ok(EnterMaintenanceResult { success: true, ..Default::default() })
    }

    async fn exit_maintenance(&self, host_id: &str) -> Result<()> {
        self.in_maintenance.insert(host_id.to_string(), false);
        Ok(())
    }

    async fn wait_for_connected(&self, host_id: &str, _timeout: Duration) -> Result<bool> {
        Ok(self.connected.get(host_id).map(|r| *r).unwrap_or(true))
    }

    async fn live_host_status(&self, host_id: &str) -> Result<LiveHostStatus> {
        Ok(LiveHostStatus {
            connected: self.connected.get(host_id).map(|r| *r).unwrap_or(true),
            in_maintenance: self.in_maintenance.get(host_id).map(|r| *r).unwrap_or(false),
        })
    }

    async fn get_cluster_ha_status(&self, cluster: &str) -> Result<ClusterHaStatus> {
        Ok(self.ha_enabled.get(cluster).map(|r| r.clone()).unwrap_or(ClusterHaStatus {
            enabled: true,
            host_monitoring: true,
            admission_control: true,
            fault_tolerance_vm: None,
        }))
    }

    async fn disable_cluster_ha(&self, cluster: &str) -> Result<DisableHaResult> {
        let prior = self.get_cluster_ha_status(cluster).await?;
        if prior.fault_tolerance_vm.is_some() {
            return Ok(DisableHaResult {
                success: false,
                was_enabled: prior.enabled,
                prior_host_monitoring: prior.host_monitoring,
                prior_admission_control: prior.admission_control,
                ft_vm: prior.fault_tolerance_vm,
            });
        }
        self.ha_enabled.insert(
            cluster.to_string(),
            ClusterHaStatus { enabled: false, host_monitoring: false, admission_control: false, fault_tolerance_vm: None },
        );
        Ok(DisableHaResult {
            success: true,
            was_enabled: prior.enabled,
            prior_host_monitoring: prior.host_monitoring,
            prior_admission_control: prior.admission_control,
            ft_vm: None,
        })
    }

    async fn enable_cluster_ha(&self, cluster: &str, host_monitoring: bool, admission_control: bool) -> Result<()> {
        self.ha_enabled.insert(
            cluster.to_string(),
            ClusterHaStatus { enabled: true, host_monitoring, admission_control, fault_tolerance_vm: None },
        );
        Ok(())
    }

    async fn power_off_vms(&self, host_id: &str, vm_names: &[String], _graceful: bool) -> Result<PowerOffResult> {
        self.powered_off
            .entry(host_id.to_string())
            .or_default()
            .extend(vm_names.iter().cloned());
        Ok(PowerOffResult { success: true, vms_powered_off: vm_names.to_vec(), vms_failed: Vec::new() })
    }

    async fn power_on_vms(&self, _host_id: &str, vm_names: &[String], _timeout: Duration) -> Result<PowerOnResult> {
        Ok(PowerOnResult { success: true, vms_powered_on: vm_names.to_vec(), vms_already_on: Vec::new(), vms_failed: Vec::new() })
    }

    async fn wait_for_rebalance(&self, _cluster: &str, _timeout: Duration, _quiet_period: Duration) -> Result<RebalanceResult> {
        Ok(RebalanceResult { success: true, waited_seconds: 0, active_migrations: None })
    }

    async fn detect_control_plane_location(&self, candidate_hosts: &[String]) -> Result<ControlPlaneLocation> {
        for (_, host_id) in self.control_plane_host.iter().map(|r| (r.key().clone(), r.value().clone())) {
            if candidate_hosts.contains(&host_id) {
                return Ok(ControlPlaneLocation {
                    host_with_control_plane: Some(host_id),
                    control_plane_vm_name: Some("vcsa".to_string()),
                });
            }
        }
        Ok(ControlPlaneLocation::default())
    }
}
