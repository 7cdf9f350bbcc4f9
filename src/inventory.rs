// src/inventory.rs

//! Host Inventory (external collaborator, consumed): resolves a job's
//! `TargetScope` into the concrete `TargetHost` list the orchestrator walks
//! (spec §4.6 P0). Not named as its own component in §4, but required by
//! it — grounded the same way as `JobStore` in §6: a trait the engine
//! consumes, with only an in-memory fake shipped here.

use crate::error::Result;
use crate::model::TargetHost;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait HostInventory: Send + Sync {
    async fn hosts_by_ids(&self, ids: &[String]) -> Result<Vec<TargetHost>>;
    async fn hosts_by_group(&self, group: &str) -> Result<Vec<TargetHost>>;
    async fn hosts_by_cluster(&self, cluster: &str) -> Result<Vec<TargetHost>>;
}

pub type SharedHostInventory = Arc<dyn HostInventory>;

/// In-memory fake inventory keyed by host id, group membership, and cluster
/// membership. Production deployments back this with whatever CMDB or
/// fleet-topology service owns the host/group/cluster graph — out of scope
/// here per spec §1/§9.
#[derive(Default)]
pub struct InMemoryHostInventory {
    hosts: DashMap<String, TargetHost>,
    groups: DashMap<String, Vec<String>>,
    clusters: DashMap<String, Vec<String>>,
}

impl InMemoryHostInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: TargetHost) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn add_to_group(&self, group: &str, host_id: impl Into<String>) {
        self.groups.entry(group.to_string()).or_default().push(host_id.into());
    }

    pub fn add_to_cluster(&self, cluster: &str, host_id: impl Into<String>) {
        self.clusters.entry(cluster.to_string()).or_default().push(host_id.into());
    }
}

#[async_trait]
impl HostInventory for InMemoryHostInventory {
    async fn hosts_by_ids(&self, ids: &[String]) -> Result<Vec<TargetHost>> {
        Ok(ids.iter().filter_map(|id| self.hosts.get(id).map(|r| r.clone())).collect())
    }

    async fn hosts_by_group(&self, group: &str) -> Result<Vec<TargetHost>> {
        let ids = self.groups.get(group).map(|r| r.clone()).unwrap_or_default();
        self.hosts_by_ids(&ids).await
    }

    async fn hosts_by_cluster(&self, cluster: &str) -> Result<Vec<TargetHost>> {
        let ids = self.clusters.get(cluster).map(|r| r.clone()).unwrap_or_default();
        self.hosts_by_ids(&ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BmcEndpoint;
    use std::net::{IpAddr, Ipv4Addr};

    fn host(id: &str) -> TargetHost {
        TargetHost {
            id: id.to_string(),
            bmc: BmcEndpoint {
                address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                username: "root".into(),
            },
            hypervisor: None,
        }
    }

    #[tokio::test]
    async fn resolves_hosts_by_cluster_membership() {
        let inventory = InMemoryHostInventory::new();
        inventory.add_host(host("esx-01"));
        inventory.add_host(host("esx-02"));
        inventory.add_to_cluster("prod-cluster", "esx-01");
        inventory.add_to_cluster("prod-cluster", "esx-02");

        let hosts = inventory.hosts_by_cluster("prod-cluster").await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[tokio::test]
    async fn unknown_group_resolves_to_empty_set() {
        let inventory = InMemoryHostInventory::new();
        let hosts = inventory.hosts_by_group("does-not-exist").await.unwrap();
        assert!(hosts.is_empty());
    }
}
