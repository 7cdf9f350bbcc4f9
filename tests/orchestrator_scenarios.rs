// tests/orchestrator_scenarios.rs

//! Black-box scenarios exercising the full P0-P7 orchestrator pipeline
//! against in-memory fakes of every external collaborator. No real network
//! I/O, no wall-clock waiting (time is paused where the per-host loop would
//! otherwise sleep through reboot-wait).

use chrono::Utc;
use fleet_orchestrator::bmc::fake::InMemoryBmcAdapter;
use fleet_orchestrator::bmc::JobState;
use fleet_orchestrator::config::OrchestratorConfig;
use fleet_orchestrator::credentials::InMemoryCredentialsProvider;
use fleet_orchestrator::hypervisor::fake::InMemoryHypervisorAdapter;
use fleet_orchestrator::inventory::InMemoryHostInventory;
use fleet_orchestrator::job_store::InMemoryJobStore;
use fleet_orchestrator::journal::InMemoryWorkflowJournal;
use fleet_orchestrator::model::{
    BlockerReason, BlockerSeverity, BmcEndpoint, HypervisorHostHandle, Job, JobDetails, JobStatus,
    MaintenanceBlocker, TargetHost, TargetScope,
};
use fleet_orchestrator::orchestrator::Orchestrator;
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use uuid::Uuid;

fn details(pairs: &[(&str, Value)]) -> JobDetails {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    JobDetails(map)
}

fn job(scope: TargetScope, details: JobDetails) -> Job {
    Job {
        id: Uuid::new_v4(),
        status: JobStatus::Pending,
        target_scope: scope,
        details,
        created_by: "operator".to_string(),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

fn host(id: &str, last_octet: u8, hypervisor: Option<HypervisorHostHandle>) -> TargetHost {
    TargetHost {
        id: id.to_string(),
        bmc: BmcEndpoint {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)),
            username: "root".to_string(),
        },
        hypervisor,
    }
}

fn hv_handle(host_id: &str) -> HypervisorHostHandle {
    HypervisorHostHandle {
        host_id: host_id.to_string(),
        management_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        fallback_address: None,
    }
}

struct Harness {
    job_store: Arc<InMemoryJobStore>,
    inventory: Arc<InMemoryHostInventory>,
    credentials: Arc<InMemoryCredentialsProvider>,
    bmc: Arc<InMemoryBmcAdapter>,
    hypervisor: Arc<InMemoryHypervisorAdapter>,
    journal: Arc<InMemoryWorkflowJournal>,
    orchestrator: Arc<Orchestrator>,
}

fn harness() -> Harness {
    let job_store = Arc::new(InMemoryJobStore::new());
    let inventory = Arc::new(InMemoryHostInventory::new());
    let credentials = Arc::new(InMemoryCredentialsProvider::new());
    let bmc = Arc::new(InMemoryBmcAdapter::new());
    let hypervisor = Arc::new(InMemoryHypervisorAdapter::new());
    let journal = Arc::new(InMemoryWorkflowJournal::new());

    let orchestrator = Arc::new(Orchestrator {
        job_store: job_store.clone(),
        inventory: inventory.clone(),
        credentials: credentials.clone(),
        bmc: bmc.clone(),
        hypervisor: hypervisor.clone(),
        journal: journal.clone(),
        config: OrchestratorConfig::default(),
    });

    Harness { job_store, inventory, credentials, bmc, hypervisor, journal, orchestrator }
}

#[tokio::test]
async fn all_hosts_current_completes_without_touching_ha() {
    let h = harness();

    for (id, octet) in [("esx-1", 1), ("esx-2", 2), ("esx-3", 3)] {
        h.inventory.add_host(host(id, octet, None));
        h.credentials.set(id, "root", "hunter2");
    }

    let j = job(
        TargetScope::ServerIds(vec!["esx-1".into(), "esx-2".into(), "esx-3".into()]),
        details(&[
            ("check_updates_in_preflight", json!(true)),
            ("dell_catalog_url", json!("https://catalog.example/catalog.xml")),
        ]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    h.orchestrator.run_job(job_id).await.unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(h.hypervisor.maintenance_order().is_empty());

    let preflight_step = h
        .journal
        .steps(job_id)
        .into_iter()
        .find(|s| s.step_name == "preflight")
        .expect("preflight step recorded");
    assert_eq!(preflight_step.details["summary"], json!("all hosts current"));
}

#[tokio::test]
async fn control_plane_host_is_updated_last() {
    let h = harness();

    for (id, octet) in [("esx-1", 1), ("esx-2", 2), ("esx-3", 3)] {
        h.inventory.add_host(host(id, octet, Some(hv_handle(id))));
        h.inventory.add_to_cluster("prod-cluster", id);
        h.credentials.set(id, "root", "hunter2");
    }
    h.hypervisor.set_control_plane_host("prod-cluster", "esx-2");

    let j = job(
        TargetScope::Cluster("prod-cluster".into()),
        details(&[("firmware_source", json!("local_repository")), ("backup_scp", json!(false))]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    h.orchestrator.run_job(job_id).await.unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    let order = h.hypervisor.maintenance_order();
    assert_eq!(order.len(), 3);
    assert_eq!(order.last(), Some(&"esx-2".to_string()));
}

#[tokio::test]
async fn critical_blocker_auto_resolved_by_powering_off_vm() {
    let h = harness();

    h.inventory.add_host(host("esx-9", 9, Some(hv_handle("esx-9"))));
    h.credentials.set("esx-9", "root", "hunter2");
    h.hypervisor.set_maintenance_blockers(
        "esx-9",
        vec![MaintenanceBlocker {
            vm_name: "vm-critical".into(),
            reason: BlockerReason::PassthroughDevice,
            severity: BlockerSeverity::Critical,
            auto_remediable_by_power_off: true,
        }],
    );

    let mut resolutions = Map::new();
    resolutions.insert("esx-9".into(), json!({}));

    let j = job(
        TargetScope::ServerIds(vec!["esx-9".into()]),
        details(&[
            ("firmware_source", json!("local_repository")),
            ("auto_power_off_enabled", json!(true)),
            ("maintenance_blocker_resolutions", Value::Object(resolutions)),
            ("backup_scp", json!(false)),
        ]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    h.orchestrator.run_job(job_id).await.unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(h.hypervisor.powered_off_vms("esx-9"), vec!["vm-critical".to_string()]);
    assert!(!h.hypervisor.is_in_maintenance("esx-9"));
}

#[tokio::test(start_paused = true)]
async fn catalog_job_stall_recovers_and_records_recovery_attempts() {
    let h = harness();

    h.inventory.add_host(host("esx-5", 5, None));
    h.credentials.set("esx-5", "root", "hunter2");
    h.bmc.queue_catalog_job(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), "JID_001");
    h.bmc.script_job("JID_001", 1, JobState::Completed, Some("Job completed successfully."));

    let j = job(
        TargetScope::ServerIds(vec!["esx-5".into()]),
        details(&[
            ("dell_catalog_url", json!("https://catalog.example/catalog.xml")),
            ("max_stall_retries", json!(2)),
            ("backup_scp", json!(false)),
        ]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    h.orchestrator.run_job(job_id).await.unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    let apply_step = h
        .journal
        .steps(job_id)
        .into_iter()
        .find(|s| s.step_name == "apply_firmware:esx-5")
        .expect("apply_firmware step recorded");
    assert_eq!(apply_step.details["recovery_attempts"], json!(1));
    assert_eq!(h.bmc.recovery_actions_for("JID_001").len(), 1);
}

#[tokio::test]
async fn hard_cancel_mid_apply_unwinds_maintenance_ha_and_job_queue() {
    let h = harness();

    h.inventory.add_host(host("esx-7", 7, Some(hv_handle("esx-7"))));
    h.inventory.add_to_cluster("prod-cluster", "esx-7");
    h.credentials.set("esx-7", "root", "hunter2");

    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    let pause = h.bmc.register_pause_before_clear_stale_jobs(addr);

    let j = job(
        TargetScope::Cluster("prod-cluster".into()),
        details(&[("firmware_source", json!("local_repository")), ("backup_scp", json!(false))]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    let orchestrator = h.orchestrator.clone();
    let run_handle = tokio::spawn(async move { orchestrator.run_job(job_id).await });

    pause.reached.notified().await;

    let mut patch = Map::new();
    patch.insert("cancel_requested".into(), json!(true));
    h.job_store.patch_job(job_id, Some(JobStatus::Cancelled), Some(patch)).await.unwrap();
    pause.resume();

    run_handle.await.unwrap().unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);

    let cleanup_actions: Vec<String> =
        serde_json::from_value(stored.details.get_value("cleanup_actions").cloned().unwrap()).unwrap();
    assert!(cleanup_actions.contains(&"exit_maintenance".to_string()));
    assert!(cleanup_actions.contains(&"enable_cluster_ha".to_string()));
    assert!(cleanup_actions.contains(&"clear_job_queue".to_string()));
    assert!(!h.hypervisor.is_in_maintenance("esx-7"));
}

#[tokio::test]
async fn graceful_cancel_stops_before_the_next_host() {
    let h = harness();

    h.inventory.add_host(host("esx-11", 11, None));
    h.inventory.add_host(host("esx-12", 12, None));
    h.credentials.set("esx-11", "root", "hunter2");
    h.credentials.set("esx-12", "root", "hunter2");

    let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 11));
    let pause = h.bmc.register_pause_before_clear_stale_jobs(addr);

    let j = job(
        TargetScope::ServerIds(vec!["esx-11".into(), "esx-12".into()]),
        details(&[("firmware_source", json!("local_repository")), ("backup_scp", json!(false))]),
    );
    let job_id = j.id;
    h.job_store.insert(j);

    let orchestrator = h.orchestrator.clone();
    let run_handle = tokio::spawn(async move { orchestrator.run_job(job_id).await });

    pause.reached.notified().await;

    let mut patch = Map::new();
    patch.insert("graceful_cancel".into(), json!(true));
    h.job_store.patch_job(job_id, None, Some(patch)).await.unwrap();
    pause.resume();

    run_handle.await.unwrap().unwrap();

    let stored = h.job_store.fetch_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert_eq!(stored.details.get_value("stopped_before_host"), Some(&json!(2)));

    // esx-11 completed normally before the stop was observed at esx-12's start.
    assert!(h
        .journal
        .steps(job_id)
        .iter()
        .any(|s| s.step_name == "apply_firmware:esx-11" && s.status.is_terminal()));
}
