// src/orchestrator/ordering.rs

//! P0.5 order adjustment (spec §4.6): control-plane host last, maintenance
//! hosts first among the rest.

use super::{JobRunState, Orchestrator};
use tracing::info;

pub(crate) async fn reorder_hosts(orchestrator: &Orchestrator, state: &mut JobRunState) {
    if state.hosts.is_empty() {
        return;
    }

    let candidate_ids: Vec<String> = state.hosts.iter().map(|h| h.id.clone()).collect();
    let control_plane_host_id = match orchestrator
        .hypervisor
        .detect_control_plane_location(&candidate_ids)
        .await
    {
        Ok(location) => location.host_with_control_plane,
        Err(e) => {
            info!(error = %e, "control-plane detection failed, leaving order unadjusted on this point");
            None
        }
    };

    let mut in_maintenance = Vec::new();
    let mut rest = Vec::new();
    let mut control_plane = None;

    for host in std::mem::take(&mut state.hosts) {
        if Some(&host.id) == control_plane_host_id.as_ref() {
            control_plane = Some(host);
            continue;
        }
        match host_is_in_maintenance(orchestrator, &host).await {
            true => in_maintenance.push(host),
            false => rest.push(host),
        }
    }

    let mut ordered = Vec::with_capacity(in_maintenance.len() + rest.len() + 1);
    ordered.extend(in_maintenance);
    ordered.extend(rest);
    if let Some(host) = control_plane {
        info!(host_id = %host.id, "deferring control-plane host to the end of the update order");
        ordered.push(host);
    }

    state.hosts = ordered;
}

async fn host_is_in_maintenance(orchestrator: &Orchestrator, host: &crate::model::TargetHost) -> bool {
    let Some(hypervisor) = &host.hypervisor else { return false };
    orchestrator
        .hypervisor
        .live_host_status(&hypervisor.host_id)
        .await
        .map(|status| status.in_maintenance)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    // Covered end to end by `control_plane_host_is_updated_last` in
    // tests/orchestrator_scenarios.rs, against an in-memory HypervisorAdapter.
}
