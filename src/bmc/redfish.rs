// src/bmc/redfish.rs

//! `RedfishBmcAdapter`: the production `BmcAdapter`, routing every call
//! through a shared `Throttler` (spec §4.1, §4.2).

use super::errors::{extract_message_info, map_dell_error};
use super::{
    ApplyTime, BmcAdapter, BmcCredentials, CatalogUpdateResult, CheckUpdatesResult,
    FirmwareComponent, JobResult, JobState, RecoveryAction, ScpExport, ScpTarget, TaskResult,
    TaskState, endpoints,
};
use crate::error::{AdapterError, EngineError, Result};
use crate::model::{AvailableUpdate, BmcEndpoint};
use crate::throttler::{RequestOptions, Throttler};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// "No applicable updates" indicators in a catalog job's terminal message,
/// per spec §4.6(d).
const NO_APPLICABLE_UPDATES_INDICATORS: &[&str] = &[
    "no applicable updates",
    "no updates found",
    "system is up to date",
];

pub struct RedfishBmcAdapter {
    throttler: Arc<Throttler>,
}

impl RedfishBmcAdapter {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        Self { throttler }
    }

    fn url_for(host: &BmcEndpoint, path: &str) -> String {
        format!("https://{}{}", host.address, path)
    }

    async fn get_json(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        path: &str,
    ) -> Result<Value> {
        self.request_json(host, creds, Method::GET, path, None).await
    }

    async fn request_json(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = Self::url_for(host, path);
        let opts = RequestOptions {
            body,
            timeout: Some(Duration::from_secs(30)),
            basic_auth: Some((creds.username.clone(), creds.password.clone())),
        };
        let (resp, elapsed_ms) = self
            .throttler
            .request(method, &url, host.address, opts)
            .await?;
        debug!(%path, status = resp.status, elapsed_ms, "redfish request completed");

        let body_str = resp.body.as_str();
        let parsed: Value = if body_str.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body_str).unwrap_or(Value::Null)
        };

        if resp.status >= 400 {
            let (code, message) = extract_message_info(&parsed);
            let message = if message.is_empty() {
                format!("Redfish request to {path} failed with status {}", resp.status)
            } else {
                message
            };
            let adapter_err = map_dell_error(code.as_deref(), &message, Some(resp.status));
            return Err(EngineError::from(adapter_err));
        }

        Ok(parsed)
    }

    async fn create_session(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<String> {
        let body = serde_json::json!({
            "UserName": creds.username,
            "Password": creds.password,
        });
        let resp = self
            .request_json(host, creds, Method::POST, endpoints::SESSIONS, Some(body))
            .await?;
        resp.get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::from(AdapterError::new(
                    "NO_SESSION_ID",
                    "session creation response carried no Id",
                ))
            })
    }

    async fn teardown_session(&self, host: &BmcEndpoint, creds: &BmcCredentials, session_id: &str) {
        let path = format!("/redfish/v1/SessionService/Sessions/{session_id}");
        if let Err(e) = self
            .request_json(host, creds, Method::DELETE, &path, None)
            .await
        {
            warn!(%host.address, error = %e, "failed to tear down BMC session (leaked until idle timeout)");
        }
    }
}

#[async_trait]
impl BmcAdapter for RedfishBmcAdapter {
    async fn firmware_inventory(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
    ) -> Result<Vec<FirmwareComponent>> {
        let body = self.get_json(host, creds, endpoints::FIRMWARE_INVENTORY).await?;
        let members = body.get("Members").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut components = Vec::with_capacity(members.len());
        for member in members {
            let odata_id = member.get("@odata.id").and_then(Value::as_str);
            let Some(odata_id) = odata_id else { continue };
            let detail = self.get_json(host, creds, odata_id).await?;
            components.push(FirmwareComponent {
                name: detail.get("Name").and_then(Value::as_str).unwrap_or_default().to_string(),
                version: detail
                    .get("Version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                updateable: detail.get("Updateable").and_then(Value::as_bool).unwrap_or(false),
                component_type: detail
                    .get("Oem")
                    .and_then(|o| o.pointer("/Dell/DeviceType"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
            });
        }
        Ok(components)
    }

    async fn initiate_catalog_update(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        catalog_url: &str,
    ) -> Result<CatalogUpdateResult> {
        let body = serde_json::json!({
            "ImageURI": catalog_url,
            "@Redfish.OperationApplyTime": "OnReset",
        });
        let resp = self
            .request_json(host, creds, Method::POST, endpoints::UPDATE_SIMPLE_UPDATE, Some(body))
            .await?;
        Ok(CatalogUpdateResult {
            job_id: resp.get("Id").and_then(Value::as_str).map(str::to_string),
            task_uri: resp.get("@odata.id").and_then(Value::as_str).map(str::to_string),
            no_applicable_updates: false,
        })
    }

    async fn initiate_simple_update(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        firmware_uri: &str,
        apply_time: ApplyTime,
    ) -> Result<String> {
        let apply_time_str = match apply_time {
            ApplyTime::Immediate => "Immediate",
            ApplyTime::OnReset => "OnReset",
        };
        let body = serde_json::json!({
            "ImageURI": firmware_uri,
            "@Redfish.OperationApplyTime": apply_time_str,
        });
        let resp = self
            .request_json(host, creds, Method::POST, endpoints::UPDATE_SIMPLE_UPDATE, Some(body))
            .await?;
        resp.get("@odata.id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::from(AdapterError::new("NO_TASK_URI", "simple update response carried no task URI")))
    }

    async fn wait_for_task(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        task_uri: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut last_percent = None;

        loop {
            let body = self.get_json(host, creds, task_uri).await?;
            let state_str = body.get("TaskState").and_then(Value::as_str).unwrap_or("Running");
            let state = match state_str {
                "Completed" => TaskState::Completed,
                "Exception" => TaskState::Exception,
                "Killed" => TaskState::Killed,
                "Cancelled" | "Canceled" => TaskState::Cancelled,
                _ => TaskState::Running,
            };
            let percent = body.get("PercentComplete").and_then(Value::as_u64).unwrap_or(0) as u8;
            let message = body
                .pointer("/Messages/0/Message")
                .and_then(Value::as_str)
                .map(str::to_string);

            if last_percent != Some(percent) {
                info!(%task_uri, percent, ?state, "task progress");
                last_percent = Some(percent);
            }

            if state.is_terminal() {
                return Ok(TaskResult { state, percent_complete: percent, message });
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            sleep(poll_interval).await;
        }
    }

    async fn wait_for_job_with_recovery(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        job_id: &str,
        timeout: Duration,
        stall_timeout: Duration,
        max_stall_retries: u32,
        recovery_action: RecoveryAction,
    ) -> Result<JobResult> {
        let deadline = Instant::now() + timeout;
        let job_path = format!("/redfish/v1/Managers/iDRAC.Embedded.1/Jobs/{job_id}");
        let mut last_percent: Option<u8> = None;
        let mut last_progress_at = Instant::now();
        let mut stall_retries = 0u32;

        loop {
            let body = self.get_json(host, creds, &job_path).await?;
            let state_str = body.get("JobState").and_then(Value::as_str).unwrap_or("Running");
            let state = match state_str {
                "Scheduled" => JobState::Scheduled,
                "Completed" => JobState::Completed,
                "CompletedWithErrors" => JobState::CompletedWithErrors,
                "Failed" => JobState::Failed,
                _ => JobState::Running,
            };
            let percent = body.get("PercentComplete").and_then(Value::as_u64).unwrap_or(0) as u8;
            let message = body.get("Message").and_then(Value::as_str).map(str::to_string);

            if Some(percent) != last_percent {
                last_percent = Some(percent);
                last_progress_at = Instant::now();
            }

            if state.is_terminal() {
                return Ok(JobResult {
                    job_id: job_id.to_string(),
                    state,
                    percent_complete: percent,
                    message,
                    recovery_attempts: stall_retries,
                });
            }

            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }

            if last_progress_at.elapsed() >= stall_timeout && stall_retries < max_stall_retries {
                stall_retries += 1;
                warn!(%job_id, stall_retries, ?recovery_action, "job stalled, applying recovery action");
                match recovery_action {
                    RecoveryAction::Reboot => {
                        self.graceful_reboot(host, creds).await?;
                    }
                    RecoveryAction::ClearQueue => {
                        self.clear_stale_jobs(host, creds, Duration::from_secs(0)).await?;
                    }
                    RecoveryAction::None => {}
                }
                last_progress_at = Instant::now();
            }

            sleep(Duration::from_secs(10)).await;
        }
    }

    async fn check_available_catalog_updates(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        catalog_url: &str,
    ) -> Result<CheckUpdatesResult> {
        let body = serde_json::json!({ "CatalogURI": catalog_url });
        let resp = self
            .request_json(
                host,
                creds,
                Method::POST,
                "/redfish/v1/UpdateService/Actions/Oem/DellUpdateService.GetRepoBasedUpdateList",
                Some(body),
            )
            .await?;

        let packages = resp.get("PackageList").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut available = Vec::new();
        for pkg in packages {
            let available_version = pkg.get("Version").and_then(Value::as_str).unwrap_or_default().to_string();
            let current_version = pkg.get("ComponentInstalledVersion").and_then(Value::as_str).unwrap_or_default().to_string();
            if !super::version::is_newer(&available_version, &current_version) {
                continue;
            }
            available.push(AvailableUpdate {
                name: pkg.get("ComponentID").and_then(Value::as_str).unwrap_or_default().to_string(),
                available_version,
                current_version,
                criticality: pkg.get("Criticality").and_then(Value::as_str).unwrap_or("optional").to_string(),
                reboot_required: pkg.get("RebootType").and_then(Value::as_str).map(|s| s != "NONE").unwrap_or(true),
            });
        }
        Ok(CheckUpdatesResult { available })
    }

    async fn clear_stale_jobs(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        age_threshold: Duration,
    ) -> Result<()> {
        let body = self
            .get_json(host, creds, "/redfish/v1/Managers/iDRAC.Embedded.1/Jobs")
            .await?;
        let members = body.get("Members").and_then(Value::as_array).cloned().unwrap_or_default();

        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(age_threshold).unwrap_or_default();
        for member in members {
            let Some(odata_id) = member.get("@odata.id").and_then(Value::as_str) else { continue };
            let detail = self.get_json(host, creds, odata_id).await?;
            let state = detail.get("JobState").and_then(Value::as_str).unwrap_or("");
            let is_stale_state = matches!(state, "Failed" | "CompletedWithErrors");
            let is_old_scheduled = state == "Scheduled"
                && detail
                    .get("StartTime")
                    .and_then(Value::as_str)
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|start| start.with_timezone(&chrono::Utc) < cutoff)
                    .unwrap_or(false);

            if is_stale_state || is_old_scheduled {
                debug!(%odata_id, state, "deleting stale BMC job");
                let _ = self.request_json(host, creds, Method::DELETE, odata_id, None).await;
            }
        }
        Ok(())
    }

    async fn wait_for_all_jobs_complete(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let body = self
                .get_json(host, creds, "/redfish/v1/Managers/iDRAC.Embedded.1/Jobs")
                .await?;
            let members = body.get("Members").and_then(Value::as_array).cloned().unwrap_or_default();

            let mut any_active = false;
            for member in members {
                let Some(odata_id) = member.get("@odata.id").and_then(Value::as_str) else { continue };
                let detail = self.get_json(host, creds, odata_id).await?;
                let state = detail.get("JobState").and_then(Value::as_str).unwrap_or("");
                if matches!(state, "Scheduled" | "Running" | "New") {
                    any_active = true;
                    break;
                }
            }

            if !any_active {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(timeout));
            }
            sleep(poll_interval).await;
        }
    }

    async fn graceful_reboot(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()> {
        let body = serde_json::json!({ "ResetType": "GracefulRestart" });
        self.request_json(host, creds, Method::POST, endpoints::SYSTEM_RESET, Some(body)).await?;
        Ok(())
    }

    async fn power_on(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()> {
        let body = serde_json::json!({ "ResetType": "On" });
        self.request_json(host, creds, Method::POST, endpoints::SYSTEM_RESET, Some(body)).await?;
        Ok(())
    }

    async fn graceful_shutdown(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<()> {
        let body = serde_json::json!({ "ResetType": "GracefulShutdown" });
        self.request_json(host, creds, Method::POST, endpoints::SYSTEM_RESET, Some(body)).await?;
        Ok(())
    }

    async fn export_scp(
        &self,
        host: &BmcEndpoint,
        creds: &BmcCredentials,
        target: ScpTarget,
    ) -> Result<ScpExport> {
        let target_str = match target {
            ScpTarget::All => "ALL",
            ScpTarget::Bios => "BIOS",
            ScpTarget::Raid => "RAID",
            ScpTarget::Nic => "NIC",
        };
        let body = serde_json::json!({
            "ExportFormat": "JSON",
            "ShareParameters": { "Target": target_str },
        });
        let resp = self
            .request_json(host, creds, Method::POST, endpoints::MANAGER_EXPORT_SCP, Some(body))
            .await?;
        let content = resp.to_string();
        Ok(ScpExport { bytes: content.len(), content })
    }

    async fn ping(&self, host: &BmcEndpoint, creds: &BmcCredentials) -> Result<bool> {
        match self.create_session(host, creds).await {
            Ok(session_id) => {
                self.teardown_session(host, creds, &session_id).await;
                Ok(true)
            }
            Err(EngineError::CircuitOpen { .. }) => Ok(false),
            Err(e) => {
                debug!(%host.address, error = %e, "bmc ping failed");
                Ok(false)
            }
        }
    }
}

/// Returns `true` if a catalog job's terminal message matches one of the
/// "nothing to apply" indicators (spec §4.6d).
pub fn is_no_applicable_updates_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    NO_APPLICABLE_UPDATES_INDICATORS.iter().any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_no_applicable_updates_messages() {
        assert!(is_no_applicable_updates_message("System is up to date."));
        assert!(is_no_applicable_updates_message("No applicable updates found for this system."));
        assert!(!is_no_applicable_updates_message("Update staged, reboot required."));
    }
}
