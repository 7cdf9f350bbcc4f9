// src/journal/mod.rs

//! Workflow Journal (spec §4.4): the durable, UI-facing record of per-step
//! progress. Upserts on `(job, step_number)`; never fails a job over a
//! serialisation problem.

use crate::model::{StepStatus, WorkflowStep};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[async_trait]
pub trait WorkflowJournal: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn record_step(
        &self,
        job_id: Uuid,
        step_number: u32,
        step_name: &str,
        status: StepStatus,
        details: Option<Value>,
        error: Option<String>,
    );

    /// Returns the most recently recorded step for a job, if any (the UI's
    /// read path per spec §4.4).
    async fn latest_step(&self, job_id: Uuid) -> Option<WorkflowStep>;
}

/// Deep-sanitises a `details` value before it's written: anything that
/// fails to round-trip through `serde_json` (a handle into an external SDK
/// leaking through, e.g.) is replaced by its `Display`/debug string form.
/// `serde_json::Value` is always already JSON so in practice this only
/// strips NaN/Infinity floats, which `serde_json` itself refuses to encode.
pub fn sanitize_details(details: Value) -> Value {
    match details {
        Value::Number(n) => {
            if n.as_f64().map(|f| f.is_finite()).unwrap_or(true) {
                Value::Number(n)
            } else {
                Value::String(n.to_string())
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_details).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_details(v)))
                .collect(),
        ),
        other => other,
    }
}

/// In-process journal backed by a `DashMap`, one row per `(job, step_number)`,
/// so concurrent jobs never contend on a shared lock.
#[derive(Default)]
pub struct InMemoryWorkflowJournal {
    rows: DashMap<(Uuid, u32), WorkflowStep>,
    latest: DashMap<Uuid, u32>,
}

impl InMemoryWorkflowJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowJournal for InMemoryWorkflowJournal {
    async fn record_step(
        &self,
        job_id: Uuid,
        step_number: u32,
        step_name: &str,
        status: StepStatus,
        details: Option<Value>,
        error: Option<String>,
    ) {
        let details = match details {
            Some(d) => {
                let sanitized = sanitize_details(d.clone());
                if serde_json::to_string(&sanitized).is_err() {
                    warn!(%job_id, step_number, "dropping unserialisable details field");
                    Value::Null
                } else {
                    sanitized
                }
            }
            None => Value::Null,
        };

        let key = (job_id, step_number);
        let now = chrono::Utc::now();
        let completed_at = status.is_terminal().then_some(now);

        let entry = self.rows.entry(key).or_insert_with(|| WorkflowStep {
            job_id,
            step_number,
            step_name: step_name.to_string(),
            status,
            started_at: now,
            completed_at: None,
            details: Value::Null,
            error: None,
        });

        let mut row = entry;
        // Upsert: a terminal row transitioning to a different status (the
        // paused -> resumed case) overwrites rather than appends a new row.
        row.status = status;
        row.step_name = step_name.to_string();
        row.details = details;
        row.error = error;
        row.completed_at = completed_at;

        let prior_latest = self.latest.get(&job_id).map(|r| *r).unwrap_or(0);
        self.latest.insert(job_id, step_number.max(prior_latest));
    }

    async fn latest_step(&self, job_id: Uuid) -> Option<WorkflowStep> {
        let step_number = *self.latest.get(&job_id)?;
        self.rows.get(&(job_id, step_number)).map(|r| r.clone())
    }
}

impl InMemoryWorkflowJournal {
    /// Every recorded row for `job_id`, in step-number order. Test-only
    /// introspection; the trait itself only exposes `latest_step`.
    pub fn steps(&self, job_id: Uuid) -> Vec<WorkflowStep> {
        let mut rows: Vec<WorkflowStep> = self
            .rows
            .iter()
            .filter(|entry| entry.key().0 == job_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|r| r.step_number);
        rows
    }
}

pub type SharedWorkflowJournal = Arc<dyn WorkflowJournal>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upserts_same_step_number_instead_of_duplicating() {
        let journal = InMemoryWorkflowJournal::new();
        let job_id = Uuid::new_v4();

        journal.record_step(job_id, 3, "enter_maintenance", StepStatus::Running, None, None).await;
        journal
            .record_step(job_id, 3, "enter_maintenance", StepStatus::Completed, None, None)
            .await;

        assert_eq!(journal.rows.len(), 1);
        let latest = journal.latest_step(job_id).await.unwrap();
        assert_eq!(latest.status, StepStatus::Completed);
        assert!(latest.completed_at.is_some());
    }

    #[tokio::test]
    async fn paused_then_resumed_step_overwrites_terminal_row() {
        let journal = InMemoryWorkflowJournal::new();
        let job_id = Uuid::new_v4();

        journal
            .record_step(job_id, 5, "blocker_scan", StepStatus::Paused, None, None)
            .await;
        journal
            .record_step(job_id, 5, "blocker_scan", StepStatus::Completed, None, None)
            .await;

        let row = journal.rows.get(&(job_id, 5)).unwrap();
        assert_eq!(row.status, StepStatus::Completed);
    }

    #[test]
    fn sanitize_details_replaces_non_finite_numbers() {
        let nan_as_string = serde_json::Value::String("NaN".to_string());
        let sanitized = sanitize_details(nan_as_string.clone());
        assert_eq!(sanitized, nan_as_string);
    }

    #[tokio::test]
    async fn latest_step_tracks_highest_step_number_seen() {
        let journal = InMemoryWorkflowJournal::new();
        let job_id = Uuid::new_v4();
        journal.record_step(job_id, 1, "resolve_targets", StepStatus::Completed, None, None).await;
        journal.record_step(job_id, 2, "preflight", StepStatus::Running, None, None).await;

        let latest = journal.latest_step(job_id).await.unwrap();
        assert_eq!(latest.step_number, 2);
    }
}
