// src/job_store/mod.rs

//! Job Store client (spec §6): the external collaborator the engine polls
//! for dispatchable jobs and patches with status/details updates.
//!
//! Only an in-memory fake ships here; a real deployment points this trait
//! at whatever system of record holds jobs (a REST API, a database) —
//! out of scope for this crate per spec §1/§9.

use crate::model::{Job, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Map;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Jobs in `pending` status whose scheduled-at timestamp (if any) has
    /// passed, in creation order.
    async fn fetch_pending_jobs(&self) -> crate::error::Result<Vec<Job>>;

    async fn fetch_job(&self, job_id: Uuid) -> crate::error::Result<Option<Job>>;

    /// Patches `status` and merges `details_patch` into the job's details.
    /// Sets `started_at` when transitioning into `running`, `completed_at`
    /// when transitioning into any terminal status.
    async fn patch_job(
        &self,
        job_id: Uuid,
        status: Option<JobStatus>,
        details_patch: Option<Map<String, serde_json::Value>>,
    ) -> crate::error::Result<()>;
}

pub type SharedJobStore = Arc<dyn JobStore>;

/// In-memory fake used by tests and by a standalone demo binary; not
/// intended as a production Job Store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn fetch_pending_jobs(&self) -> crate::error::Result<Vec<Job>> {
        let mut pending: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().status == JobStatus::Pending)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending)
    }

    async fn fetch_job(&self, job_id: Uuid) -> crate::error::Result<Option<Job>> {
        Ok(self.jobs.get(&job_id).map(|r| r.clone()))
    }

    async fn patch_job(
        &self,
        job_id: Uuid,
        status: Option<JobStatus>,
        details_patch: Option<Map<String, serde_json::Value>>,
    ) -> crate::error::Result<()> {
        let mut job = self.jobs.get_mut(&job_id).ok_or_else(|| {
            crate::error::EngineError::JobStore(format!("unknown job {job_id}"))
        })?;

        if let Some(status) = status {
            if status == JobStatus::Running && job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            job.status = status;
        }
        if let Some(patch) = details_patch {
            job.details.merge(patch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobDetails, TargetScope};

    fn sample_job() -> Job {
        Job {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            target_scope: TargetScope::ServerIds(vec!["host-1".into()]),
            details: JobDetails::default(),
            created_by: "operator".into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn patch_to_running_sets_started_at_once() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        let id = job.id;
        store.insert(job);

        store.patch_job(id, Some(JobStatus::Running), None).await.unwrap();
        let first = store.fetch_job(id).await.unwrap().unwrap().started_at;
        assert!(first.is_some());

        store.patch_job(id, Some(JobStatus::Running), None).await.unwrap();
        let second = store.fetch_job(id).await.unwrap().unwrap().started_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn patch_to_terminal_status_sets_completed_at() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        let id = job.id;
        store.insert(job);

        store.patch_job(id, Some(JobStatus::Failed), None).await.unwrap();
        let job = store.fetch_job(id).await.unwrap().unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn fetch_pending_jobs_only_returns_pending_in_creation_order() {
        let store = InMemoryJobStore::new();
        let mut first = sample_job();
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = sample_job();
        second.status = JobStatus::Running;
        let mut third = sample_job();
        third.created_at = Utc::now();

        let (first_id, third_id) = (first.id, third.id);
        store.insert(first);
        store.insert(second);
        store.insert(third);

        let pending = store.fetch_pending_jobs().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[1].id, third_id);
    }
}
