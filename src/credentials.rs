// src/credentials.rs

//! Credential resolution (spec §4.5 pre-flight step "resolve credentials").
//! An external collaborator like `JobStore`/`HostInventory`; production
//! deployments back this with a secrets manager. Only an in-memory fake
//! ships here.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn resolve(&self, host_id: &str) -> Result<(String, String)>;
}

pub type SharedCredentialsProvider = Arc<dyn CredentialsProvider>;

#[derive(Default)]
pub struct InMemoryCredentialsProvider {
    entries: DashMap<String, (String, String)>,
}

impl InMemoryCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host_id: impl Into<String>, username: impl Into<String>, password: impl Into<String>) {
        self.entries.insert(host_id.into(), (username.into(), password.into()));
    }
}

#[async_trait]
impl CredentialsProvider for InMemoryCredentialsProvider {
    async fn resolve(&self, host_id: &str) -> Result<(String, String)> {
        self.entries
            .get(host_id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::Config(format!("no credentials configured for host {host_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_configured_credentials() {
        let provider = InMemoryCredentialsProvider::new();
        provider.set("esx-01", "root", "hunter2");
        let (user, pass) = provider.resolve("esx-01").await.unwrap();
        assert_eq!(user, "root");
        assert_eq!(pass, "hunter2");
    }

    #[tokio::test]
    async fn missing_host_is_a_config_error() {
        let provider = InMemoryCredentialsProvider::new();
        assert!(provider.resolve("unknown").await.is_err());
    }
}
