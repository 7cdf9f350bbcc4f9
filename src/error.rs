// src/error.rs

//! Defines the primary error type for the engine.

use std::sync::Arc;
use thiserror::Error;

/// A typed, BMC-reported failure, as described by the adapter's error taxonomy.
///
/// `retryable` with a `wait_hint_seconds` signals that the orchestrator may
/// retry the operation after the hinted delay; `retryable = false` is
/// terminal for the operation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
    pub retryable: bool,
    pub wait_hint_seconds: Option<u64>,
}

impl AdapterError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
            retryable: false,
            wait_hint_seconds: None,
        }
    }

    pub fn retryable(mut self, wait_hint_seconds: u64) -> Self {
        self.retryable = true;
        self.wait_hint_seconds = Some(wait_hint_seconds);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AdapterError {}

/// The main error enum, representing all possible failures within the engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("job store error: {0}")]
    JobStore(String),

    #[error("circuit open for host {host} (retry in {retry_in_seconds}s)")]
    CircuitOpen { host: String, retry_in_seconds: u64 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("adapter error: {0}")]
    Adapter(AdapterError),

    #[error("no eligible hosts")]
    NoEligibleHosts,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::HttpClientError(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(e: url::ParseError) -> Self {
        EngineError::Config(format!("invalid URL: {e}"))
    }
}

impl From<AdapterError> for EngineError {
    fn from(e: AdapterError) -> Self {
        EngineError::Adapter(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_error_builder_sets_retry_fields() {
        let err = AdapterError::new("RAC0508", "export in progress")
            .retryable(30)
            .with_status(503);
        assert!(err.retryable);
        assert_eq!(err.wait_hint_seconds, Some(30));
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn engine_error_wraps_adapter_error() {
        let adapter_err = AdapterError::new("AUTH001", "bad credentials");
        let engine_err: EngineError = adapter_err.clone().into();
        match engine_err {
            EngineError::Adapter(e) => assert_eq!(e, adapter_err),
            other => panic!("expected Adapter variant, got {other:?}"),
        }
    }
}
