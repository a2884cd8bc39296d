//! Execution backend client.
//!
//! The execution backend owns container allocations on this cell. A
//! placement run drives one allocation through reserve, initialize, and run;
//! deletion is the compensation path for any of those going wrong.

use std::time::Duration;

use async_trait::async_trait;
use loft_models::{LogConfig, WorkloadAction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::retry::{retry_with_backoff, BackoffPolicy, DEFAULT_COMPENSATION_ATTEMPTS};

/// Errors surfaced by execution backend clients.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The backend could not be reached or the operation did not complete.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    /// The backend has no allocation with this guid.
    #[error("unknown allocation {0}")]
    UnknownAllocation(String),

    /// The backend answered but refused the operation.
    #[error("executor rejected {operation} for {allocation_guid}: {status} - {body}")]
    Rejected {
        operation: &'static str,
        allocation_guid: String,
        status: u16,
        body: String,
    },
}

/// Resource reservation for a new allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub memory_mb: u64,
    pub disk_mb: u64,
}

/// Backend handle for a reserved allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub allocation_guid: String,

    /// Backend-assigned guid of the executing host.
    pub executor_guid: String,
}

/// Environment preparation for an allocation, keyed by log routing today.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializationRequest {
    pub log: LogConfig,
}

/// The workload's action sequence, handed to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub actions: Vec<WorkloadAction>,
}

/// Capability surface of the execution backend, as consumed by the agent.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Reserve a resource slot under a caller-chosen allocation guid.
    async fn allocate(
        &self,
        allocation_guid: &str,
        request: AllocationRequest,
    ) -> Result<ContainerHandle, ExecutorError>;

    /// Prepare the execution environment of a reserved allocation.
    async fn initialize(
        &self,
        allocation_guid: &str,
        request: InitializationRequest,
    ) -> Result<(), ExecutorError>;

    /// Start the workload's action sequence inside the allocation.
    async fn run(&self, allocation_guid: &str, request: RunRequest) -> Result<(), ExecutorError>;

    /// Release an allocation.
    ///
    /// Compensation path: implementations retry transient failures before
    /// surfacing an error, since a leaked allocation pins cell resources.
    async fn delete(&self, allocation_guid: &str) -> Result<(), ExecutorError>;
}

/// HTTP client for the execution backend API.
pub struct HttpExecutorClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpExecutorClient {
    /// Create a new execution backend client.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.executor_url.clone(),
            backoff: BackoffPolicy::default(),
        }
    }

    async fn check_response(
        operation: &'static str,
        allocation_guid: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ExecutorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ExecutorError::UnknownAllocation(allocation_guid.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(ExecutorError::Rejected {
            operation,
            allocation_guid: allocation_guid.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn delete_once(&self, allocation_guid: &str) -> Result<(), ExecutorError> {
        let url = format!("{}/v1/containers/{}", self.base_url, allocation_guid);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        // An allocation that is already gone counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        Self::check_response("delete", allocation_guid, response).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn allocate(
        &self,
        allocation_guid: &str,
        request: AllocationRequest,
    ) -> Result<ContainerHandle, ExecutorError> {
        let url = format!("{}/v1/containers/{}", self.base_url, allocation_guid);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        let response = Self::check_response("allocate", allocation_guid, response).await?;
        let handle: ContainerHandle = response
            .json()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        Ok(handle)
    }

    async fn initialize(
        &self,
        allocation_guid: &str,
        request: InitializationRequest,
    ) -> Result<(), ExecutorError> {
        let url = format!(
            "{}/v1/containers/{}/initialize",
            self.base_url, allocation_guid
        );

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        Self::check_response("initialize", allocation_guid, response).await?;
        Ok(())
    }

    async fn run(&self, allocation_guid: &str, request: RunRequest) -> Result<(), ExecutorError> {
        let url = format!("{}/v1/containers/{}/run", self.base_url, allocation_guid);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        Self::check_response("run", allocation_guid, response).await?;
        Ok(())
    }

    async fn delete(&self, allocation_guid: &str) -> Result<(), ExecutorError> {
        retry_with_backoff(
            &self.backoff,
            DEFAULT_COMPENSATION_ATTEMPTS,
            "delete_allocation",
            || self.delete_once(allocation_guid),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use loft_models::EnvironmentVariable;

    use super::*;

    #[test]
    fn allocation_request_serialization() {
        let request = AllocationRequest {
            memory_mb: 128,
            disk_mb: 1024,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"memory_mb":128,"disk_mb":1024}"#);
    }

    #[test]
    fn run_request_round_trips() {
        let request = RunRequest {
            actions: vec![WorkloadAction::RunScript {
                script: "the-script".to_string(),
                env: vec![EnvironmentVariable {
                    key: "THE_KEY".to_string(),
                    value: "THE_VALUE".to_string(),
                }],
                timeout_secs: Some(1),
                resource_limits: Default::default(),
            }],
        };

        let json = serde_json::to_string(&request).unwrap();
        let parsed: RunRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn container_handle_deserialization() {
        let json = r#"{"allocation_guid": "alloc-1", "executor_guid": "the-executor-guid"}"#;
        let handle: ContainerHandle = serde_json::from_str(json).unwrap();
        assert_eq!(handle.allocation_guid, "alloc-1");
        assert_eq!(handle.executor_guid, "the-executor-guid");
    }
}
