//! Distributed store gateway.
//!
//! The store is the cluster's coordination point: upstream placement writes
//! desired workloads into it, and cells durably claim the workloads they
//! take ownership of. This module defines the narrow capability surface the
//! agent consumes ([`StoreGateway`]) and an HTTP-backed implementation.
//!
//! The store serializes claims per guid: a second claim for an
//! already-claimed guid is rejected, which is what makes duplicate desired
//! events safe without any deduplication in the agent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use loft_models::DesiredWorkload;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::retry::{retry_with_backoff, BackoffPolicy, DEFAULT_COMPENSATION_ATTEMPTS};

/// Errors surfaced by store gateway implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the operation did not complete.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Another cell already holds the started claim for this guid.
    #[error("workload {0} is already claimed")]
    AlreadyClaimed(String),

    /// The store answered but refused the operation.
    #[error("store rejected {operation}: {status} - {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },
}

/// Capability surface of the distributed store, as consumed by the agent.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Subscribe to the desired-workload feed.
    ///
    /// Events arrive on the returned channel until the feed ends or the
    /// receiver is dropped. The scope narrows the feed server-side where
    /// supported; the agent still filters every event itself.
    async fn subscribe_desired(
        &self,
        stack_scope: &str,
    ) -> Result<mpsc::Receiver<DesiredWorkload>, StoreError>;

    /// Durably claim a desired workload as started on this cell.
    ///
    /// Fails with [`StoreError::AlreadyClaimed`] if any cell (including this
    /// one) already claimed the guid.
    async fn claim_started(&self, workload: &DesiredWorkload) -> Result<(), StoreError>;

    /// Retract a started claim made by [`claim_started`](Self::claim_started).
    ///
    /// Compensation path: implementations retry transient failures before
    /// surfacing an error, since a stale claim is a correctness violation.
    async fn retract_started(&self, guid: &str) -> Result<(), StoreError>;

    /// List all workloads currently claimed as started, cluster-wide.
    async fn list_started(&self) -> Result<Vec<DesiredWorkload>, StoreError>;
}

/// A started claim as stored by the distributed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedRecord {
    pub cell_id: String,
    pub claimed_at: DateTime<Utc>,
    pub workload: DesiredWorkload,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    cell_id: &'a str,
    claimed_at: DateTime<Utc>,
    workload: &'a DesiredWorkload,
}

/// HTTP client for the distributed store API.
pub struct HttpStoreGateway {
    client: reqwest::Client,
    base_url: String,
    cell_id: String,
    backoff: BackoffPolicy,
}

impl HttpStoreGateway {
    /// Create a new store gateway client.
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: config.store_url.clone(),
            cell_id: config.cell_id.clone(),
            backoff: BackoffPolicy::default(),
        }
    }

    async fn retract_once(&self, guid: &str) -> Result<(), StoreError> {
        let url = format!("{}/v1/workloads/{}/started", self.base_url, guid);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // Claim already gone: retraction is idempotent.
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Rejected {
                    operation: "retract_started",
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl StoreGateway for HttpStoreGateway {
    async fn subscribe_desired(
        &self,
        stack_scope: &str,
    ) -> Result<mpsc::Receiver<DesiredWorkload>, StoreError> {
        let url = format!(
            "{}/v1/workloads/desired/watch?stack={}",
            self.base_url, stack_scope
        );
        debug!(url = %url, "Subscribing to desired-workload feed");

        // The watch endpoint streams newline-delimited JSON indefinitely, so
        // it gets its own client without a request timeout.
        let watch_client = reqwest::Client::new();
        let response = watch_client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                operation: "subscribe_desired",
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(pump_watch_body(response, tx));
        Ok(rx)
    }

    async fn claim_started(&self, workload: &DesiredWorkload) -> Result<(), StoreError> {
        let url = format!("{}/v1/workloads/{}/started", self.base_url, workload.guid);
        let request = ClaimRequest {
            cell_id: &self.cell_id,
            claimed_at: Utc::now(),
            workload,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(StoreError::AlreadyClaimed(workload.guid.clone())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Rejected {
                    operation: "claim_started",
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn retract_started(&self, guid: &str) -> Result<(), StoreError> {
        retry_with_backoff(
            &self.backoff,
            DEFAULT_COMPENSATION_ATTEMPTS,
            "retract_started",
            || self.retract_once(guid),
        )
        .await
    }

    async fn list_started(&self) -> Result<Vec<DesiredWorkload>, StoreError> {
        let url = format!("{}/v1/workloads/started", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                operation: "list_started",
                status: status.as_u16(),
                body,
            });
        }

        let records: Vec<StartedRecord> = response
            .json()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.workload).collect())
    }
}

/// Forward newline-delimited JSON events from the watch body into the
/// subscriber channel until the stream or the subscriber goes away.
async fn pump_watch_body(response: reqwest::Response, tx: mpsc::Sender<DesiredWorkload>) {
    let mut body = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Desired-workload watch stream failed");
                break;
            }
        };

        buf.extend_from_slice(&chunk);

        while let Some(newline) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<DesiredWorkload>(line) {
                Ok(workload) => {
                    if tx.send(workload).await.is_err() {
                        // Subscriber dropped the receiver.
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed desired-workload event"),
            }
        }
    }

    debug!("Desired-workload watch stream ended");
}
