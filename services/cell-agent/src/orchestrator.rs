//! Per-workload placement saga.
//!
//! One desired workload is driven through fixed, strictly ordered steps:
//!
//! ```text
//! filter -> reserve -> claim -> initialize -> run
//! ```
//!
//! There is no cross-system transaction between the store and the execution
//! backend, so a failure at any step compensates backward through the steps
//! already completed: a failed claim deletes the allocation; a failed
//! initialize or run deletes the allocation and retracts the claim. The
//! claim is taken before the container is initialized so that compensation
//! only ever moves backward — observers may briefly see a claimed workload
//! that is not yet running, never the reverse.
//!
//! The orchestrator never retries a step and never deduplicates events. A
//! duplicate event for an already-claimed guid fails its claim step against
//! the store and cleans up its own allocation.

use std::sync::Arc;

use loft_models::DesiredWorkload;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{
    AllocationRequest, ExecutorClient, ExecutorError, InitializationRequest, RunRequest,
};
use crate::store::{StoreError, StoreGateway};

/// Terminal result of a successful placement run.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementOutcome {
    /// The workload requires a different stack; nothing was touched.
    Filtered,

    /// The workload is running on this cell.
    Running {
        allocation_guid: String,
        executor_guid: String,
    },
}

/// Terminal failure of a placement run, one variant per saga step.
///
/// Every variant except `CompensationFailed` means compensation completed
/// and neither an allocation nor a claim was left behind.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// Reserving the container failed. Nothing was created, nothing to undo.
    #[error("failed to reserve a container for {guid}: {source}")]
    ReservationFailed {
        guid: String,
        #[source]
        source: ExecutorError,
    },

    /// Claiming the workload as started failed; the allocation was deleted.
    #[error("failed to claim {guid} as started: {source}")]
    ClaimFailed {
        guid: String,
        #[source]
        source: StoreError,
    },

    /// Initializing the container failed; the allocation was deleted and
    /// the claim retracted.
    #[error("failed to initialize container {allocation_guid} for {guid}: {source}")]
    InitializationFailed {
        guid: String,
        allocation_guid: String,
        #[source]
        source: ExecutorError,
    },

    /// Starting the workload failed; the allocation was deleted and the
    /// claim retracted.
    #[error("failed to start {guid} in container {allocation_guid}: {source}")]
    StartFailed {
        guid: String,
        allocation_guid: String,
        #[source]
        source: ExecutorError,
    },

    /// Compensation itself failed after the collaborator's own retries.
    /// The named residue is leaked until an operator reconciles it.
    #[error("compensation for {guid} left residue: {residue}")]
    CompensationFailed { guid: String, residue: String },
}

impl PlacementError {
    /// True when the run left an allocation or claim behind.
    pub fn left_residue(&self) -> bool {
        matches!(self, PlacementError::CompensationFailed { .. })
    }
}

/// Drives one desired workload through the placement saga.
pub struct PlacementOrchestrator {
    stack: String,
    store: Arc<dyn StoreGateway>,
    executor: Arc<dyn ExecutorClient>,
}

impl PlacementOrchestrator {
    /// Create a new orchestrator for a cell providing `stack`.
    pub fn new(
        stack: impl Into<String>,
        store: Arc<dyn StoreGateway>,
        executor: Arc<dyn ExecutorClient>,
    ) -> Self {
        Self {
            stack: stack.into(),
            store,
            executor,
        }
    }

    /// Run the full placement saga for one desired workload.
    pub async fn place(&self, workload: DesiredWorkload) -> Result<PlacementOutcome, PlacementError> {
        // Filter. Pure decision, before any resource is touched.
        if workload.stack != self.stack {
            debug!(
                guid = %workload.guid,
                workload_stack = %workload.stack,
                cell_stack = %self.stack,
                "Stack mismatch, ignoring desired workload"
            );
            return Ok(PlacementOutcome::Filtered);
        }

        let guid = workload.guid.clone();

        // Reserve. A failure here needs no compensation.
        let allocation_guid = Uuid::new_v4().to_string();
        let handle = self
            .executor
            .allocate(
                &allocation_guid,
                AllocationRequest {
                    memory_mb: workload.memory_mb,
                    disk_mb: workload.disk_mb,
                },
            )
            .await
            .map_err(|source| {
                warn!(guid = %guid, error = %source, "Container reservation failed");
                PlacementError::ReservationFailed {
                    guid: guid.clone(),
                    source,
                }
            })?;

        info!(
            guid = %guid,
            allocation_guid = %allocation_guid,
            executor_guid = %handle.executor_guid,
            memory_mb = workload.memory_mb,
            disk_mb = workload.disk_mb,
            "Reserved container"
        );

        // Claim. From here on the workload is visible as started.
        if let Err(source) = self.store.claim_started(&workload).await {
            warn!(
                guid = %guid,
                allocation_guid = %allocation_guid,
                error = %source,
                "Started claim failed, releasing allocation"
            );
            self.compensate(&guid, &allocation_guid, false).await?;
            return Err(PlacementError::ClaimFailed { guid, source });
        }

        // Initialize.
        if let Err(source) = self
            .executor
            .initialize(
                &allocation_guid,
                InitializationRequest {
                    log: workload.log.clone(),
                },
            )
            .await
        {
            warn!(
                guid = %guid,
                allocation_guid = %allocation_guid,
                error = %source,
                "Container initialization failed, releasing allocation and retracting claim"
            );
            self.compensate(&guid, &allocation_guid, true).await?;
            return Err(PlacementError::InitializationFailed {
                guid,
                allocation_guid,
                source,
            });
        }

        // Start.
        if let Err(source) = self
            .executor
            .run(
                &allocation_guid,
                RunRequest {
                    actions: workload.actions.clone(),
                },
            )
            .await
        {
            warn!(
                guid = %guid,
                allocation_guid = %allocation_guid,
                error = %source,
                "Workload start failed, releasing allocation and retracting claim"
            );
            self.compensate(&guid, &allocation_guid, true).await?;
            return Err(PlacementError::StartFailed {
                guid,
                allocation_guid,
                source,
            });
        }

        info!(
            guid = %guid,
            allocation_guid = %allocation_guid,
            "Workload running"
        );

        Ok(PlacementOutcome::Running {
            allocation_guid,
            executor_guid: handle.executor_guid,
        })
    }

    /// Undo completed steps after a failure: delete the allocation and,
    /// when the claim step had succeeded, retract the claim.
    ///
    /// Both undo calls are always attempted; a failure of the first must not
    /// leave the second residue standing as well.
    async fn compensate(
        &self,
        guid: &str,
        allocation_guid: &str,
        retract_claim: bool,
    ) -> Result<(), PlacementError> {
        let mut residue = Vec::new();

        if let Err(e) = self.executor.delete(allocation_guid).await {
            residue.push(format!("allocation {allocation_guid} ({e})"));
        }

        if retract_claim {
            if let Err(e) = self.store.retract_started(guid).await {
                residue.push(format!("started claim ({e})"));
            }
        }

        if residue.is_empty() {
            Ok(())
        } else {
            Err(PlacementError::CompensationFailed {
                guid: guid.to_string(),
                residue: residue.join(", "),
            })
        }
    }
}
