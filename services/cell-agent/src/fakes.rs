//! In-memory collaborator fakes.
//!
//! Used by the integration tests and for development runs without a real
//! store or execution backend. Both fakes append every saga-relevant call to
//! a shared [`CallLog`], which gives tests a single ordered view across the
//! two collaborators — the only way to check that a claim really happened
//! before initialize, or that compensation ran after a failure.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loft_models::DesiredWorkload;
use tokio::sync::mpsc;

use crate::executor::{
    AllocationRequest, ContainerHandle, ExecutorClient, ExecutorError, InitializationRequest,
    RunRequest,
};
use crate::store::{StoreError, StoreGateway};

/// One recorded collaborator call, in arrival order across both fakes.
#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorCall {
    Allocate {
        allocation_guid: String,
        request: AllocationRequest,
    },
    Claim {
        guid: String,
    },
    Initialize {
        allocation_guid: String,
        request: InitializationRequest,
    },
    Run {
        allocation_guid: String,
        request: RunRequest,
    },
    Delete {
        allocation_guid: String,
    },
    Retract {
        guid: String,
    },
}

/// Append-only record of collaborator calls, shared between fakes.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<CollaboratorCall>>,
}

impl CallLog {
    pub fn record(&self, call: CollaboratorCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn snapshot(&self) -> Vec<CollaboratorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().unwrap().is_empty()
    }

    /// Index of the first call matching `pred`, if any.
    pub fn position(&self, pred: impl Fn(&CollaboratorCall) -> bool) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(pred)
    }
}

/// In-memory distributed store.
pub struct FakeStore {
    calls: Arc<CallLog>,
    started: Mutex<Vec<(DesiredWorkload, DateTime<Utc>)>>,
    desired_tx: Mutex<Option<mpsc::Sender<DesiredWorkload>>>,
    claim_error: Mutex<Option<String>>,
    retract_error: Mutex<Option<String>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::with_call_log(Arc::new(CallLog::default()))
    }

    pub fn with_call_log(calls: Arc<CallLog>) -> Self {
        Self {
            calls,
            started: Mutex::new(Vec::new()),
            desired_tx: Mutex::new(None),
            claim_error: Mutex::new(None),
            retract_error: Mutex::new(None),
        }
    }

    pub fn call_log(&self) -> Arc<CallLog> {
        Arc::clone(&self.calls)
    }

    /// Emit a desired-workload event to the current subscriber, if any.
    pub async fn emit_desired(&self, workload: DesiredWorkload) {
        let tx = self.desired_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            // A closed channel means the subscriber stopped; the event is
            // simply not delivered, matching a halted intake loop.
            let _ = tx.send(workload).await;
        }
    }

    /// Make every subsequent claim fail with the given message.
    pub fn fail_claims(&self, message: &str) {
        *self.claim_error.lock().unwrap() = Some(message.to_string());
    }

    /// Make every subsequent retraction fail with the given message.
    pub fn fail_retractions(&self, message: &str) {
        *self.retract_error.lock().unwrap() = Some(message.to_string());
    }

    /// Workloads currently claimed as started.
    pub fn started_workloads(&self) -> Vec<DesiredWorkload> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(w, _)| w.clone())
            .collect()
    }
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreGateway for FakeStore {
    async fn subscribe_desired(
        &self,
        _stack_scope: &str,
    ) -> Result<mpsc::Receiver<DesiredWorkload>, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        *self.desired_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn claim_started(&self, workload: &DesiredWorkload) -> Result<(), StoreError> {
        self.calls.record(CollaboratorCall::Claim {
            guid: workload.guid.clone(),
        });

        if let Some(message) = self.claim_error.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(message));
        }

        let mut started = self.started.lock().unwrap();
        if started.iter().any(|(w, _)| w.guid == workload.guid) {
            return Err(StoreError::AlreadyClaimed(workload.guid.clone()));
        }

        started.push((workload.clone(), Utc::now()));
        Ok(())
    }

    async fn retract_started(&self, guid: &str) -> Result<(), StoreError> {
        self.calls.record(CollaboratorCall::Retract {
            guid: guid.to_string(),
        });

        if let Some(message) = self.retract_error.lock().unwrap().clone() {
            return Err(StoreError::Unavailable(message));
        }

        self.started.lock().unwrap().retain(|(w, _)| w.guid != guid);
        Ok(())
    }

    async fn list_started(&self) -> Result<Vec<DesiredWorkload>, StoreError> {
        Ok(self.started_workloads())
    }
}

/// In-memory execution backend.
pub struct FakeExecutor {
    calls: Arc<CallLog>,
    executor_guid: String,
    live_allocations: Mutex<HashSet<String>>,
    allocate_error: Mutex<Option<String>>,
    initialize_error: Mutex<Option<String>>,
    run_error: Mutex<Option<String>>,
    delete_error: Mutex<Option<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::with_call_log(Arc::new(CallLog::default()))
    }

    pub fn with_call_log(calls: Arc<CallLog>) -> Self {
        Self {
            calls,
            executor_guid: "the-executor-guid".to_string(),
            live_allocations: Mutex::new(HashSet::new()),
            allocate_error: Mutex::new(None),
            initialize_error: Mutex::new(None),
            run_error: Mutex::new(None),
            delete_error: Mutex::new(None),
        }
    }

    pub fn call_log(&self) -> Arc<CallLog> {
        Arc::clone(&self.calls)
    }

    pub fn fail_allocations(&self, message: &str) {
        *self.allocate_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_initializations(&self, message: &str) {
        *self.initialize_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_runs(&self, message: &str) {
        *self.run_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_deletions(&self, message: &str) {
        *self.delete_error.lock().unwrap() = Some(message.to_string());
    }

    /// Allocations reserved and not yet deleted.
    pub fn live_allocations(&self) -> Vec<String> {
        let mut allocations: Vec<String> =
            self.live_allocations.lock().unwrap().iter().cloned().collect();
        allocations.sort();
        allocations
    }
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorClient for FakeExecutor {
    async fn allocate(
        &self,
        allocation_guid: &str,
        request: AllocationRequest,
    ) -> Result<ContainerHandle, ExecutorError> {
        self.calls.record(CollaboratorCall::Allocate {
            allocation_guid: allocation_guid.to_string(),
            request,
        });

        if let Some(message) = self.allocate_error.lock().unwrap().clone() {
            return Err(ExecutorError::Unavailable(message));
        }

        self.live_allocations
            .lock()
            .unwrap()
            .insert(allocation_guid.to_string());

        Ok(ContainerHandle {
            allocation_guid: allocation_guid.to_string(),
            executor_guid: self.executor_guid.clone(),
        })
    }

    async fn initialize(
        &self,
        allocation_guid: &str,
        request: InitializationRequest,
    ) -> Result<(), ExecutorError> {
        self.calls.record(CollaboratorCall::Initialize {
            allocation_guid: allocation_guid.to_string(),
            request,
        });

        if let Some(message) = self.initialize_error.lock().unwrap().clone() {
            return Err(ExecutorError::Unavailable(message));
        }

        if !self.live_allocations.lock().unwrap().contains(allocation_guid) {
            return Err(ExecutorError::UnknownAllocation(allocation_guid.to_string()));
        }

        Ok(())
    }

    async fn run(&self, allocation_guid: &str, request: RunRequest) -> Result<(), ExecutorError> {
        self.calls.record(CollaboratorCall::Run {
            allocation_guid: allocation_guid.to_string(),
            request,
        });

        if let Some(message) = self.run_error.lock().unwrap().clone() {
            return Err(ExecutorError::Unavailable(message));
        }

        if !self.live_allocations.lock().unwrap().contains(allocation_guid) {
            return Err(ExecutorError::UnknownAllocation(allocation_guid.to_string()));
        }

        Ok(())
    }

    async fn delete(&self, allocation_guid: &str) -> Result<(), ExecutorError> {
        self.calls.record(CollaboratorCall::Delete {
            allocation_guid: allocation_guid.to_string(),
        });

        if let Some(message) = self.delete_error.lock().unwrap().clone() {
            return Err(ExecutorError::Unavailable(message));
        }

        self.live_allocations.lock().unwrap().remove(allocation_guid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use loft_models::LogConfig;

    use super::*;

    fn sample_workload(guid: &str) -> DesiredWorkload {
        DesiredWorkload {
            guid: guid.to_string(),
            stack: "lucid64".to_string(),
            memory_mb: 64,
            disk_mb: 256,
            actions: vec![],
            log: LogConfig {
                guid: guid.to_string(),
                source_name: "APP".to_string(),
                index: None,
            },
        }
    }

    #[tokio::test]
    async fn claim_rejects_duplicate_guid() {
        let store = FakeStore::new();
        let workload = sample_workload("g1");

        store.claim_started(&workload).await.unwrap();
        let err = store.claim_started(&workload).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyClaimed(guid) if guid == "g1"));

        assert_eq!(store.list_started().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retract_removes_claim() {
        let store = FakeStore::new();
        store.claim_started(&sample_workload("g1")).await.unwrap();

        store.retract_started("g1").await.unwrap();
        assert!(store.list_started().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let store = FakeStore::new();
        let mut rx = store.subscribe_desired("lucid64").await.unwrap();

        store.emit_desired(sample_workload("g1")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.guid, "g1");
    }

    #[tokio::test]
    async fn delete_releases_allocation() {
        let executor = FakeExecutor::new();
        let request = AllocationRequest {
            memory_mb: 64,
            disk_mb: 256,
        };

        executor.allocate("alloc-1", request).await.unwrap();
        assert_eq!(executor.live_allocations(), vec!["alloc-1".to_string()]);

        executor.delete("alloc-1").await.unwrap();
        assert!(executor.live_allocations().is_empty());
    }

    #[tokio::test]
    async fn shared_call_log_preserves_cross_fake_order() {
        let calls = Arc::new(CallLog::default());
        let store = FakeStore::with_call_log(Arc::clone(&calls));
        let executor = FakeExecutor::with_call_log(Arc::clone(&calls));

        executor
            .allocate(
                "alloc-1",
                AllocationRequest {
                    memory_mb: 64,
                    disk_mb: 256,
                },
            )
            .await
            .unwrap();
        store.claim_started(&sample_workload("g1")).await.unwrap();

        let snapshot = calls.snapshot();
        assert!(matches!(snapshot[0], CollaboratorCall::Allocate { .. }));
        assert!(matches!(snapshot[1], CollaboratorCall::Claim { .. }));
    }
}
