//! Desired-workload intake loop.
//!
//! The scheduler bridges the store's desired-workload feed into concurrent
//! placement runs. Each event gets its own spawned task; runs share no
//! mutable state with each other, only the two collaborators. `start`
//! establishes the subscription before returning, so a returned `Ok` doubles
//! as the readiness signal. `stop` only halts intake — placement runs
//! already in flight finish on their own schedule.

use std::sync::{Arc, Mutex};

use loft_models::DesiredWorkload;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::executor::ExecutorClient;
use crate::orchestrator::{PlacementError, PlacementOrchestrator, PlacementOutcome};
use crate::store::{StoreError, StoreGateway};

/// Errors surfaced by the scheduler lifecycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `start` was called on an already-started scheduler.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// `stop` was called before `start`, or twice.
    #[error("scheduler is not running")]
    NotRunning,

    /// The desired-workload subscription could not be established.
    #[error("failed to subscribe to desired-workload feed: {0}")]
    Subscribe(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    NotStarted,
    Running,
    Stopped,
}

/// Subscribes to the desired-workload feed and dispatches placement runs.
pub struct Scheduler {
    stack: String,
    store: Arc<dyn StoreGateway>,
    orchestrator: Arc<PlacementOrchestrator>,
    lifecycle: Mutex<Lifecycle>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a new scheduler for this cell's stack.
    pub fn new(
        config: &Config,
        store: Arc<dyn StoreGateway>,
        executor: Arc<dyn ExecutorClient>,
    ) -> Self {
        let orchestrator = Arc::new(PlacementOrchestrator::new(
            config.stack.clone(),
            Arc::clone(&store),
            executor,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            stack: config.stack.clone(),
            store,
            orchestrator,
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            shutdown_tx,
        }
    }

    /// Subscribe to the feed and start dispatching events.
    ///
    /// Returns once the subscription is established; at that point the
    /// scheduler is ready and events will be delivered. Calling `start`
    /// twice in an instance's lifetime is a programming error and fails
    /// with [`SchedulerError::AlreadyStarted`].
    pub async fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::NotStarted {
                return Err(SchedulerError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Running;
        }

        let feed = match self.store.subscribe_desired(&self.stack).await {
            Ok(feed) => feed,
            Err(e) => {
                *self.lifecycle.lock().unwrap() = Lifecycle::NotStarted;
                return Err(SchedulerError::Subscribe(e));
            }
        };

        info!(stack = %self.stack, "Desired-workload intake started");

        let orchestrator = Arc::clone(&self.orchestrator);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(run_intake_loop(orchestrator, feed, shutdown));

        Ok(())
    }

    /// Halt intake of new events.
    ///
    /// Non-blocking; in-flight placement runs are not cancelled. Valid
    /// exactly once, after `start`.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle != Lifecycle::Running {
            return Err(SchedulerError::NotRunning);
        }
        *lifecycle = Lifecycle::Stopped;

        let _ = self.shutdown_tx.send(true);
        info!(stack = %self.stack, "Desired-workload intake stopping");
        Ok(())
    }

    /// Whether the intake loop is accepting events.
    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock().unwrap() == Lifecycle::Running
    }
}

/// Consume the feed until shutdown, spawning one placement run per event.
async fn run_intake_loop(
    orchestrator: Arc<PlacementOrchestrator>,
    mut feed: mpsc::Receiver<DesiredWorkload>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Intake loop shutting down");
                    break;
                }
            }
            event = feed.recv() => {
                match event {
                    Some(workload) => {
                        let orchestrator = Arc::clone(&orchestrator);
                        tokio::spawn(async move {
                            let guid = workload.guid.clone();
                            report_outcome(&guid, orchestrator.place(workload).await);
                        });
                    }
                    None => {
                        info!("Desired-workload feed closed");
                        break;
                    }
                }
            }
        }
    }
}

fn report_outcome(guid: &str, result: Result<PlacementOutcome, PlacementError>) {
    match result {
        Ok(PlacementOutcome::Filtered) => {
            debug!(guid = %guid, "Desired workload filtered out")
        }
        Ok(PlacementOutcome::Running {
            allocation_guid, ..
        }) => {
            info!(guid = %guid, allocation_guid = %allocation_guid, "Workload placed")
        }
        Err(e) if e.left_residue() => {
            error!(guid = %guid, error = %e, "Placement compensation failed, manual cleanup required")
        }
        Err(e) => {
            warn!(guid = %guid, error = %e, "Placement failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use loft_models::LogConfig;

    use super::*;
    use crate::fakes::{FakeExecutor, FakeStore};

    fn test_config() -> Config {
        Config {
            cell_id: "cell-test".to_string(),
            stack: "correct-stack".to_string(),
            store_url: "http://localhost:8500".to_string(),
            executor_url: "http://localhost:1700".to_string(),
            log_level: "debug".to_string(),
        }
    }

    fn test_workload(guid: &str) -> DesiredWorkload {
        DesiredWorkload {
            guid: guid.to_string(),
            stack: "correct-stack".to_string(),
            memory_mb: 128,
            disk_mb: 1024,
            actions: vec![],
            log: LogConfig {
                guid: guid.to_string(),
                source_name: "APP".to_string(),
                index: Some(0),
            },
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let store = Arc::new(FakeStore::new());
        let executor = Arc::new(FakeExecutor::new());
        let scheduler = Scheduler::new(&test_config(), store, executor);

        scheduler.start().await.unwrap();
        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn stop_before_start_is_an_error() {
        let store = Arc::new(FakeStore::new());
        let executor = Arc::new(FakeExecutor::new());
        let scheduler = Scheduler::new(&test_config(), store, executor);

        assert!(matches!(
            scheduler.stop().unwrap_err(),
            SchedulerError::NotRunning
        ));
    }

    #[tokio::test]
    async fn stop_twice_is_an_error() {
        let store = Arc::new(FakeStore::new());
        let executor = Arc::new(FakeExecutor::new());
        let scheduler = Scheduler::new(&test_config(), store, executor);

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());

        scheduler.stop().unwrap();
        assert!(!scheduler.is_running());
        assert!(matches!(
            scheduler.stop().unwrap_err(),
            SchedulerError::NotRunning
        ));
    }

    #[tokio::test]
    async fn events_dispatch_placement_runs() {
        let store = Arc::new(FakeStore::new());
        let executor = Arc::new(FakeExecutor::new());
        let scheduler =
            Scheduler::new(&test_config(), Arc::clone(&store) as _, Arc::clone(&executor) as _);

        scheduler.start().await.unwrap();
        store.emit_desired(test_workload("lrp-1")).await;
        store.emit_desired(test_workload("lrp-2")).await;

        let store_check = Arc::clone(&store);
        wait_until(move || store_check.started_workloads().len() == 2).await;
        assert_eq!(executor.live_allocations().len(), 2);
    }

    #[tokio::test]
    async fn no_intake_after_stop() {
        let store = Arc::new(FakeStore::new());
        let executor = Arc::new(FakeExecutor::new());
        let scheduler =
            Scheduler::new(&test_config(), Arc::clone(&store) as _, Arc::clone(&executor) as _);

        scheduler.start().await.unwrap();
        scheduler.stop().unwrap();

        // Give the intake loop a moment to observe shutdown.
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.emit_desired(test_workload("lrp-late")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.call_log().is_empty());
        assert!(store.started_workloads().is_empty());
    }
}
