//! loft Cell Agent Library
//!
//! The cell agent runs on each execution host ("cell") and places desired
//! workloads onto that host. It subscribes to the distributed store's
//! desired-workload feed and, for each workload addressed to this cell's
//! stack, drives a provisioning saga against the execution backend:
//!
//! ```text
//! Scheduler (intake loop, one placement task per event)
//! └── PlacementOrchestrator
//!     ├── reserve      (ExecutorClient::allocate)
//!     ├── claim        (StoreGateway::claim_started)
//!     ├── initialize   (ExecutorClient::initialize)
//!     └── run          (ExecutorClient::run)
//! ```
//!
//! The store and the execution backend cannot be updated transactionally,
//! so each step compensates backward on failure; see `orchestrator` for the
//! exact discipline.
//!
//! ## Modules
//!
//! - `scheduler`: feed intake and per-event dispatch
//! - `orchestrator`: the per-workload saga and its compensation
//! - `store` / `executor`: the two collaborator interfaces and HTTP clients
//! - `fakes`: in-memory collaborators for tests and development

pub mod config;
pub mod executor;
pub mod fakes;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use executor::{ExecutorClient, HttpExecutorClient};
pub use orchestrator::{PlacementError, PlacementOrchestrator, PlacementOutcome};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::{HttpStoreGateway, StoreGateway};
