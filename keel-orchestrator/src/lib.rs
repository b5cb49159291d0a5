//! Keel Orchestrator
//!
//! Job launch and execution bookkeeping: decides whether a job instance may
//! run again, records its executions and steps, and propagates stop requests.

pub mod config;
pub mod db;
pub mod error;
pub mod repository;
pub mod service;

pub use config::Config;
pub use error::{LifecycleError, StoreError};
pub use repository::{ContextStore, ExecutionStore, InstanceStore, MemoryStore, PgStore};
pub use service::{LatestStep, LifecycleCoordinator};
