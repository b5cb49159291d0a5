//! Repository Module
//!
//! Store interfaces the lifecycle coordinator is written against, plus an
//! in-memory and a PostgreSQL implementation of all three.

mod context;
mod execution;
mod instance;
pub mod memory;
pub mod postgres;

pub use context::ContextStore;
pub use execution::{ExecutionStore, PersistedState};
pub use instance::InstanceStore;
pub use memory::MemoryStore;
pub use postgres::PgStore;
