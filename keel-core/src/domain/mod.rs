//! Core domain types
//!
//! This module contains the structures shared between the coordinator (which
//! decides what may run) and the stores (which persist it). Execution logic
//! for steps lives outside this workspace.

pub mod context;
pub mod execution;
pub mod instance;
pub mod parameters;
pub mod status;
pub mod step;
