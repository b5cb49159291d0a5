//! Keel Core
//!
//! Core types for the Keel batch job lifecycle coordinator.
//!
//! This crate contains:
//! - Domain types: job parameters, instances, executions, step executions
//! - Identity: the stable key derived from a job's identifying parameters
//! - Execution contexts: resumable key-value state attached to executions

pub mod domain;

pub use domain::context::{ContextOwner, ExecutionContext};
pub use domain::execution::JobExecution;
pub use domain::instance::JobInstance;
pub use domain::parameters::{JobKey, JobParameter, JobParameters, ParameterError, ParameterValue};
pub use domain::status::BatchStatus;
pub use domain::step::StepExecution;
