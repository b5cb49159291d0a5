//! Error Types
//!
//! Store errors are opaque to the coordinator and propagate unchanged inside
//! [`LifecycleError::Store`]. The remaining lifecycle variants are the
//! coordinator's own rejections.

use keel_core::{JobParameters, ParameterError};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors raised by instance, execution and context stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Referenced record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Compare-and-write failed because the stored version moved on
    #[error("Concurrent modification of {entity} {id}: expected version {expected}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        expected: i32,
    },

    /// An instance with the same name and identity key already exists
    #[error("Job instance already exists for job '{job_name}' and key {job_key}")]
    DuplicateInstance { job_name: String, job_key: String },

    /// The instance already has a non-terminal execution
    #[error("Job instance {instance_id} already has a running execution")]
    DuplicateRunning { instance_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job parameters: {0}")]
    Parameters(#[from] ParameterError),

    /// In-memory state was poisoned by a panicking writer
    #[error("Store state poisoned")]
    Poisoned,
}

/// Errors raised by the lifecycle coordinator
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Caller supplied an invalid or incomplete argument
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(
        "A job execution for job '{job_name}' is already running (instance {instance_id}, parameters {parameters})"
    )]
    AlreadyRunning {
        job_name: String,
        instance_id: Uuid,
        parameters: JobParameters,
    },

    #[error(
        "A job instance already exists and is complete for job '{job_name}' (instance {instance_id}, parameters {parameters}). If you want to run this job again, change the parameters."
    )]
    AlreadyComplete {
        job_name: String,
        instance_id: Uuid,
        parameters: JobParameters,
    },

    #[error("Cannot restart job: {0}")]
    Restart(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for the business-rule rejections of a launch attempt
    pub fn is_launch_rejection(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. } | Self::AlreadyComplete { .. } | Self::Restart(_)
        )
    }
}

impl From<ParameterError> for LifecycleError {
    fn from(err: ParameterError) -> Self {
        LifecycleError::Validation(err.to_string())
    }
}
