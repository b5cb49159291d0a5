//! Step execution domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::context::{ContextOwner, ExecutionContext};
use crate::domain::status::BatchStatus;

/// One step's run within a job execution
///
/// The owning job execution is referenced by id only. Look it up through the
/// execution store when its state is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Option<Uuid>,
    pub version: i32,
    pub step_name: String,
    pub job_execution_id: Option<Uuid>,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_context: ExecutionContext,
    /// Set when the owning job is stopping; the step runner halts at its next checkpoint
    #[serde(default)]
    pub terminate_only: bool,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: Option<Uuid>) -> Self {
        Self {
            id: None,
            version: 0,
            step_name: step_name.into(),
            job_execution_id,
            status: BatchStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            terminate_only: false,
        }
    }

    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    pub fn context_owner(&self) -> Option<ContextOwner> {
        self.id.map(ContextOwner::Step)
    }
}
