//! Execution store
//!
//! Persistence of job executions and their step executions.

use async_trait::async_trait;
use keel_core::{BatchStatus, JobExecution, JobInstance, StepExecution};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Status and version of a job execution as currently persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedState {
    pub status: BatchStatus,
    pub version: i32,
}

/// Store trait for job and step executions
///
/// Contract:
/// - At most one running execution (non-terminal status, no end time) may
///   exist per instance. `save_execution` and `update_execution` enforce it
///   and fail with [`StoreError::DuplicateRunning`]. This is what keeps two
///   coordinators from launching the same instance concurrently.
///   Executions saved with `save_parallel_execution` are exempt: they
///   neither count against the rule nor are checked by it.
/// - Updates are compare-and-write on `version` and fail with
///   [`StoreError::Conflict`] when the stored version differs. On success
///   the in-memory version is incremented.
/// - Executions are returned without contexts or step executions; callers
///   load those explicitly.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// All executions of an instance, most recent first
    async fn find_executions(&self, instance: &JobInstance) -> StoreResult<Vec<JobExecution>>;

    /// The most recently created execution of an instance
    async fn find_last_execution(&self, instance: &JobInstance)
    -> StoreResult<Option<JobExecution>>;

    /// Finds an execution by ID
    async fn find_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>>;

    /// Persists a new execution, assigning its ID and initial version
    async fn save_execution(&self, execution: &mut JobExecution) -> StoreResult<()>;

    /// Persists a new execution outside the one-running-execution rule
    async fn save_parallel_execution(&self, execution: &mut JobExecution) -> StoreResult<()>;

    /// Writes an execution back if its version is still current
    async fn update_execution(&self, execution: &mut JobExecution) -> StoreResult<()>;

    /// Reads the persisted status and version of an execution
    async fn current_state(&self, execution_id: Uuid) -> StoreResult<Option<PersistedState>>;

    /// Refreshes `execution` from storage in place
    ///
    /// When the persisted version differs, the persisted status is merged in
    /// with [`BatchStatus::upgrade_to`] and the persisted version adopted.
    async fn synchronize_status(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let id = execution
            .id
            .ok_or_else(|| StoreError::NotFound("unsaved job execution".to_string()))?;

        let state = self
            .current_state(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job execution {}", id)))?;

        if state.version != execution.version {
            execution.upgrade_status(state.status);
            execution.version = state.version;
        }

        Ok(())
    }

    /// Persists a new step execution, assigning its ID and initial version
    async fn save_step_execution(&self, step: &mut StepExecution) -> StoreResult<()>;

    /// Persists a batch of new step executions
    async fn save_step_executions(&self, steps: &mut [StepExecution]) -> StoreResult<()> {
        for step in steps.iter_mut() {
            self.save_step_execution(step).await?;
        }
        Ok(())
    }

    /// Writes a step execution back if its version is still current
    async fn update_step_execution(&self, step: &mut StepExecution) -> StoreResult<()>;

    /// Replaces `execution.step_executions` with the persisted steps, in registration order
    async fn load_step_executions_into(&self, execution: &mut JobExecution) -> StoreResult<()>;
}
