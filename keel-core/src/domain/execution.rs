//! Job execution domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::context::{ContextOwner, ExecutionContext};
use crate::domain::instance::JobInstance;
use crate::domain::parameters::JobParameters;
use crate::domain::status::BatchStatus;
use crate::domain::step::StepExecution;

/// One attempt to run a job instance
///
/// Created by the coordinator and mutated afterwards by the step runner.
/// `id` and `version` are assigned by the execution store on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: Option<Uuid>,
    pub version: i32,
    pub instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub configuration_location: Option<String>,
    #[serde(default)]
    pub execution_context: ExecutionContext,
    /// Populated on demand by the execution store
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn new(
        instance: JobInstance,
        parameters: JobParameters,
        configuration_location: Option<String>,
    ) -> Self {
        Self {
            id: None,
            version: 0,
            instance,
            parameters,
            status: BatchStatus::Starting,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            configuration_location,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance.id
    }

    /// Not in a terminal status and not yet ended
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal() && self.end_time.is_none()
    }

    /// Merges a status observed in storage into this execution
    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn context_owner(&self) -> Option<ContextOwner> {
        self.id.map(ContextOwner::Job)
    }

    /// Creates a new step execution bound to this execution
    ///
    /// The step is not added to `step_executions`; that list is only filled
    /// from the execution store.
    pub fn create_step_execution(&self, step_name: impl Into<String>) -> StepExecution {
        StepExecution::new(step_name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> JobExecution {
        let instance = JobInstance::new("nightly-import", &JobParameters::new())
            .unwrap()
            .with_id(Uuid::new_v4());
        JobExecution::new(instance, JobParameters::new(), None)
    }

    #[test]
    fn test_new_execution_is_starting() {
        let exec = execution();
        assert_eq!(exec.status, BatchStatus::Starting);
        assert!(exec.id.is_none());
        assert!(exec.context_owner().is_none());
        assert!(exec.execution_context.is_empty());
        assert!(exec.is_running());
    }

    #[test]
    fn test_running_requires_no_end_time() {
        let mut exec = execution();
        exec.status = BatchStatus::Started;
        assert!(exec.is_running());

        exec.end_time = Some(Utc::now());
        assert!(!exec.is_running());

        exec.end_time = None;
        exec.status = BatchStatus::Failed;
        assert!(!exec.is_running());
    }

    #[test]
    fn test_created_step_is_bound_but_not_tracked() {
        let mut exec = execution();
        exec.id = Some(Uuid::new_v4());

        let step = exec.create_step_execution("load");
        assert_eq!(step.job_execution_id, exec.id);
        assert_eq!(step.status, BatchStatus::Starting);
        assert!(step.id.is_none());
        assert!(exec.step_executions.is_empty());
    }
}
