//! Job instance domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::parameters::{JobKey, JobParameters, ParameterError};

/// One logical, repeatable run-identity of a job
///
/// Keyed by `(job_name, job_key)`. Holds only the identifying parameters;
/// the full set used by each attempt lives on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: Option<Uuid>,
    pub job_name: String,
    pub job_key: JobKey,
    pub parameters: JobParameters,
}

impl JobInstance {
    /// Creates an unsaved instance from a full parameter set
    pub fn new(job_name: impl Into<String>, parameters: &JobParameters) -> Result<Self, ParameterError> {
        Ok(Self {
            id: None,
            job_name: job_name.into(),
            job_key: parameters.job_key()?,
            parameters: parameters.identifying(),
        })
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

impl fmt::Display for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "JobInstance(id={}, job={})", id, self.job_name),
            None => write!(f, "JobInstance(unsaved, job={})", self.job_name),
        }
    }
}
