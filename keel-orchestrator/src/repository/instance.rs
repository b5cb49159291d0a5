//! Instance store
//!
//! Persistence of job instances keyed by `(job_name, job_key)`.

use async_trait::async_trait;
use keel_core::{JobInstance, JobParameters};
use uuid::Uuid;

use crate::error::StoreResult;

/// Store trait for job instances
///
/// Implementations own the uniqueness of `(job_name, job_key)`:
/// `create_instance` must be an atomic create-if-absent and fail with
/// [`StoreError::DuplicateInstance`](crate::error::StoreError::DuplicateInstance)
/// when another caller created the same identity first.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Finds the instance whose identity matches the identifying subset of `parameters`
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<Option<JobInstance>>;

    /// Finds an instance by ID
    async fn find_instance_by_id(&self, id: Uuid) -> StoreResult<Option<JobInstance>>;

    /// Creates and persists a new instance, assigning its ID
    async fn create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<JobInstance>;
}
