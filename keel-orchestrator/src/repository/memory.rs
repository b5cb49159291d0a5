//! In-memory store
//!
//! A single mutex-guarded state implementing all three store traits with the
//! same uniqueness and versioning rules as the PostgreSQL store. Suitable for
//! embedding and for tests.

use async_trait::async_trait;
use keel_core::{
    ContextOwner, ExecutionContext, JobExecution, JobInstance, JobKey, JobParameters,
    StepExecution,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::repository::{ContextStore, ExecutionStore, InstanceStore, PersistedState};

#[derive(Default)]
struct MemoryState {
    instances: HashMap<Uuid, JobInstance>,
    identities: HashMap<(String, JobKey), Uuid>,
    /// Insertion order doubles as recency order
    executions: Vec<JobExecution>,
    /// Executions exempt from the one-running rule
    parallel: HashSet<Uuid>,
    steps: Vec<StepExecution>,
    contexts: HashMap<ContextOwner, ExecutionContext>,
}

impl MemoryState {
    fn execution_index(&self, id: Uuid) -> Option<usize> {
        self.executions.iter().position(|e| e.id == Some(id))
    }

    fn has_other_running(&self, instance_id: Uuid, except: Option<Uuid>) -> bool {
        self.executions.iter().any(|e| {
            e.instance.id == Some(instance_id)
                && e.id != except
                && e.is_running()
                && !e.id.is_some_and(|id| self.parallel.contains(&id))
        })
    }

    fn insert_execution(&mut self, execution: &mut JobExecution) -> Uuid {
        let id = Uuid::new_v4();
        execution.id = Some(id);
        execution.version = 0;
        self.executions.push(detached_execution(execution));
        id
    }
}

/// In-memory implementation of the instance, execution and context stores
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Strips what the store does not keep inline with the record
fn detached_execution(execution: &JobExecution) -> JobExecution {
    let mut stored = execution.clone();
    stored.execution_context = ExecutionContext::new();
    stored.step_executions = Vec::new();
    stored
}

fn detached_step(step: &StepExecution) -> StepExecution {
    let mut stored = step.clone();
    stored.execution_context = ExecutionContext::new();
    stored.terminate_only = false;
    stored
}

fn stored_context(context: &ExecutionContext) -> ExecutionContext {
    let mut stored = context.clone();
    stored.clear_dirty();
    stored
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<Option<JobInstance>> {
        let key = parameters.job_key()?;
        let state = self.state()?;

        Ok(state
            .identities
            .get(&(job_name.to_string(), key))
            .and_then(|id| state.instances.get(id))
            .cloned())
    }

    async fn find_instance_by_id(&self, id: Uuid) -> StoreResult<Option<JobInstance>> {
        Ok(self.state()?.instances.get(&id).cloned())
    }

    async fn create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<JobInstance> {
        let id = Uuid::new_v4();
        let instance = JobInstance::new(job_name, parameters)?.with_id(id);
        let identity = (instance.job_name.clone(), instance.job_key.clone());

        let mut state = self.state()?;
        if state.identities.contains_key(&identity) {
            return Err(StoreError::DuplicateInstance {
                job_name: identity.0,
                job_key: identity.1.to_string(),
            });
        }

        state.identities.insert(identity, id);
        state.instances.insert(id, instance.clone());
        debug!("Stored job instance {} for job '{}'", id, job_name);

        Ok(instance)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn find_executions(&self, instance: &JobInstance) -> StoreResult<Vec<JobExecution>> {
        let state = self.state()?;

        Ok(state
            .executions
            .iter()
            .rev()
            .filter(|e| instance.id.is_some() && e.instance.id == instance.id)
            .cloned()
            .collect())
    }

    async fn find_last_execution(
        &self,
        instance: &JobInstance,
    ) -> StoreResult<Option<JobExecution>> {
        Ok(self.find_executions(instance).await?.into_iter().next())
    }

    async fn find_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>> {
        let state = self.state()?;
        Ok(state.execution_index(id).map(|idx| state.executions[idx].clone()))
    }

    async fn save_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let instance_id = execution
            .instance_id()
            .ok_or_else(|| StoreError::NotFound("unsaved job instance".to_string()))?;

        let mut state = self.state()?;
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::NotFound(format!("job instance {}", instance_id)));
        }
        if execution.is_running() && state.has_other_running(instance_id, None) {
            return Err(StoreError::DuplicateRunning { instance_id });
        }

        state.insert_execution(execution);
        Ok(())
    }

    async fn save_parallel_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let instance_id = execution
            .instance_id()
            .ok_or_else(|| StoreError::NotFound("unsaved job instance".to_string()))?;

        let mut state = self.state()?;
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::NotFound(format!("job instance {}", instance_id)));
        }

        let id = state.insert_execution(execution);
        state.parallel.insert(id);
        debug!("Stored parallel job execution {} for instance {}", id, instance_id);

        Ok(())
    }

    async fn update_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let id = execution
            .id
            .ok_or_else(|| StoreError::NotFound("unsaved job execution".to_string()))?;

        let mut state = self.state()?;
        let idx = state
            .execution_index(id)
            .ok_or_else(|| StoreError::NotFound(format!("job execution {}", id)))?;

        if state.executions[idx].version != execution.version {
            return Err(StoreError::Conflict {
                entity: "job execution",
                id,
                expected: execution.version,
            });
        }

        if let Some(instance_id) = execution.instance_id() {
            if execution.is_running()
                && !state.parallel.contains(&id)
                && state.has_other_running(instance_id, Some(id))
            {
                return Err(StoreError::DuplicateRunning { instance_id });
            }
        }

        execution.version += 1;
        state.executions[idx] = detached_execution(execution);

        Ok(())
    }

    async fn current_state(&self, execution_id: Uuid) -> StoreResult<Option<PersistedState>> {
        let state = self.state()?;

        Ok(state.execution_index(execution_id).map(|idx| {
            let stored = &state.executions[idx];
            PersistedState {
                status: stored.status,
                version: stored.version,
            }
        }))
    }

    async fn save_step_execution(&self, step: &mut StepExecution) -> StoreResult<()> {
        let job_execution_id = step
            .job_execution_id
            .ok_or_else(|| StoreError::NotFound("unsaved job execution".to_string()))?;

        let mut state = self.state()?;
        if state.execution_index(job_execution_id).is_none() {
            return Err(StoreError::NotFound(format!(
                "job execution {}",
                job_execution_id
            )));
        }

        step.id = Some(Uuid::new_v4());
        step.version = 0;
        state.steps.push(detached_step(step));

        Ok(())
    }

    async fn update_step_execution(&self, step: &mut StepExecution) -> StoreResult<()> {
        let id = step
            .id
            .ok_or_else(|| StoreError::NotFound("unsaved step execution".to_string()))?;

        let mut state = self.state()?;
        let stored = state
            .steps
            .iter_mut()
            .find(|s| s.id == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("step execution {}", id)))?;

        if stored.version != step.version {
            return Err(StoreError::Conflict {
                entity: "step execution",
                id,
                expected: step.version,
            });
        }

        step.version += 1;
        *stored = detached_step(step);

        Ok(())
    }

    async fn load_step_executions_into(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let state = self.state()?;

        execution.step_executions = match execution.id {
            Some(id) => state
                .steps
                .iter()
                .filter(|s| s.job_execution_id == Some(id))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        Ok(())
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn get_context(&self, owner: ContextOwner) -> StoreResult<ExecutionContext> {
        Ok(self
            .state()?
            .contexts
            .get(&owner)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> StoreResult<()> {
        self.state()?
            .contexts
            .insert(owner, stored_context(context));
        Ok(())
    }

    async fn update_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> StoreResult<()> {
        self.save_context(owner, context).await
    }

    async fn save_contexts(&self, contexts: &[(ContextOwner, &ExecutionContext)]) -> StoreResult<()> {
        let mut state = self.state()?;
        for (owner, context) in contexts {
            state.contexts.insert(*owner, stored_context(context));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::BatchStatus;

    fn params() -> JobParameters {
        JobParameters::builder().add("date", "2024-01-01").build()
    }

    async fn saved_execution(store: &MemoryStore) -> JobExecution {
        let instance = store.create_instance("nightly-import", &params()).await.unwrap();
        let mut execution = JobExecution::new(instance, params(), None);
        store.save_execution(&mut execution).await.unwrap();
        execution
    }

    #[tokio::test]
    async fn test_create_instance_is_create_if_absent() {
        let store = MemoryStore::new();
        let first = store.create_instance("nightly-import", &params()).await.unwrap();
        assert!(first.id.is_some());

        let err = store
            .create_instance("nightly-import", &params())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateInstance { .. }));

        // Same parameters under another job name is a different identity
        assert!(store.create_instance("weekly-report", &params()).await.is_ok());

        let found = store
            .find_instance("nightly-import", &params())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, first);
    }

    #[tokio::test]
    async fn test_parallel_execution_is_exempt_from_running_rule() {
        let store = MemoryStore::new();
        let first = saved_execution(&store).await;

        let mut parallel = JobExecution::new(first.instance.clone(), params(), None);
        store.save_parallel_execution(&mut parallel).await.unwrap();
        assert!(parallel.id.is_some());
        assert_eq!(parallel.version, 0);

        parallel.status = BatchStatus::Started;
        store.update_execution(&mut parallel).await.unwrap();
        assert_eq!(parallel.version, 1);

        // The launched execution still blocks other launched ones
        let mut second = JobExecution::new(first.instance.clone(), params(), None);
        let err = store.save_execution(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRunning { .. }));

        let mut unsaved = JobExecution::new(
            JobInstance::new("nightly-import", &params()).unwrap(),
            params(),
            None,
        );
        let err = store.save_parallel_execution(&mut unsaved).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_only_one_running_execution_per_instance() {
        let store = MemoryStore::new();
        let first = saved_execution(&store).await;

        let mut second = JobExecution::new(first.instance.clone(), params(), None);
        let err = store.save_execution(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRunning { .. }));
        assert!(second.id.is_none());

        let mut finished = first.clone();
        finished.status = BatchStatus::Failed;
        finished.end_time = Some(chrono::Utc::now());
        store.update_execution(&mut finished).await.unwrap();

        store.save_execution(&mut second).await.unwrap();
        let all = store.find_executions(&first.instance).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_write() {
        let store = MemoryStore::new();
        let mut execution = saved_execution(&store).await;
        let mut stale = execution.clone();

        execution.status = BatchStatus::Started;
        store.update_execution(&mut execution).await.unwrap();
        assert_eq!(execution.version, 1);

        stale.status = BatchStatus::Failed;
        let err = store.update_execution(&mut stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, .. }));
    }

    #[tokio::test]
    async fn test_synchronize_status_adopts_persisted_stop() {
        let store = MemoryStore::new();
        let mut execution = saved_execution(&store).await;
        execution.status = BatchStatus::Started;
        store.update_execution(&mut execution).await.unwrap();

        let mut observer = store
            .find_execution(execution.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        observer.status = BatchStatus::Stopping;
        store.update_execution(&mut observer).await.unwrap();

        store.synchronize_status(&mut execution).await.unwrap();
        assert_eq!(execution.status, BatchStatus::Stopping);
        assert_eq!(execution.version, observer.version);
    }

    #[tokio::test]
    async fn test_step_executions_load_in_registration_order() {
        let store = MemoryStore::new();
        let mut execution = saved_execution(&store).await;

        let mut steps = vec![
            StepExecution::new("extract", execution.id),
            StepExecution::new("load", execution.id),
        ];
        store.save_step_executions(&mut steps).await.unwrap();
        assert!(steps.iter().all(|s| s.id.is_some()));

        store.load_step_executions_into(&mut execution).await.unwrap();
        let names: Vec<_> = execution
            .step_executions
            .iter()
            .map(|s| s.step_name.as_str())
            .collect();
        assert_eq!(names, vec!["extract", "load"]);
    }

    #[tokio::test]
    async fn test_step_requires_persisted_job_execution() {
        let store = MemoryStore::new();
        let mut orphan = StepExecution::new("extract", Some(Uuid::new_v4()));
        let err = store.save_step_execution(&mut orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_context_round_trip() {
        let store = MemoryStore::new();
        let owner = ContextOwner::Job(Uuid::new_v4());
        assert!(store.get_context(owner).await.unwrap().is_empty());

        let mut ctx = ExecutionContext::new();
        ctx.put("offset", 10).unwrap();
        store.save_context(owner, &ctx).await.unwrap();

        let loaded = store.get_context(owner).await.unwrap();
        assert_eq!(loaded, ctx);
        assert!(!loaded.is_dirty());
    }
}
