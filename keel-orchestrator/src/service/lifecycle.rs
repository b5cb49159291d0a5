//! Lifecycle Service
//!
//! Decides whether a job may be launched, records executions and steps, and
//! carries stop requests from a job down to its running steps.
//!
//! The coordinator holds no mutable state of its own. Every call re-reads the
//! stores, and mutual exclusion between concurrent launchers is left to the
//! execution store's one-running-execution-per-instance contract.

use chrono::Utc;
use keel_core::{
    BatchStatus, ContextOwner, ExecutionContext, JobExecution, JobInstance, JobParameters,
    StepExecution,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result, StoreError};
use crate::repository::{ContextStore, ExecutionStore, InstanceStore};

/// Most recent run of a named step, with the job execution it belongs to
///
/// Both execution contexts are loaded.
#[derive(Debug, Clone)]
pub struct LatestStep {
    pub step_execution: StepExecution,
    pub job_execution: JobExecution,
}

/// Coordinates the lifecycle of job instances, executions and steps
#[derive(Clone)]
pub struct LifecycleCoordinator {
    instances: Arc<dyn InstanceStore>,
    executions: Arc<dyn ExecutionStore>,
    contexts: Arc<dyn ContextStore>,
}

impl LifecycleCoordinator {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        executions: Arc<dyn ExecutionStore>,
        contexts: Arc<dyn ContextStore>,
    ) -> Self {
        Self {
            instances,
            executions,
            contexts,
        }
    }

    /// Builds a coordinator over a single store implementing all three traits
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: InstanceStore + ExecutionStore + ContextStore + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    /// True if an instance exists for `job_name` and the identifying subset of `parameters`
    pub async fn instance_exists(&self, job_name: &str, parameters: &JobParameters) -> Result<bool> {
        parameters.validate()?;
        Ok(self
            .instances
            .find_instance(job_name, parameters)
            .await?
            .is_some())
    }

    pub async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>> {
        parameters.validate()?;
        Ok(self.instances.find_instance(job_name, parameters).await?)
    }

    /// Creates an instance without checking for an existing one
    ///
    /// The instance store rejects duplicates itself.
    pub async fn create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance> {
        validate_job_name(job_name, "A job name is required to create a JobInstance")?;
        parameters.validate()?;

        let instance = self.instances.create_instance(job_name, parameters).await?;
        info!("Created {} with parameters {}", instance, parameters.identifying());

        Ok(instance)
    }

    // =========================================================================
    // Launching
    // =========================================================================

    /// Creates a new execution, creating the instance first if needed
    ///
    /// Fails with `AlreadyRunning` if any execution of the instance is still
    /// running, and with `AlreadyComplete` if one completed or was abandoned
    /// and the parameters have identifying entries. Otherwise the context of
    /// the instance's last execution is carried over.
    pub async fn create_execution(
        &self,
        job_name: &str,
        parameters: JobParameters,
    ) -> Result<JobExecution> {
        validate_job_name(job_name, "Job name must not be empty")?;
        parameters.validate()?;

        self.try_launch(job_name, parameters)
            .await
            .inspect_err(|err| log_rejection(job_name, err))
    }

    async fn try_launch(&self, job_name: &str, parameters: JobParameters) -> Result<JobExecution> {
        let (instance, context) = match self.instances.find_instance(job_name, &parameters).await? {
            Some(instance) => {
                let context = self.check_relaunch(&instance, &parameters).await?;
                (instance, context)
            }
            None => match self.instances.create_instance(job_name, &parameters).await {
                Ok(instance) => {
                    info!("Created {} with parameters {}", instance, parameters.identifying());
                    (instance, ExecutionContext::new())
                }
                Err(StoreError::DuplicateInstance { .. }) => {
                    warn!(
                        "Another launcher created the instance of job '{}' first, re-checking it",
                        job_name
                    );
                    let instance = self
                        .instances
                        .find_instance(job_name, &parameters)
                        .await?
                        .ok_or_else(|| {
                            StoreError::NotFound(format!("job instance of '{}'", job_name))
                        })?;
                    let context = self.check_relaunch(&instance, &parameters).await?;
                    (instance, context)
                }
                Err(err) => return Err(err.into()),
            },
        };

        self.launch(instance, parameters, context).await
    }

    /// Creates a new execution that resumes a FAILED or STOPPED one
    ///
    /// Fails with `Restart` when there is nothing resumable: no instance, no
    /// prior execution, or a last execution that is neither FAILED nor STOPPED.
    pub async fn resume_execution(
        &self,
        job_name: &str,
        parameters: JobParameters,
    ) -> Result<JobExecution> {
        validate_job_name(job_name, "Job name must not be empty")?;
        parameters.validate()?;

        self.try_resume(job_name, parameters)
            .await
            .inspect_err(|err| log_rejection(job_name, err))
    }

    async fn try_resume(&self, job_name: &str, parameters: JobParameters) -> Result<JobExecution> {
        let instance = self
            .instances
            .find_instance(job_name, &parameters)
            .await?
            .ok_or_else(|| {
                LifecycleError::Restart(format!(
                    "no instance of job '{}' exists for parameters {}",
                    job_name, parameters
                ))
            })?;

        let last = self
            .executions
            .find_last_execution(&instance)
            .await?
            .ok_or_else(|| {
                LifecycleError::Restart(format!("{} has no execution to resume", instance))
            })?;

        if last.is_running() && last.status != BatchStatus::Unknown {
            return Err(already_running(&instance, &parameters));
        }

        match last.status {
            BatchStatus::Failed | BatchStatus::Stopped => {}
            BatchStatus::Unknown => {
                return Err(LifecycleError::Restart(format!(
                    "last execution of {} has status UNKNOWN, mark it ABANDONED before launching again",
                    instance
                )));
            }
            status => {
                return Err(LifecycleError::Restart(format!(
                    "last execution of {} is {}, only FAILED or STOPPED executions can be resumed",
                    instance, status
                )));
            }
        }

        let context = self.check_relaunch(&instance, &parameters).await?;
        self.launch(instance, parameters, context).await
    }

    /// Creates an execution for an existing instance without any launch checks
    ///
    /// The record is saved as a parallel execution, so it may sit next to a
    /// running one (a secondary configuration run, for instance) and never
    /// blocks or is blocked by the launch path's one-running rule.
    pub async fn create_execution_for_instance(
        &self,
        instance: &JobInstance,
        parameters: JobParameters,
        configuration_location: Option<String>,
    ) -> Result<JobExecution> {
        if instance.id.is_none() {
            return Err(LifecycleError::validation(
                "A saved JobInstance is required to associate the JobExecution with",
            ));
        }

        parameters.validate()?;

        let mut execution = JobExecution::new(instance.clone(), parameters, configuration_location);
        self.persist_new_execution(&mut execution, true).await?;

        Ok(execution)
    }

    /// Scans every prior execution of `instance` and returns the context to resume from
    async fn check_relaunch(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<ExecutionContext> {
        let executions = self.executions.find_executions(instance).await?;

        for execution in &executions {
            if execution.is_running() {
                debug!(
                    "Execution {:?} of {} is still {}",
                    execution.id, instance, execution.status
                );
                return Err(already_running(instance, parameters));
            }

            let finished = matches!(
                execution.status,
                BatchStatus::Completed | BatchStatus::Abandoned
            );
            if finished && parameters.has_identifying() {
                debug!(
                    "Execution {:?} of {} is {}",
                    execution.id, instance, execution.status
                );
                return Err(LifecycleError::AlreadyComplete {
                    job_name: instance.job_name.clone(),
                    instance_id: instance.id.unwrap_or_default(),
                    parameters: parameters.clone(),
                });
            }
        }

        let last = self.executions.find_last_execution(instance).await?;
        let context = match last.as_ref().and_then(JobExecution::context_owner) {
            Some(owner) => self.contexts.get_context(owner).await?,
            None => ExecutionContext::new(),
        };

        debug!(
            "{} may be launched, resuming context with {} entries",
            instance,
            context.len()
        );
        Ok(context)
    }

    async fn launch(
        &self,
        instance: JobInstance,
        parameters: JobParameters,
        context: ExecutionContext,
    ) -> Result<JobExecution> {
        let mut execution = JobExecution::new(instance, parameters, None);
        execution.execution_context = context;

        match self.persist_new_execution(&mut execution, false).await {
            Ok(()) => Ok(execution),
            Err(LifecycleError::Store(StoreError::DuplicateRunning { .. })) => {
                debug!(
                    "Another execution of {} started concurrently",
                    execution.instance
                );
                Err(already_running(&execution.instance, &execution.parameters))
            }
            Err(err) => Err(err),
        }
    }

    /// Stamps and saves a new execution, then its context
    ///
    /// The context is keyed by the execution ID, so the execution must be
    /// saved first. Parallel executions bypass the store's one-running rule.
    async fn persist_new_execution(&self, execution: &mut JobExecution, parallel: bool) -> Result<()> {
        execution.last_updated = Some(Utc::now());
        if parallel {
            self.executions.save_parallel_execution(execution).await?;
        } else {
            self.executions.save_execution(execution).await?;
        }

        let owner = execution.context_owner().ok_or_else(|| {
            StoreError::NotFound("job execution id after save".to_string())
        })?;
        self.contexts
            .save_context(owner, &execution.execution_context)
            .await?;
        execution.execution_context.clear_dirty();

        info!(
            "Created job execution {} for {}",
            owner.id(),
            execution.instance
        );
        Ok(())
    }

    // =========================================================================
    // Job execution updates
    // =========================================================================

    /// Persists a job execution after merging in its currently stored status
    pub async fn update_execution(&self, execution: &mut JobExecution) -> Result<()> {
        if execution.instance_id().is_none() {
            return Err(LifecycleError::validation(
                "JobExecution must have a job instance id set",
            ));
        }
        if execution.id.is_none() {
            return Err(LifecycleError::validation(
                "JobExecution must be already saved (have an id assigned)",
            ));
        }

        execution.last_updated = Some(Utc::now());
        self.synchronize_status(execution).await?;
        self.executions.update_execution(execution).await?;

        debug!(
            "Updated job execution {:?} to {} (version {})",
            execution.id, execution.status, execution.version
        );
        Ok(())
    }

    /// Refreshes `execution` from storage without writing anything
    ///
    /// A status written by another observer, such as a stop request, is
    /// merged into the in-memory execution and never overwritten by it.
    pub async fn synchronize_status(&self, execution: &mut JobExecution) -> Result<()> {
        if execution.id.is_none() {
            return Err(LifecycleError::validation(
                "JobExecution must be already saved (have an id assigned)",
            ));
        }

        let before = execution.status;
        self.executions.synchronize_status(execution).await?;

        if before != execution.status {
            info!(
                "Job execution {:?} status changed in storage: {} -> {}",
                execution.id, before, execution.status
            );
        }
        Ok(())
    }

    /// Persists the context of a saved job execution as-is
    pub async fn update_job_context(&self, execution: &JobExecution) -> Result<()> {
        let owner = execution.context_owner().ok_or_else(|| {
            LifecycleError::validation("JobExecution must be already saved (have an id assigned)")
        })?;

        self.contexts
            .update_context(owner, &execution.execution_context)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Step executions
    // =========================================================================

    /// Registers a new step execution and saves its context
    pub async fn add_step(&self, step: &mut StepExecution) -> Result<()> {
        validate_step(step)?;

        step.last_updated = Some(Utc::now());
        self.executions.save_step_execution(step).await?;

        let owner = step_owner(step)?;
        self.contexts
            .save_context(owner, &step.execution_context)
            .await?;

        debug!(
            "Registered step '{}' for job execution {:?}",
            step.step_name, step.job_execution_id
        );
        Ok(())
    }

    /// Registers several step executions
    ///
    /// Every step is validated before any is persisted. Persisting itself is a
    /// bulk append and not atomic across the batch.
    pub async fn add_steps(&self, steps: &mut [StepExecution]) -> Result<()> {
        for step in steps.iter() {
            validate_step(step)?;
        }
        if steps.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        for step in steps.iter_mut() {
            step.last_updated = Some(now);
        }
        self.executions.save_step_executions(steps).await?;

        let contexts = steps
            .iter()
            .map(|step| Ok((step_owner(step)?, &step.execution_context)))
            .collect::<Result<Vec<_>>>()?;
        self.contexts.save_contexts(&contexts).await?;

        debug!("Registered {} step executions", steps.len());
        Ok(())
    }

    /// Persists a step execution, then checks whether its job is stopping
    ///
    /// If the owning job execution's stored status is STOPPING the step is
    /// flagged `terminate_only`, regardless of what the caller's copy of the
    /// job execution says.
    pub async fn update_step(&self, step: &mut StepExecution) -> Result<()> {
        validate_step(step)?;
        if step.id.is_none() {
            return Err(LifecycleError::validation(
                "StepExecution must already be saved (have an id assigned)",
            ));
        }

        step.last_updated = Some(Utc::now());
        self.executions.update_step_execution(step).await?;
        self.check_for_interruption(step).await
    }

    /// Persists the context of a saved step execution as-is
    pub async fn update_step_context(&self, step: &StepExecution) -> Result<()> {
        validate_step(step)?;
        let owner = step.context_owner().ok_or_else(|| {
            LifecycleError::validation("StepExecution must already be saved (have an id assigned)")
        })?;

        self.contexts
            .update_context(owner, &step.execution_context)
            .await?;
        Ok(())
    }

    async fn check_for_interruption(&self, step: &mut StepExecution) -> Result<()> {
        let job_execution_id = step.job_execution_id.ok_or_else(|| {
            LifecycleError::validation("StepExecution must belong to persisted JobExecution")
        })?;

        let state = self
            .executions
            .current_state(job_execution_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job execution {}", job_execution_id)))?;

        if state.status == BatchStatus::Stopping {
            info!(
                "Parent job execution {} is stopping, passing terminate request to step '{}'",
                job_execution_id, step.step_name
            );
            step.set_terminate_only();
        }
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    /// The most recently started execution of `step_name` across every execution of `instance`
    ///
    /// On equal start times the first one found wins, scanning executions
    /// most recent first. Returns `None` when the step never ran.
    pub async fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<LatestStep>> {
        let mut executions = self.executions_with_steps(instance).await?;

        let mut latest: Option<(usize, &StepExecution)> = None;
        for (idx, execution) in executions.iter().enumerate() {
            for step in execution
                .step_executions
                .iter()
                .filter(|s| s.step_name == step_name)
            {
                if latest.is_none_or(|(_, current)| step.start_time > current.start_time) {
                    latest = Some((idx, step));
                }
            }
        }

        let Some((idx, step)) = latest else {
            debug!("Step '{}' has never run for {}", step_name, instance);
            return Ok(None);
        };
        let mut step_execution = step.clone();
        let mut job_execution = executions.swap_remove(idx);

        if let Some(owner) = step_execution.context_owner() {
            step_execution.execution_context = self.contexts.get_context(owner).await?;
        }
        if let Some(owner) = job_execution.context_owner() {
            job_execution.execution_context = self.contexts.get_context(owner).await?;
        }

        Ok(Some(LatestStep {
            step_execution,
            job_execution,
        }))
    }

    /// Number of executions of `step_name` across every execution of `instance`
    pub async fn step_execution_count(&self, instance: &JobInstance, step_name: &str) -> Result<usize> {
        let executions = self.executions_with_steps(instance).await?;

        Ok(executions
            .iter()
            .flat_map(|e| e.step_executions.iter())
            .filter(|s| s.step_name == step_name)
            .count())
    }

    /// The most recent execution of the matching instance, with context and steps loaded
    pub async fn last_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>> {
        parameters.validate()?;
        let Some(instance) = self.instances.find_instance(job_name, parameters).await? else {
            return Ok(None);
        };

        match self.executions.find_last_execution(&instance).await? {
            Some(execution) => Ok(Some(self.hydrate(execution).await?)),
            None => Ok(None),
        }
    }

    /// Finds an execution by ID, with context and steps loaded
    pub async fn find_execution(&self, id: Uuid) -> Result<Option<JobExecution>> {
        match self.executions.find_execution(id).await? {
            Some(execution) => Ok(Some(self.hydrate(execution).await?)),
            None => Ok(None),
        }
    }

    async fn executions_with_steps(&self, instance: &JobInstance) -> Result<Vec<JobExecution>> {
        let mut executions = self.executions.find_executions(instance).await?;
        for execution in executions.iter_mut() {
            self.executions.load_step_executions_into(execution).await?;
        }
        Ok(executions)
    }

    async fn hydrate(&self, mut execution: JobExecution) -> Result<JobExecution> {
        if let Some(owner) = execution.context_owner() {
            execution.execution_context = self.contexts.get_context(owner).await?;
        }
        self.executions
            .load_step_executions_into(&mut execution)
            .await?;
        Ok(execution)
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_job_name(job_name: &str, message: &str) -> Result<()> {
    if job_name.trim().is_empty() {
        return Err(LifecycleError::validation(message));
    }
    Ok(())
}

fn validate_step(step: &StepExecution) -> Result<()> {
    if step.step_name.trim().is_empty() {
        return Err(LifecycleError::validation(
            "StepExecution's step name cannot be empty",
        ));
    }
    if step.job_execution_id.is_none() {
        return Err(LifecycleError::validation(
            "StepExecution must belong to persisted JobExecution",
        ));
    }
    Ok(())
}

fn step_owner(step: &StepExecution) -> Result<ContextOwner> {
    step.context_owner().ok_or_else(|| {
        StoreError::NotFound(format!("step execution id of '{}' after save", step.step_name)).into()
    })
}

fn log_rejection(job_name: &str, err: &LifecycleError) {
    if err.is_launch_rejection() {
        warn!("Launch of job '{}' rejected: {}", job_name, err);
    }
}

fn already_running(instance: &JobInstance, parameters: &JobParameters) -> LifecycleError {
    LifecycleError::AlreadyRunning {
        job_name: instance.job_name.clone(),
        instance_id: instance.id.unwrap_or_default(),
        parameters: parameters.clone(),
    }
}
