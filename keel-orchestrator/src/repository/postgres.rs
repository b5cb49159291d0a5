//! PostgreSQL store
//!
//! Implements the instance, execution and context stores on top of the
//! schema created by [`crate::db::run_migrations`]. Uniqueness is enforced by
//! the database:
//! - `uq_job_instances_identity` on `(job_name, job_key)`
//! - `uq_job_executions_running`, a partial unique index allowing one
//!   non-terminal, un-ended execution per instance among those not flagged
//!   `parallel`

use async_trait::async_trait;
use keel_core::{
    BatchStatus, ContextOwner, ExecutionContext, JobExecution, JobInstance, JobKey,
    JobParameters, StepExecution,
};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::repository::{ContextStore, ExecutionStore, InstanceStore, PersistedState};

const INSTANCE_IDENTITY_CONSTRAINT: &str = "uq_job_instances_identity";
const RUNNING_EXECUTION_CONSTRAINT: &str = "uq_job_executions_running";

const EXECUTION_COLUMNS: &str = r#"
    e.id, e.version, e.parameters, e.status, e.create_time, e.start_time,
    e.end_time, e.last_updated, e.configuration_location,
    i.id AS instance_id, i.job_name, i.job_key, i.parameters AS instance_parameters
"#;

const STEP_COLUMNS: &str = r#"
    id, version, step_name, job_execution_id, status, start_time, end_time, last_updated
"#;

/// PostgreSQL implementation of the instance, execution and context stores
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<Option<JobInstance>> {
        let key = parameters.job_key()?;

        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, job_name, job_key, parameters
            FROM job_instances
            WHERE job_name = $1 AND job_key = $2
            "#,
        )
        .bind(job_name)
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobInstance::try_from).transpose()
    }

    async fn find_instance_by_id(&self, id: Uuid) -> StoreResult<Option<JobInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, job_name, job_key, parameters
            FROM job_instances
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobInstance::try_from).transpose()
    }

    async fn create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> StoreResult<JobInstance> {
        let instance = JobInstance::new(job_name, parameters)?.with_id(Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO job_instances (id, job_name, job_key, parameters, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.job_name)
        .bind(instance.job_key.as_str())
        .bind(serde_json::to_value(&instance.parameters)?)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_violation_of(&err, INSTANCE_IDENTITY_CONSTRAINT) {
                StoreError::DuplicateInstance {
                    job_name: instance.job_name.clone(),
                    job_key: instance.job_key.to_string(),
                }
            } else {
                StoreError::Database(err)
            }
        })?;

        tracing::debug!("Stored job instance {} for job '{}'", instance, job_name);

        Ok(instance)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn find_executions(&self, instance: &JobInstance) -> StoreResult<Vec<JobExecution>> {
        let Some(instance_id) = instance.id else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM job_executions e
            JOIN job_instances i ON i.id = e.job_instance_id
            WHERE e.job_instance_id = $1
            ORDER BY e.seq DESC
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobExecution::try_from).collect()
    }

    async fn find_last_execution(
        &self,
        instance: &JobInstance,
    ) -> StoreResult<Option<JobExecution>> {
        let Some(instance_id) = instance.id else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM job_executions e
            JOIN job_instances i ON i.id = e.job_instance_id
            WHERE e.job_instance_id = $1
            ORDER BY e.seq DESC
            LIMIT 1
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobExecution::try_from).transpose()
    }

    async fn find_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"
            SELECT {}
            FROM job_executions e
            JOIN job_instances i ON i.id = e.job_instance_id
            WHERE e.id = $1
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobExecution::try_from).transpose()
    }

    async fn save_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        self.insert_execution(execution, false).await
    }

    async fn save_parallel_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        self.insert_execution(execution, true).await
    }

    async fn update_execution(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let id = execution
            .id
            .ok_or_else(|| StoreError::NotFound("unsaved job execution".to_string()))?;
        let instance_id = execution.instance_id().unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET version = version + 1, status = $1, start_time = $2, end_time = $3,
                last_updated = $4, parameters = $5
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.last_updated)
        .bind(serde_json::to_value(&execution.parameters)?)
        .bind(id)
        .bind(execution.version)
        .execute(&self.pool)
        .await
        .map_err(|err| running_conflict(err, instance_id))?;

        if result.rows_affected() == 0 {
            return Err(self
                .missing_or_conflict("job_executions", "job execution", id, execution.version)
                .await);
        }

        execution.version += 1;
        Ok(())
    }

    async fn current_state(&self, execution_id: Uuid) -> StoreResult<Option<PersistedState>> {
        let row = sqlx::query_as::<_, (String, i32)>(
            "SELECT status, version FROM job_executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(status, version)| PersistedState {
            status: BatchStatus::from(status.as_str()),
            version,
        }))
    }

    async fn save_step_execution(&self, step: &mut StepExecution) -> StoreResult<()> {
        let id = Uuid::new_v4();
        insert_step(&self.pool, id, step).await?;

        step.id = Some(id);
        step.version = 0;
        Ok(())
    }

    async fn save_step_executions(&self, steps: &mut [StepExecution]) -> StoreResult<()> {
        let ids: Vec<Uuid> = steps.iter().map(|_| Uuid::new_v4()).collect();

        let mut tx = self.pool.begin().await?;
        for (id, step) in ids.iter().zip(steps.iter()) {
            insert_step(&mut *tx, *id, step).await?;
        }
        tx.commit().await?;

        for (id, step) in ids.into_iter().zip(steps.iter_mut()) {
            step.id = Some(id);
            step.version = 0;
        }
        Ok(())
    }

    async fn update_step_execution(&self, step: &mut StepExecution) -> StoreResult<()> {
        let id = step
            .id
            .ok_or_else(|| StoreError::NotFound("unsaved step execution".to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET version = version + 1, status = $1, start_time = $2, end_time = $3,
                last_updated = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(step.status.as_str())
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(step.last_updated)
        .bind(id)
        .bind(step.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .missing_or_conflict("step_executions", "step execution", id, step.version)
                .await);
        }

        step.version += 1;
        Ok(())
    }

    async fn load_step_executions_into(&self, execution: &mut JobExecution) -> StoreResult<()> {
        let Some(id) = execution.id else {
            execution.step_executions = Vec::new();
            return Ok(());
        };

        let rows = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {}
            FROM step_executions
            WHERE job_execution_id = $1
            ORDER BY seq ASC
            "#,
            STEP_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        execution.step_executions = rows.into_iter().map(StepExecution::from).collect();
        Ok(())
    }
}

impl PgStore {
    async fn insert_execution(&self, execution: &mut JobExecution, parallel: bool) -> StoreResult<()> {
        let instance_id = execution
            .instance_id()
            .ok_or_else(|| StoreError::NotFound("unsaved job instance".to_string()))?;
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, job_instance_id, version, parameters, status, create_time,
                start_time, end_time, last_updated, configuration_location, parallel
            )
            VALUES ($1, $2, 0, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(instance_id)
        .bind(serde_json::to_value(&execution.parameters)?)
        .bind(execution.status.as_str())
        .bind(execution.create_time)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.last_updated)
        .bind(&execution.configuration_location)
        .bind(parallel)
        .execute(&self.pool)
        .await
        .map_err(|err| running_conflict(err, instance_id))?;

        execution.id = Some(id);
        execution.version = 0;

        Ok(())
    }

    /// Tells a lost compare-and-write apart from a missing row
    async fn missing_or_conflict(
        &self,
        table: &'static str,
        entity: &'static str,
        id: Uuid,
        expected: i32,
    ) -> StoreError {
        let exists = sqlx::query_scalar::<_, i32>(&format!(
            "SELECT version FROM {table} WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await;

        match exists {
            Ok(Some(_)) => StoreError::Conflict {
                entity,
                id,
                expected,
            },
            Ok(None) => StoreError::NotFound(format!("{} {}", entity, id)),
            Err(err) => StoreError::Database(err),
        }
    }
}

#[async_trait]
impl ContextStore for PgStore {
    async fn get_context(&self, owner: ContextOwner) -> StoreResult<ExecutionContext> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            r#"
            SELECT context
            FROM execution_contexts
            WHERE owner_kind = $1 AND owner_id = $2
            "#,
        )
        .bind(owner.kind())
        .bind(owner.id())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(value) => {
                let entries: BTreeMap<String, serde_json::Value> = serde_json::from_value(value)?;
                Ok(ExecutionContext::from_entries(entries))
            }
            None => Ok(ExecutionContext::new()),
        }
    }

    async fn save_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> StoreResult<()> {
        upsert_context(&self.pool, owner, context).await
    }

    async fn update_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> StoreResult<()> {
        upsert_context(&self.pool, owner, context).await
    }

    async fn save_contexts(&self, contexts: &[(ContextOwner, &ExecutionContext)]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for (owner, context) in contexts {
            upsert_context(&mut *tx, *owner, context).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn insert_step<'e, E>(executor: E, id: Uuid, step: &StepExecution) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let job_execution_id = step
        .job_execution_id
        .ok_or_else(|| StoreError::NotFound("unsaved job execution".to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO step_executions (
            id, job_execution_id, step_name, version, status, start_time, end_time, last_updated
        )
        VALUES ($1, $2, $3, 0, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(job_execution_id)
    .bind(&step.step_name)
    .bind(step.status.as_str())
    .bind(step.start_time)
    .bind(step.end_time)
    .bind(step.last_updated)
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_context<'e, E>(
    executor: E,
    owner: ContextOwner,
    context: &ExecutionContext,
) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO execution_contexts (owner_kind, owner_id, context)
        VALUES ($1, $2, $3)
        ON CONFLICT (owner_kind, owner_id) DO UPDATE SET context = EXCLUDED.context
        "#,
    )
    .bind(owner.kind())
    .bind(owner.id())
    .bind(serde_json::to_value(context)?)
    .execute(executor)
    .await?;

    Ok(())
}

fn is_violation_of(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

fn running_conflict(err: sqlx::Error, instance_id: Uuid) -> StoreError {
    if is_violation_of(&err, RUNNING_EXECUTION_CONSTRAINT) {
        StoreError::DuplicateRunning { instance_id }
    } else {
        StoreError::Database(err)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    job_name: String,
    job_key: String,
    parameters: serde_json::Value,
}

impl TryFrom<InstanceRow> for JobInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(JobInstance {
            id: Some(row.id),
            job_name: row.job_name,
            job_key: JobKey::from_raw(row.job_key),
            parameters: serde_json::from_value(row.parameters)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    version: i32,
    parameters: serde_json::Value,
    status: String,
    create_time: chrono::DateTime<chrono::Utc>,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
    configuration_location: Option<String>,
    instance_id: Uuid,
    job_name: String,
    job_key: String,
    instance_parameters: serde_json::Value,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let instance = JobInstance::try_from(InstanceRow {
            id: row.instance_id,
            job_name: row.job_name,
            job_key: row.job_key,
            parameters: row.instance_parameters,
        })?;

        Ok(JobExecution {
            id: Some(row.id),
            version: row.version,
            instance,
            parameters: serde_json::from_value(row.parameters)?,
            status: BatchStatus::from(row.status.as_str()),
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            last_updated: row.last_updated,
            configuration_location: row.configuration_location,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    version: i32,
    step_name: String,
    job_execution_id: Uuid,
    status: String,
    start_time: chrono::DateTime<chrono::Utc>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<StepRow> for StepExecution {
    fn from(row: StepRow) -> Self {
        StepExecution {
            id: Some(row.id),
            version: row.version,
            step_name: row.step_name,
            job_execution_id: Some(row.job_execution_id),
            status: BatchStatus::from(row.status.as_str()),
            start_time: row.start_time,
            end_time: row.end_time,
            last_updated: row.last_updated,
            execution_context: ExecutionContext::new(),
            terminate_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_row(status: &str) -> ExecutionRow {
        let params = JobParameters::builder()
            .add("date", "2024-01-01")
            .add_non_identifying("attempt", 2i64)
            .build();

        ExecutionRow {
            id: Uuid::new_v4(),
            version: 3,
            parameters: serde_json::to_value(&params).unwrap(),
            status: status.to_string(),
            create_time: chrono::Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            configuration_location: Some("jobs/import.toml".to_string()),
            instance_id: Uuid::new_v4(),
            job_name: "nightly-import".to_string(),
            job_key: params.job_key().unwrap().to_string(),
            instance_parameters: serde_json::to_value(params.identifying()).unwrap(),
        }
    }

    #[test]
    fn test_execution_row_conversion() {
        let row = execution_row("STOPPING");
        let id = row.id;
        let instance_id = row.instance_id;

        let execution = JobExecution::try_from(row).unwrap();
        assert_eq!(execution.id, Some(id));
        assert_eq!(execution.instance_id(), Some(instance_id));
        assert_eq!(execution.status, BatchStatus::Stopping);
        assert_eq!(execution.version, 3);
        assert_eq!(execution.parameters.len(), 2);
        assert_eq!(execution.instance.parameters.len(), 1);
        assert!(execution.execution_context.is_empty());
    }

    #[test]
    fn test_unrecognised_status_maps_to_unknown() {
        let execution = JobExecution::try_from(execution_row("PAUSED")).unwrap();
        assert_eq!(execution.status, BatchStatus::Unknown);
    }

    #[test]
    fn test_corrupt_parameters_are_reported() {
        let mut row = execution_row("STARTED");
        row.parameters = serde_json::json!({"date": 5});
        let err = JobExecution::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_non_database_errors_are_not_violations() {
        assert!(!is_violation_of(
            &sqlx::Error::RowNotFound,
            RUNNING_EXECUTION_CONSTRAINT
        ));
        let instance_id = Uuid::new_v4();
        assert!(matches!(
            running_conflict(sqlx::Error::RowNotFound, instance_id),
            StoreError::Database(_)
        ));
    }
}
