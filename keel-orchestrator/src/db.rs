use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

pub async fn create_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create job instances table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_instances (
            id UUID PRIMARY KEY,
            job_name VARCHAR(255) NOT NULL,
            job_key VARCHAR(64) NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT uq_job_instances_identity UNIQUE (job_name, job_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            id UUID PRIMARY KEY,
            seq BIGSERIAL NOT NULL,
            job_instance_id UUID NOT NULL REFERENCES job_instances(id) ON DELETE CASCADE,
            version INTEGER NOT NULL DEFAULT 0,
            parameters JSONB NOT NULL DEFAULT '{}',
            status VARCHAR(20) NOT NULL,
            create_time TIMESTAMPTZ NOT NULL,
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ,
            last_updated TIMESTAMPTZ,
            configuration_location TEXT,
            parallel BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one running launched execution per instance, across every
    // coordinator. Parallel executions are exempt.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_job_executions_running
        ON job_executions(job_instance_id)
        WHERE NOT parallel
          AND end_time IS NULL
          AND status NOT IN ('COMPLETED', 'FAILED', 'STOPPED', 'ABANDONED')
        "#,
    )
    .execute(pool)
    .await?;

    // Create step executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_executions (
            id UUID PRIMARY KEY,
            seq BIGSERIAL NOT NULL,
            job_execution_id UUID NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
            step_name VARCHAR(255) NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            status VARCHAR(20) NOT NULL,
            start_time TIMESTAMPTZ NOT NULL,
            end_time TIMESTAMPTZ,
            last_updated TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create execution contexts table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_contexts (
            owner_kind VARCHAR(10) NOT NULL,
            owner_id UUID NOT NULL,
            context JSONB NOT NULL DEFAULT '{}',
            PRIMARY KEY (owner_kind, owner_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for history queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_executions_instance ON job_executions(job_instance_id, seq DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_job_execution ON step_executions(job_execution_id, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_name ON step_executions(step_name)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
