use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Entity tables (written by external intake surfaces, read here)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            kind VARCHAR(255) NOT NULL,
            identifier VARCHAR(255) NOT NULL,
            version VARCHAR(255),
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS systems (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            slug VARCHAR(255) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environments (
            id UUID PRIMARY KEY,
            system_id UUID NOT NULL REFERENCES systems(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            resource_selector JSONB,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id UUID PRIMARY KEY,
            system_id UUID NOT NULL REFERENCES systems(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            slug VARCHAR(255) NOT NULL,
            resource_selector JSONB,
            job_agent_id UUID,
            job_timeout_seconds BIGINT,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_versions (
            id UUID PRIMARY KEY,
            deployment_id UUID NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            tag VARCHAR(255) NOT NULL,
            status VARCHAR(50) NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_variables (
            deployment_id UUID NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            key VARCHAR(255) NOT NULL,
            value JSONB NOT NULL,
            PRIMARY KEY (deployment_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Derived release targets and their immutable release snapshots
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS release_targets (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            resource_id UUID NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
            environment_id UUID NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
            deployment_id UUID NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            desired_release_id UUID,
            last_decision_reason TEXT,
            last_evaluated_at TIMESTAMPTZ,
            UNIQUE (resource_id, environment_id, deployment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS releases (
            id UUID PRIMARY KEY,
            release_target_id UUID NOT NULL REFERENCES release_targets(id) ON DELETE CASCADE,
            version_id UUID NOT NULL REFERENCES deployment_versions(id) ON DELETE CASCADE,
            variables JSONB NOT NULL DEFAULT '{}',
            variables_hash VARCHAR(64) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (release_target_id, version_id, variables_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            release_target_id UUID NOT NULL REFERENCES release_targets(id) ON DELETE CASCADE,
            release_id UUID NOT NULL REFERENCES releases(id) ON DELETE CASCADE,
            job_agent_id UUID,
            status VARCHAR(50) NOT NULL,
            message TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            external_run_id TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Policies and their selector triples
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            id UUID PRIMARY KEY,
            workspace_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            rules JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policy_targets (
            id UUID PRIMARY KEY,
            policy_id UUID NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
            deployment_selector JSONB,
            environment_selector JSONB,
            resource_selector JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Computed match tables, replaced wholesale per reconciliation scope
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environment_resources (
            environment_id UUID NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
            resource_id UUID NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
            PRIMARY KEY (environment_id, resource_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_resources (
            deployment_id UUID NOT NULL REFERENCES deployments(id) ON DELETE CASCADE,
            resource_id UUID NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
            PRIMARY KEY (deployment_id, resource_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policy_release_targets (
            policy_target_id UUID NOT NULL REFERENCES policy_targets(id) ON DELETE CASCADE,
            policy_id UUID NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
            release_target_id UUID NOT NULL REFERENCES release_targets(id) ON DELETE CASCADE,
            PRIMARY KEY (policy_target_id, release_target_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Approval records, written by external surfaces and read by the pipeline
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approvals (
            id UUID PRIMARY KEY,
            release_target_id UUID NOT NULL REFERENCES release_targets(id) ON DELETE CASCADE,
            version_id UUID NOT NULL REFERENCES deployment_versions(id) ON DELETE CASCADE,
            user_id UUID NOT NULL,
            role_id UUID,
            status VARCHAR(50) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Work queue and lock service
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id UUID PRIMARY KEY,
            kind VARCHAR(50) NOT NULL,
            subject_id UUID NOT NULL,
            workspace_id UUID NOT NULL,
            status VARCHAR(20) NOT NULL DEFAULT 'pending',
            enqueued_at TIMESTAMPTZ NOT NULL,
            claimed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locks (
            key VARCHAR(255) PRIMARY KEY,
            token UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot query paths
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_workspace ON resources(workspace_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_versions_deployment ON deployment_versions(deployment_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_target_status ON jobs(release_target_id, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_policy_matches_target ON policy_release_targets(release_target_id, policy_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_approvals_target_version ON approvals(release_target_id, version_id)",
    )
    .execute(pool)
    .await?;

    // Pending-set dedup: at most one pending item per (kind, subject).
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_work_items_pending_dedup
        ON work_items(kind, subject_id) WHERE status = 'pending'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_items_pending ON work_items(status, enqueued_at)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
