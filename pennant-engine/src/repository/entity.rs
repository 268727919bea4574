//! Entity Repository
//!
//! Read access to resources, systems, environments, deployments, and
//! deployment versions. These rows are written by external intake surfaces;
//! the engine only consumes them.

use pennant_core::condition::Condition;
use pennant_core::domain::entity::{
    Deployment, DeploymentVersion, Environment, Resource, System, VersionStatus,
};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn find_resource(pool: &PgPool, id: Uuid) -> Result<Option<Resource>, sqlx::Error> {
    let row = sqlx::query_as::<_, ResourceRow>(
        r#"
        SELECT id, workspace_id, name, kind, identifier, version, metadata, created_at
        FROM resources
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn list_resources(pool: &PgPool, workspace_id: Uuid) -> Result<Vec<Resource>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ResourceRow>(
        r#"
        SELECT id, workspace_id, name, kind, identifier, version, metadata, created_at
        FROM resources
        WHERE workspace_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn find_system(pool: &PgPool, id: Uuid) -> Result<Option<System>, sqlx::Error> {
    let row = sqlx::query_as::<_, SystemRow>(
        r#"
        SELECT id, workspace_id, name, slug
        FROM systems
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn find_environment(pool: &PgPool, id: Uuid) -> Result<Option<Environment>, sqlx::Error> {
    let row = sqlx::query_as::<_, EnvironmentRow>(
        r#"
        SELECT id, system_id, name, resource_selector, created_at
        FROM environments
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// All environments of every system in a workspace
pub async fn list_environments(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<Environment>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EnvironmentRow>(
        r#"
        SELECT e.id, e.system_id, e.name, e.resource_selector, e.created_at
        FROM environments e
        JOIN systems s ON s.id = e.system_id
        WHERE s.workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn list_environments_for_system(
    pool: &PgPool,
    system_id: Uuid,
) -> Result<Vec<Environment>, sqlx::Error> {
    let rows = sqlx::query_as::<_, EnvironmentRow>(
        r#"
        SELECT id, system_id, name, resource_selector, created_at
        FROM environments
        WHERE system_id = $1
        "#,
    )
    .bind(system_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn find_deployment(pool: &PgPool, id: Uuid) -> Result<Option<Deployment>, sqlx::Error> {
    let row = sqlx::query_as::<_, DeploymentRow>(
        r#"
        SELECT id, system_id, name, slug, resource_selector, job_agent_id,
               job_timeout_seconds, created_at
        FROM deployments
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// All deployments of every system in a workspace
pub async fn list_deployments(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<Deployment>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DeploymentRow>(
        r#"
        SELECT d.id, d.system_id, d.name, d.slug, d.resource_selector, d.job_agent_id,
               d.job_timeout_seconds, d.created_at
        FROM deployments d
        JOIN systems s ON s.id = d.system_id
        WHERE s.workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn list_deployments_for_system(
    pool: &PgPool,
    system_id: Uuid,
) -> Result<Vec<Deployment>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DeploymentRow>(
        r#"
        SELECT id, system_id, name, slug, resource_selector, job_agent_id,
               job_timeout_seconds, created_at
        FROM deployments
        WHERE system_id = $1
        "#,
    )
    .bind(system_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn find_version(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<DeploymentVersion>, sqlx::Error> {
    let row = sqlx::query_as::<_, VersionRow>(
        r#"
        SELECT id, deployment_id, tag, status, metadata, created_at
        FROM deployment_versions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Newest ready versions of a deployment, the pipeline's candidate pool
pub async fn list_ready_versions(
    pool: &PgPool,
    deployment_id: Uuid,
    limit: i64,
) -> Result<Vec<DeploymentVersion>, sqlx::Error> {
    let rows = sqlx::query_as::<_, VersionRow>(
        r#"
        SELECT id, deployment_id, tag, status, metadata, created_at
        FROM deployment_versions
        WHERE deployment_id = $1 AND status = 'ready'
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(deployment_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Variables resolved into every release snapshot of a deployment
pub async fn deployment_variables(
    pool: &PgPool,
    deployment_id: Uuid,
) -> Result<std::collections::BTreeMap<String, serde_json::Value>, sqlx::Error> {
    let rows: Vec<(String, serde_json::Value)> =
        sqlx::query_as("SELECT key, value FROM deployment_variables WHERE deployment_id = $1")
            .bind(deployment_id)
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_selector(value: Option<serde_json::Value>) -> Option<Condition> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

fn parse_metadata(value: serde_json::Value) -> std::collections::HashMap<String, String> {
    serde_json::from_value(value).unwrap_or_default()
}

fn string_to_version_status(s: &str) -> VersionStatus {
    match s {
        "ready" => VersionStatus::Ready,
        "building" => VersionStatus::Building,
        "failed" => VersionStatus::Failed,
        "rejected" => VersionStatus::Rejected,
        _ => VersionStatus::Building,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct SystemRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    slug: String,
}

impl From<SystemRow> for System {
    fn from(row: SystemRow) -> Self {
        System {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            slug: row.slug,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    kind: String,
    identifier: String,
    version: Option<String>,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            kind: row.kind,
            identifier: row.identifier,
            version: row.version,
            metadata: parse_metadata(row.metadata),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: Uuid,
    system_id: Uuid,
    name: String,
    resource_selector: Option<serde_json::Value>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Environment {
            id: row.id,
            system_id: row.system_id,
            name: row.name,
            resource_selector: parse_selector(row.resource_selector),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    system_id: Uuid,
    name: String,
    slug: String,
    resource_selector: Option<serde_json::Value>,
    job_agent_id: Option<Uuid>,
    job_timeout_seconds: Option<i64>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Deployment {
            id: row.id,
            system_id: row.system_id,
            name: row.name,
            slug: row.slug,
            resource_selector: parse_selector(row.resource_selector),
            job_agent_id: row.job_agent_id,
            job_timeout_seconds: row.job_timeout_seconds,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    deployment_id: Uuid,
    tag: String,
    status: String,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<VersionRow> for DeploymentVersion {
    fn from(row: VersionRow) -> Self {
        DeploymentVersion {
            id: row.id,
            deployment_id: row.deployment_id,
            tag: row.tag,
            status: string_to_version_status(&row.status),
            metadata: parse_metadata(row.metadata),
            created_at: row.created_at,
        }
    }
}
