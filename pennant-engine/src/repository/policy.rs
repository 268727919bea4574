//! Policy Repository
//!
//! Policies and their selector triples. Rule bags are stored as JSONB and
//! parsed into the closed rule union on read.

use pennant_core::condition::Condition;
use pennant_core::domain::policy::{Policy, PolicyRule, PolicyTarget};
use sqlx::PgPool;
use uuid::Uuid;

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Policy>, sqlx::Error> {
    let row = sqlx::query_as::<_, PolicyRow>(
        r#"
        SELECT id, workspace_id, name, priority, rules, created_at
        FROM policies
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn list_for_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<Policy>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyRow>(
        r#"
        SELECT id, workspace_id, name, priority, rules, created_at
        FROM policies
        WHERE workspace_id = $1
        ORDER BY priority DESC, created_at ASC
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Policies matching a release target through the computed match table,
/// highest priority first.
pub async fn list_matching_target(
    pool: &PgPool,
    release_target_id: Uuid,
) -> Result<Vec<Policy>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyRow>(
        r#"
        SELECT DISTINCT p.id, p.workspace_id, p.name, p.priority, p.rules, p.created_at
        FROM policies p
        JOIN policy_release_targets prt ON prt.policy_id = p.id
        WHERE prt.release_target_id = $1
        ORDER BY p.priority DESC, p.created_at ASC
        "#,
    )
    .bind(release_target_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

pub async fn list_targets_for_policy(
    pool: &PgPool,
    policy_id: Uuid,
) -> Result<Vec<PolicyTarget>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyTargetRow>(
        r#"
        SELECT id, policy_id, deployment_selector, environment_selector, resource_selector
        FROM policy_targets
        WHERE policy_id = $1
        "#,
    )
    .bind(policy_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// All selector triples of a workspace, keyed for target matching
pub async fn list_targets_for_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<PolicyTarget>, sqlx::Error> {
    let rows = sqlx::query_as::<_, PolicyTargetRow>(
        r#"
        SELECT pt.id, pt.policy_id, pt.deployment_selector, pt.environment_selector,
               pt.resource_selector
        FROM policy_targets pt
        JOIN policies p ON p.id = pt.policy_id
        WHERE p.workspace_id = $1
        "#,
    )
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_selector(value: Option<serde_json::Value>) -> Option<Condition> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

fn parse_rules(value: serde_json::Value) -> Vec<PolicyRule> {
    serde_json::from_value(value).unwrap_or_default()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    priority: i32,
    rules: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<PolicyRow> for Policy {
    fn from(row: PolicyRow) -> Self {
        Policy {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            priority: row.priority,
            rules: parse_rules(row.rules),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyTargetRow {
    id: Uuid,
    policy_id: Uuid,
    deployment_selector: Option<serde_json::Value>,
    environment_selector: Option<serde_json::Value>,
    resource_selector: Option<serde_json::Value>,
}

impl From<PolicyTargetRow> for PolicyTarget {
    fn from(row: PolicyTargetRow) -> Self {
        PolicyTarget {
            id: row.id,
            policy_id: row.policy_id,
            deployment_selector: parse_selector(row.deployment_selector),
            environment_selector: parse_selector(row.environment_selector),
            resource_selector: parse_selector(row.resource_selector),
        }
    }
}
