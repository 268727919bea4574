//! Release Target Repository
//!
//! Release targets are derived rows: the reconciler upserts them from the
//! computed match sets and retires the ones whose triple no longer holds.

use pennant_core::domain::target::ReleaseTarget;
use sqlx::PgPool;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    id, workspace_id, resource_id, environment_id, deployment_id,
    desired_release_id, last_decision_reason, last_evaluated_at
"#;

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<ReleaseTarget>, sqlx::Error> {
    let row = sqlx::query_as::<_, TargetRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM release_targets WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn list_for_workspace(
    pool: &PgPool,
    workspace_id: Uuid,
) -> Result<Vec<ReleaseTarget>, sqlx::Error> {
    let rows = sqlx::query_as::<_, TargetRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM release_targets WHERE workspace_id = $1"
    ))
    .bind(workspace_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Upsert one (resource, environment, deployment) triple.
///
/// Returns the target and whether this call created it.
pub async fn upsert(
    pool: &PgPool,
    workspace_id: Uuid,
    resource_id: Uuid,
    environment_id: Uuid,
    deployment_id: Uuid,
) -> Result<(ReleaseTarget, bool), sqlx::Error> {
    let inserted = sqlx::query_as::<_, TargetRow>(&format!(
        r#"
        INSERT INTO release_targets (id, workspace_id, resource_id, environment_id, deployment_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (resource_id, environment_id, deployment_id) DO NOTHING
        RETURNING {SELECT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(resource_id)
    .bind(environment_id)
    .bind(deployment_id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok((row.into(), true));
    }

    // Lost the insert race or the row already existed; read it back.
    let row = sqlx::query_as::<_, TargetRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS} FROM release_targets
        WHERE resource_id = $1 AND environment_id = $2 AND deployment_id = $3
        "#
    ))
    .bind(resource_id)
    .bind(environment_id)
    .bind(deployment_id)
    .fetch_one(pool)
    .await?;

    Ok((row.into(), false))
}

/// Delete every target of `environment_id` not named in `keep_ids`.
///
/// Returns the retired target ids so the caller can cancel their pending
/// jobs first; jobs and match rows cascade with the target row.
pub async fn retire_except(
    pool: &PgPool,
    environment_id: Uuid,
    keep_ids: &[Uuid],
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM release_targets
        WHERE environment_id = $1 AND id <> ALL($2)
        "#,
    )
    .bind(environment_id)
    .bind(keep_ids)
    .fetch_all(pool)
    .await?;
    let retired: Vec<Uuid> = rows.into_iter().map(|(id,)| id).collect();

    if !retired.is_empty() {
        sqlx::query("DELETE FROM release_targets WHERE id = ANY($1)")
            .bind(&retired)
            .execute(pool)
            .await?;
    }

    Ok(retired)
}

pub async fn set_desired_release(
    pool: &PgPool,
    target_id: Uuid,
    release_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE release_targets SET desired_release_id = $1 WHERE id = $2")
        .bind(release_id)
        .bind(target_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Record the outcome of a pipeline evaluation on the target row
pub async fn record_decision(
    pool: &PgPool,
    target_id: Uuid,
    reason: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE release_targets
        SET last_decision_reason = $1, last_evaluated_at = now()
        WHERE id = $2
        "#,
    )
    .bind(reason)
    .bind(target_id)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: Uuid,
    workspace_id: Uuid,
    resource_id: Uuid,
    environment_id: Uuid,
    deployment_id: Uuid,
    desired_release_id: Option<Uuid>,
    last_decision_reason: Option<String>,
    last_evaluated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<TargetRow> for ReleaseTarget {
    fn from(row: TargetRow) -> Self {
        ReleaseTarget {
            id: row.id,
            workspace_id: row.workspace_id,
            resource_id: row.resource_id,
            environment_id: row.environment_id,
            deployment_id: row.deployment_id,
            desired_release_id: row.desired_release_id,
            last_decision_reason: row.last_decision_reason,
            last_evaluated_at: row.last_evaluated_at,
        }
    }
}
