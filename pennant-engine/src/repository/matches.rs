//! Computed Match Repository
//!
//! Owns the derived join tables produced by the selector reconciler. Every
//! write is a scope-bounded replace: delete the scope's previous rows and
//! bulk-insert the new set in one transaction, ignoring rows that collide
//! with a concurrently inserted duplicate. Readers never observe a partial
//! match set.

use sqlx::PgPool;
use uuid::Uuid;

/// Replace the resource match set of one environment
pub async fn replace_environment_matches(
    pool: &PgPool,
    environment_id: Uuid,
    resource_ids: &[Uuid],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM environment_resources WHERE environment_id = $1")
        .bind(environment_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO environment_resources (environment_id, resource_id)
        SELECT $1, resource_id FROM UNNEST($2::uuid[]) AS t(resource_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(environment_id)
    .bind(resource_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Replace the resource match set of one deployment
pub async fn replace_deployment_matches(
    pool: &PgPool,
    deployment_id: Uuid,
    resource_ids: &[Uuid],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM deployment_resources WHERE deployment_id = $1")
        .bind(deployment_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO deployment_resources (deployment_id, resource_id)
        SELECT $1, resource_id FROM UNNEST($2::uuid[]) AS t(resource_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(deployment_id)
    .bind(resource_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Replace the match rows of a single resource across environments and
/// deployments of its workspace
pub async fn replace_resource_matches(
    pool: &PgPool,
    resource_id: Uuid,
    environment_ids: &[Uuid],
    deployment_ids: &[Uuid],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM environment_resources WHERE resource_id = $1")
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM deployment_resources WHERE resource_id = $1")
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO environment_resources (environment_id, resource_id)
        SELECT environment_id, $1 FROM UNNEST($2::uuid[]) AS t(environment_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(resource_id)
    .bind(environment_ids)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO deployment_resources (deployment_id, resource_id)
        SELECT deployment_id, $1 FROM UNNEST($2::uuid[]) AS t(deployment_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(resource_id)
    .bind(deployment_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Replace the release-target match set of one policy
pub async fn replace_policy_matches(
    pool: &PgPool,
    policy_id: Uuid,
    rows: &[(Uuid, Uuid)],
) -> Result<(), sqlx::Error> {
    let policy_target_ids: Vec<Uuid> = rows.iter().map(|(pt, _)| *pt).collect();
    let release_target_ids: Vec<Uuid> = rows.iter().map(|(_, rt)| *rt).collect();

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM policy_release_targets WHERE policy_id = $1")
        .bind(policy_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO policy_release_targets (policy_target_id, policy_id, release_target_id)
        SELECT policy_target_id, $1, release_target_id
        FROM UNNEST($2::uuid[], $3::uuid[]) AS t(policy_target_id, release_target_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(policy_id)
    .bind(&policy_target_ids)
    .bind(&release_target_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Replace the policy match rows of a set of release targets.
///
/// Used when targets are created or change shape, so freshly derived targets
/// are gated by their policies before the first evaluation runs.
pub async fn replace_matches_for_targets(
    pool: &PgPool,
    release_target_ids: &[Uuid],
    rows: &[(Uuid, Uuid, Uuid)],
) -> Result<(), sqlx::Error> {
    let policy_target_ids: Vec<Uuid> = rows.iter().map(|(pt, _, _)| *pt).collect();
    let policy_ids: Vec<Uuid> = rows.iter().map(|(_, p, _)| *p).collect();
    let target_ids: Vec<Uuid> = rows.iter().map(|(_, _, rt)| *rt).collect();

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM policy_release_targets WHERE release_target_id = ANY($1)")
        .bind(release_target_ids)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO policy_release_targets (policy_target_id, policy_id, release_target_id)
        SELECT policy_target_id, policy_id, release_target_id
        FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[])
            AS t(policy_target_id, policy_id, release_target_id)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(&policy_target_ids)
    .bind(&policy_ids)
    .bind(&target_ids)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Resource ids currently matched to an environment
pub async fn environment_resource_ids(
    pool: &PgPool,
    environment_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT resource_id FROM environment_resources WHERE environment_id = $1",
    )
    .bind(environment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Resource ids currently matched to a deployment
pub async fn deployment_resource_ids(
    pool: &PgPool,
    deployment_id: Uuid,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT resource_id FROM deployment_resources WHERE deployment_id = $1")
            .bind(deployment_id)
            .fetch_all(pool)
            .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Release targets currently matched by a policy
pub async fn policy_target_ids(pool: &PgPool, policy_id: Uuid) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT release_target_id FROM policy_release_targets WHERE policy_id = $1",
    )
    .bind(policy_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
