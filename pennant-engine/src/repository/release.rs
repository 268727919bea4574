//! Release Repository
//!
//! Releases are immutable; creation is idempotent on the
//! (release target, version, variables fingerprint) identity key.

use std::collections::BTreeMap;

use pennant_core::domain::release::{Release, variables_hash};
use sqlx::PgPool;
use uuid::Uuid;

/// Idempotently create a release snapshot, returning the surviving row.
pub async fn ensure(
    pool: &PgPool,
    release_target_id: Uuid,
    version_id: Uuid,
    variables: &BTreeMap<String, serde_json::Value>,
) -> Result<Release, sqlx::Error> {
    let hash = variables_hash(variables);
    let variables_json = serde_json::to_value(variables).unwrap_or_default();

    let inserted = sqlx::query_as::<_, ReleaseRow>(
        r#"
        INSERT INTO releases (id, release_target_id, version_id, variables, variables_hash, created_at)
        VALUES ($1, $2, $3, $4, $5, now())
        ON CONFLICT (release_target_id, version_id, variables_hash) DO NOTHING
        RETURNING id, release_target_id, version_id, variables, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(release_target_id)
    .bind(version_id)
    .bind(&variables_json)
    .bind(&hash)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok(row.into());
    }

    let row = sqlx::query_as::<_, ReleaseRow>(
        r#"
        SELECT id, release_target_id, version_id, variables, created_at
        FROM releases
        WHERE release_target_id = $1 AND version_id = $2 AND variables_hash = $3
        "#,
    )
    .bind(release_target_id)
    .bind(version_id)
    .bind(&hash)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Release>, sqlx::Error> {
    let row = sqlx::query_as::<_, ReleaseRow>(
        r#"
        SELECT id, release_target_id, version_id, variables, created_at
        FROM releases
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: Uuid,
    release_target_id: Uuid,
    version_id: Uuid,
    variables: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<ReleaseRow> for Release {
    fn from(row: ReleaseRow) -> Self {
        Release {
            id: row.id,
            release_target_id: row.release_target_id,
            version_id: row.version_id,
            variables: serde_json::from_value(row.variables).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}
