//! Release Manager
//!
//! Owns the lifecycle of releases and the desired-release pointer on each
//! target. Releases are immutable snapshots created idempotently; marking
//! one as desired never mutates the release itself.

use std::collections::BTreeMap;

use pennant_core::domain::release::Release;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::{job_repository, release_repository, target_repository};

/// Idempotently create the release snapshot for (target, version, variables).
pub async fn ensure_release(
    pool: &PgPool,
    release_target_id: Uuid,
    version_id: Uuid,
    variables: &BTreeMap<String, serde_json::Value>,
) -> Result<Release> {
    let release =
        release_repository::ensure(pool, release_target_id, version_id, variables).await?;
    Ok(release)
}

/// Point the target at the release the pipeline selected.
pub async fn mark_desired(pool: &PgPool, target_id: Uuid, release_id: Uuid) -> Result<()> {
    target_repository::set_desired_release(pool, target_id, release_id).await?;
    tracing::debug!("Target {} now desires release {}", target_id, release_id);
    Ok(())
}

/// Whether the desired release is already satisfied: it has a successfully
/// completed job, so there is nothing left to dispatch.
pub async fn is_satisfied(pool: &PgPool, release_id: Uuid) -> Result<bool> {
    Ok(job_repository::release_succeeded(pool, release_id).await?)
}
