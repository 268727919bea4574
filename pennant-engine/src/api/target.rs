//! Release-target inspection

use axum::{
    Json,
    extract::{Path, State},
};
use pennant_core::dto::ReleaseTargetStatus;
use uuid::Uuid;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::repository::{job_repository, release_repository, target_repository};

/// GET /release-target/{id}
/// Current target state: desired release, latest job, last decision
pub async fn get_release_target(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReleaseTargetStatus>> {
    let target = target_repository::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("release target {} not found", id)))?;

    let desired_release = match target.desired_release_id {
        Some(release_id) => release_repository::find_by_id(&state.pool, release_id).await?,
        None => None,
    };
    let latest_job = job_repository::find_latest_for_target(&state.pool, target.id).await?;

    Ok(Json(ReleaseTargetStatus {
        target,
        desired_release,
        latest_job,
    }))
}
