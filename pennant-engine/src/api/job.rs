//! Job API Handlers
//!
//! Read access plus the status-report intake used by the agent integration.
//! Completion reports feed straight back into evaluation: every accepted
//! transition re-queues the job's release target.

use axum::{
    Json,
    extract::{Path, State},
};
use pennant_core::domain::job::{Job, JobStatus};
use pennant_core::workitem::WorkItemKind;
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use super::error::{ApiError, ApiResult};
use crate::repository::{job_repository, target_repository};

/// GET /job/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    let job = job_repository::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))?;

    Ok(Json(job))
}

/// Status report from the agent integration
#[derive(Debug, Deserialize)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub message: Option<String>,
    pub external_run_id: Option<String>,
}

/// POST /job/{id}/status
/// Apply a reported status transition, then re-evaluate the target
pub async fn report_job_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<JobStatusReport>,
) -> ApiResult<Json<Job>> {
    let job = job_repository::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))?;

    if !job.status.can_transition_to(report.status) {
        return Err(ApiError::BadRequest(format!(
            "illegal transition {:?} -> {:?}",
            job.status, report.status
        )));
    }

    job_repository::transition(
        &state.pool,
        job.id,
        &[job.status],
        report.status,
        report.message.as_deref(),
    )
    .await?;

    if let Some(external_run_id) = &report.external_run_id {
        job_repository::set_external_run_id(&state.pool, job.id, external_run_id).await?;
    }

    tracing::info!("Job {} reported as {:?}", job.id, report.status);

    // Lifecycle events feed back into policy state (concurrency counts,
    // dependency satisfaction), so the target gets a fresh decision.
    if let Some(target) = target_repository::find_by_id(&state.pool, job.release_target_id).await? {
        state
            .queue
            .enqueue(
                WorkItemKind::EvaluateReleaseTarget,
                target.id,
                target.workspace_id,
            )
            .await?;
    }

    let updated = job_repository::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))?;

    Ok(Json(updated))
}
