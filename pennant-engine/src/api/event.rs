//! Change-event intake
//!
//! External surfaces post a change-event envelope whenever an entity
//! mutates; the engine turns it into a work item. Duplicate pending items
//! are suppressed at enqueue time.

use axum::{Json, extract::State, http::StatusCode};
use pennant_core::dto::ChangeEvent;

use super::AppState;
use super::error::ApiResult;

/// POST /event
/// Accept a change event and enqueue the matching work item
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<ChangeEvent>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let enqueued = state
        .queue
        .enqueue(event.kind, event.subject_id, event.workspace_id)
        .await?;

    tracing::debug!(
        "Event {:?} for {} {}",
        event.kind,
        event.subject_id,
        if enqueued { "enqueued" } else { "deduplicated" }
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "enqueued": enqueued })),
    ))
}
