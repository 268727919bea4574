//! Approval Repository
//!
//! Approval records are written by external review surfaces; the pipeline
//! only reads them for the release target + version pair under evaluation.

use std::collections::HashMap;

use sqlx::PgPool;
use uuid::Uuid;

/// Aggregated approval state for one (release target, version) pair
#[derive(Debug, Clone, Default)]
pub struct ApprovalSummary {
    /// Distinct users with an approved record
    pub approved_user_ids: Vec<Uuid>,
    /// Approved records grouped by role
    pub approvals_by_role: HashMap<Uuid, i64>,
    /// Number of rejected records; any rejection vetoes the version
    pub rejections: i64,
}

impl ApprovalSummary {
    pub fn approval_count(&self) -> i64 {
        self.approved_user_ids.len() as i64
    }

    pub fn approved_by(&self, user_id: Uuid) -> bool {
        self.approved_user_ids.contains(&user_id)
    }

    pub fn role_approval_count(&self, role_id: Uuid) -> i64 {
        self.approvals_by_role.get(&role_id).copied().unwrap_or(0)
    }
}

pub async fn summarize(
    pool: &PgPool,
    release_target_id: Uuid,
    version_id: Uuid,
) -> Result<ApprovalSummary, sqlx::Error> {
    let rows: Vec<(Uuid, Option<Uuid>, String)> = sqlx::query_as(
        r#"
        SELECT user_id, role_id, status
        FROM approvals
        WHERE release_target_id = $1 AND version_id = $2
        "#,
    )
    .bind(release_target_id)
    .bind(version_id)
    .fetch_all(pool)
    .await?;

    let mut summary = ApprovalSummary::default();
    for (user_id, role_id, status) in rows {
        match status.as_str() {
            "approved" => {
                if !summary.approved_user_ids.contains(&user_id) {
                    summary.approved_user_ids.push(user_id);
                }
                if let Some(role_id) = role_id {
                    *summary.approvals_by_role.entry(role_id).or_insert(0) += 1;
                }
            }
            "rejected" => summary.rejections += 1,
            _ => {}
        }
    }

    Ok(summary)
}
