//! Job Repository
//!
//! Handles all database operations related to jobs. Status transitions are
//! guarded: the UPDATE names the states it may move from, so an illegal
//! transition is a no-op reported to the caller.

use pennant_core::domain::entity::DeploymentVersion;
use pennant_core::domain::job::{Job, JobStatus};
use sqlx::PgPool;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    id, release_target_id, release_id, job_agent_id, status, message,
    attempt, external_run_id, created_at, started_at, completed_at
"#;

/// Create a new job in the given status (Pending, or a dead-on-arrival
/// status such as InvalidJobAgent when no agent is configured).
pub async fn create(
    pool: &PgPool,
    release_target_id: Uuid,
    release_id: Uuid,
    job_agent_id: Option<Uuid>,
    status: JobStatus,
    message: Option<&str>,
    attempt: i32,
) -> Result<Job, sqlx::Error> {
    let id = Uuid::new_v4();
    let now = chrono::Utc::now();

    sqlx::query(
        r#"
        INSERT INTO jobs (id, release_target_id, release_id, job_agent_id, status, message,
                          attempt, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(release_target_id)
    .bind(release_id)
    .bind(job_agent_id)
    .bind(status_to_string(status))
    .bind(message)
    .bind(attempt)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(Job {
        id,
        release_target_id,
        release_id,
        job_agent_id,
        status,
        message: message.map(str::to_string),
        attempt,
        external_run_id: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    })
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row =
        sqlx::query_as::<_, JobRow>(&format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|r| r.into()))
}

/// Guarded status transition.
///
/// Moves the job to `next` only if its current status is one of `from`;
/// returns whether a row changed. Start/completion timestamps follow the
/// status: entering InProgress stamps started_at, entering a terminal state
/// stamps completed_at.
pub async fn transition(
    pool: &PgPool,
    job_id: Uuid,
    from: &[JobStatus],
    next: JobStatus,
    message: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let from_strs: Vec<&str> = from.iter().map(|s| status_to_string(*s)).collect();

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1,
            message = COALESCE($2, message),
            started_at = CASE WHEN $1 = 'in-progress' THEN now() ELSE started_at END,
            completed_at = CASE WHEN $3 THEN now() ELSE completed_at END
        WHERE id = $4 AND status = ANY($5)
        "#,
    )
    .bind(status_to_string(next))
    .bind(message)
    .bind(next.is_terminal())
    .bind(job_id)
    .bind(&from_strs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_external_run_id(
    pool: &PgPool,
    job_id: Uuid,
    external_run_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET external_run_id = $1 WHERE id = $2")
        .bind(external_run_id)
        .bind(job_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Cancel every still-Pending job of a release target.
///
/// Runs synchronously before a new dispatch so the at-most-one-pending
/// invariant holds. Returns the number of jobs cancelled.
pub async fn cancel_pending_for_target(
    pool: &PgPool,
    release_target_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'cancelled', message = 'superseded before dispatch', completed_at = now()
        WHERE release_target_id = $1 AND status = 'pending'
        "#,
    )
    .bind(release_target_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// The target's current non-terminal job, if any
pub async fn find_active_for_target(
    pool: &PgPool,
    release_target_id: Uuid,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS} FROM jobs
        WHERE release_target_id = $1 AND status = ANY($2)
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(release_target_id)
    .bind(active_statuses())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn find_latest_for_target(
    pool: &PgPool,
    release_target_id: Uuid,
) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        r#"
        SELECT {SELECT_COLUMNS} FROM jobs
        WHERE release_target_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(release_target_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Whether a release already has a successfully completed job
pub async fn release_succeeded(pool: &PgPool, release_id: Uuid) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE release_id = $1 AND status = 'completed'",
    )
    .bind(release_id)
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Number of dispatches already attempted for a (target, release) pair
pub async fn count_for_release(
    pool: &PgPool,
    release_target_id: Uuid,
    release_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE release_target_id = $1 AND release_id = $2",
    )
    .bind(release_target_id)
    .bind(release_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Non-terminal jobs among release targets matched by a policy, excluding
/// the target currently under evaluation. This is the concurrency rule's
/// sibling count.
pub async fn count_active_sibling_jobs(
    pool: &PgPool,
    policy_id: Uuid,
    exclude_target_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM jobs j
        JOIN policy_release_targets prt ON prt.release_target_id = j.release_target_id
        WHERE prt.policy_id = $1
          AND j.release_target_id <> $2
          AND j.status = ANY($3)
        "#,
    )
    .bind(policy_id)
    .bind(exclude_target_id)
    .bind(active_statuses())
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Versions successfully deployed to the (resource, environment) pair by a
/// dependency deployment. Feeds the release-dependency rule.
pub async fn successful_versions_for_dependency(
    pool: &PgPool,
    resource_id: Uuid,
    environment_id: Uuid,
    deployment_id: Uuid,
) -> Result<Vec<DeploymentVersion>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DependencyVersionRow>(
        r#"
        SELECT v.id, v.deployment_id, v.tag, v.status, v.metadata, v.created_at
        FROM jobs j
        JOIN release_targets t ON t.id = j.release_target_id
        JOIN releases r ON r.id = j.release_id
        JOIN deployment_versions v ON v.id = r.version_id
        WHERE t.resource_id = $1
          AND t.environment_id = $2
          AND t.deployment_id = $3
          AND j.status = 'completed'
        "#,
    )
    .bind(resource_id)
    .bind(environment_id)
    .bind(deployment_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// InProgress jobs whose deployment-configured timeout has elapsed,
/// measured from the job's start time. Consumed by the sweeper only.
pub async fn find_timed_out(pool: &PgPool) -> Result<Vec<Job>, sqlx::Error> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT j.id, j.release_target_id, j.release_id, j.job_agent_id, j.status, j.message,
               j.attempt, j.external_run_id, j.created_at, j.started_at, j.completed_at
        FROM jobs j
        JOIN release_targets t ON t.id = j.release_target_id
        JOIN deployments d ON d.id = t.deployment_id
        WHERE j.status = 'in-progress'
          AND j.started_at IS NOT NULL
          AND d.job_timeout_seconds IS NOT NULL
          AND j.started_at + make_interval(secs => d.job_timeout_seconds::double precision) < now()
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn active_statuses() -> Vec<&'static str> {
    vec!["pending", "action-required", "in-progress"]
}

pub fn status_to_string(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::ActionRequired => "action-required",
        JobStatus::InProgress => "in-progress",
        JobStatus::Completed => "completed",
        JobStatus::Failure => "failure",
        JobStatus::Cancelled => "cancelled",
        JobStatus::InvalidJobAgent => "invalid-job-agent",
        JobStatus::InvalidIntegration => "invalid-integration",
        JobStatus::ExternalRunNotFound => "external-run-not-found",
    }
}

pub fn string_to_status(s: &str) -> JobStatus {
    match s {
        "pending" => JobStatus::Pending,
        "action-required" => JobStatus::ActionRequired,
        "in-progress" => JobStatus::InProgress,
        "completed" => JobStatus::Completed,
        "failure" => JobStatus::Failure,
        "cancelled" => JobStatus::Cancelled,
        "invalid-job-agent" => JobStatus::InvalidJobAgent,
        "invalid-integration" => JobStatus::InvalidIntegration,
        "external-run-not-found" => JobStatus::ExternalRunNotFound,
        _ => JobStatus::Pending,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    release_target_id: Uuid,
    release_id: Uuid,
    job_agent_id: Option<Uuid>,
    status: String,
    message: Option<String>,
    attempt: i32,
    external_run_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            release_target_id: row.release_target_id,
            release_id: row.release_id,
            job_agent_id: row.job_agent_id,
            status: string_to_status(&row.status),
            message: row.message,
            attempt: row.attempt,
            external_run_id: row.external_run_id,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DependencyVersionRow {
    id: Uuid,
    deployment_id: Uuid,
    tag: String,
    status: String,
    metadata: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<DependencyVersionRow> for DeploymentVersion {
    fn from(row: DependencyVersionRow) -> Self {
        DeploymentVersion {
            id: row.id,
            deployment_id: row.deployment_id,
            tag: row.tag,
            status: match row.status.as_str() {
                "ready" => pennant_core::domain::entity::VersionStatus::Ready,
                "building" => pennant_core::domain::entity::VersionStatus::Building,
                "failed" => pennant_core::domain::entity::VersionStatus::Failed,
                "rejected" => pennant_core::domain::entity::VersionStatus::Rejected,
                _ => pennant_core::domain::entity::VersionStatus::Building,
            },
            metadata: serde_json::from_value(row.metadata).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}
