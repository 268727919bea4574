//! Pipeline data lookups
//!
//! Every rule that needs state beyond its own configuration reads it through
//! this trait, so rule evaluation is testable without a store and a single
//! failing lookup can degrade to "no opinion" instead of failing the whole
//! evaluation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pennant_core::domain::entity::DeploymentVersion;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::approval::ApprovalSummary;
use crate::repository::{approval_repository, job_repository};

/// State the policy rules read during one evaluation
#[async_trait]
pub trait PipelineContext: Send + Sync {
    /// "Now" for deny-window and rollout math; injectable for tests.
    fn now(&self) -> DateTime<Utc>;

    /// Non-terminal jobs among the targets sharing `policy_id`, excluding
    /// the target under evaluation.
    async fn active_sibling_jobs(&self, policy_id: Uuid, exclude_target_id: Uuid) -> Result<i64>;

    /// Versions a dependency deployment has successfully completed on the
    /// same (resource, environment) pair.
    async fn successful_dependency_versions(
        &self,
        resource_id: Uuid,
        environment_id: Uuid,
        deployment_id: Uuid,
    ) -> Result<Vec<DeploymentVersion>>;

    /// Approval records for the (target, version) pair.
    async fn approvals(
        &self,
        release_target_id: Uuid,
        version_id: Uuid,
    ) -> Result<ApprovalSummary>;
}

/// Store-backed context used by the dispatch worker
pub struct PgPipelineContext {
    pool: PgPool,
}

impl PgPipelineContext {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineContext for PgPipelineContext {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn active_sibling_jobs(&self, policy_id: Uuid, exclude_target_id: Uuid) -> Result<i64> {
        Ok(job_repository::count_active_sibling_jobs(&self.pool, policy_id, exclude_target_id)
            .await?)
    }

    async fn successful_dependency_versions(
        &self,
        resource_id: Uuid,
        environment_id: Uuid,
        deployment_id: Uuid,
    ) -> Result<Vec<DeploymentVersion>> {
        Ok(job_repository::successful_versions_for_dependency(
            &self.pool,
            resource_id,
            environment_id,
            deployment_id,
        )
        .await?)
    }

    async fn approvals(
        &self,
        release_target_id: Uuid,
        version_id: Uuid,
    ) -> Result<ApprovalSummary> {
        Ok(approval_repository::summarize(&self.pool, release_target_id, version_id).await?)
    }
}
