//! Dispatch worker
//!
//! Workers pull work items from the shared queue: change items route to the
//! selector reconciler, evaluate items run the policy pipeline under the
//! target's mutex. Items for different targets run in parallel across the
//! pool; items for the same target serialize on the lock. Transient failures
//! re-queue the item; data-integrity failures drop it.

use std::sync::Arc;

use pennant_core::domain::job::JobStatus;
use pennant_core::workitem::{WorkItem, WorkItemKind};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::JobDispatcher;
use crate::error::{EngineError, Result};
use crate::lock::{LockService, acquire_blocking};
use crate::pipeline::{self, Candidate, PgPipelineContext};
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileScope, SelectorReconciler};
use crate::release as release_manager;
use crate::repository::{
    entity_repository, job_repository, policy_repository, target_repository,
};

pub struct DispatchWorker {
    pool: PgPool,
    queue: Arc<dyn WorkQueue>,
    locks: Arc<dyn LockService>,
    dispatcher: Arc<dyn JobDispatcher>,
    reconciler: Arc<SelectorReconciler>,
    config: EngineConfig,
}

impl DispatchWorker {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn WorkQueue>,
        locks: Arc<dyn LockService>,
        dispatcher: Arc<dyn JobDispatcher>,
        reconciler: Arc<SelectorReconciler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            locks,
            dispatcher,
            reconciler,
            config,
        }
    }

    /// Claim-and-process loop; runs until the task is dropped.
    pub async fn run(&self, worker_id: usize) {
        info!("Dispatch worker {} started", worker_id);

        loop {
            let items = match self.queue.claim(self.config.claim_batch_size).await {
                Ok(items) => items,
                Err(e) => {
                    error!("Worker {} failed to claim work items: {}", worker_id, e);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if items.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            debug!("Worker {} claimed {} item(s)", worker_id, items.len());

            for item in items {
                self.handle_item(item).await;
            }
        }
    }

    async fn handle_item(&self, item: WorkItem) {
        let outcome = self.process(&item).await;

        match outcome {
            Ok(()) => {
                if let Err(e) = self.queue.complete(item.id).await {
                    error!("Failed to complete work item {}: {}", item.id, e);
                }
            }
            Err(e) if e.is_transient() => {
                warn!(
                    "Transient failure on {:?} {}: {}; re-queueing",
                    item.kind, item.subject_id, e
                );
                if let Err(e) = self.queue.release(item.id).await {
                    error!("Failed to re-queue work item {}: {}", item.id, e);
                }
            }
            Err(e) => {
                // Retrying cannot help without the missing row reappearing.
                error!(
                    "Dropping {:?} {} after non-retryable failure: {}",
                    item.kind, item.subject_id, e
                );
                if let Err(e) = self.queue.complete(item.id).await {
                    error!("Failed to drop work item {}: {}", item.id, e);
                }
            }
        }
    }

    async fn process(&self, item: &WorkItem) -> Result<()> {
        match item.kind {
            WorkItemKind::ResourceChanged => {
                self.reconciler
                    .run(ReconcileScope::Resource(item.subject_id))
                    .await
            }
            WorkItemKind::EnvironmentChanged => {
                self.reconciler
                    .run(ReconcileScope::Environment(item.subject_id))
                    .await
            }
            WorkItemKind::DeploymentChanged => {
                self.reconciler
                    .run(ReconcileScope::Deployment(item.subject_id))
                    .await
            }
            WorkItemKind::PolicyChanged => {
                self.reconciler
                    .run(ReconcileScope::Policy(item.subject_id))
                    .await
            }
            WorkItemKind::EvaluateReleaseTarget => self.evaluate_target(item.subject_id).await,
        }
    }

    /// Evaluate one release target under its dispatch mutex.
    ///
    /// The lock is released on every exit path; a crash mid-operation is
    /// covered by the lock TTL and the idempotency of each step.
    async fn evaluate_target(&self, target_id: uuid::Uuid) -> Result<()> {
        let target = target_repository::find_by_id(&self.pool, target_id)
            .await?
            .ok_or(EngineError::missing("release_target", target_id))?;

        let key = format!("target:{}", target.key());
        let token = acquire_blocking(
            self.locks.as_ref(),
            &key,
            self.config.lock_ttl,
            self.config.lock_acquire_timeout,
        )
        .await?;

        let result = self.evaluate_locked(&target).await;

        if let Err(e) = self.locks.release(&token).await {
            warn!("Failed to release dispatch lock {}: {}", key, e);
        }

        result
    }

    async fn evaluate_locked(
        &self,
        target: &pennant_core::domain::target::ReleaseTarget,
    ) -> Result<()> {
        // Always re-read current state; the work item only says "look again".
        let deployment = entity_repository::find_deployment(&self.pool, target.deployment_id)
            .await?
            .ok_or(EngineError::missing("deployment", target.deployment_id))?;
        let policies = policy_repository::list_matching_target(&self.pool, target.id).await?;
        let versions = entity_repository::list_ready_versions(
            &self.pool,
            deployment.id,
            self.config.candidate_window,
        )
        .await?;
        let variables =
            entity_repository::deployment_variables(&self.pool, deployment.id).await?;

        let mut candidates = Vec::with_capacity(versions.len());
        for version in versions {
            let release =
                release_manager::ensure_release(&self.pool, target.id, version.id, &variables)
                    .await?;
            candidates.push(Candidate { version, release });
        }

        let ctx = PgPipelineContext::new(self.pool.clone());
        let decision = pipeline::select(target, &policies, candidates, &ctx).await?;

        for warning in &decision.warnings {
            warn!("Target {}: {}", target.key(), warning);
        }
        target_repository::record_decision(&self.pool, target.id, decision.reason.as_deref())
            .await?;

        let Some(release) = decision.release else {
            if let Some(reason) = &decision.reason {
                info!("Target {} held: {}", target.key(), reason);
            }
            return Ok(());
        };

        release_manager::mark_desired(&self.pool, target.id, release.id).await?;

        if release_manager::is_satisfied(&self.pool, release.id).await? {
            debug!("Target {} already runs release {}", target.key(), release.id);
            return Ok(());
        }

        // At-most-one non-terminal job per target: cancel a superseded
        // pending job synchronously, wait out anything already running.
        if let Some(active) = job_repository::find_active_for_target(&self.pool, target.id).await? {
            if active.release_id == release.id {
                debug!(
                    "Target {} already has job {} for release {}",
                    target.key(),
                    active.id,
                    release.id
                );
                return Ok(());
            }
            if active.status == JobStatus::Pending {
                let cancelled =
                    job_repository::cancel_pending_for_target(&self.pool, target.id).await?;
                info!(
                    "Cancelled {} pending job(s) on target {} superseded by release {}",
                    cancelled,
                    target.key(),
                    release.id
                );
            } else {
                info!(
                    "Target {} busy with job {} ({:?}); deferring release {}",
                    target.key(),
                    active.id,
                    active.status,
                    release.id
                );
                return Ok(());
            }
        }

        let attempt = job_repository::count_for_release(&self.pool, target.id, release.id).await?;
        let allowed = 1 + pipeline::retry_max(&policies).unwrap_or(0) as i64;
        if attempt >= allowed {
            target_repository::record_decision(&self.pool, target.id, Some("retry limit reached"))
                .await?;
            info!(
                "Target {} exhausted {} attempt(s) for release {}",
                target.key(),
                attempt,
                release.id
            );
            return Ok(());
        }

        let Some(job_agent_id) = deployment.job_agent_id else {
            job_repository::create(
                &self.pool,
                target.id,
                release.id,
                None,
                JobStatus::InvalidJobAgent,
                Some("no job agent configured"),
                attempt as i32,
            )
            .await?;
            warn!(
                "Deployment {} has no job agent; target {} cannot dispatch",
                deployment.id,
                target.key()
            );
            return Ok(());
        };

        let job = job_repository::create(
            &self.pool,
            target.id,
            release.id,
            Some(job_agent_id),
            JobStatus::Pending,
            None,
            attempt as i32,
        )
        .await?;

        match self.dispatcher.dispatch(&job, &release, target).await {
            Ok(()) => {
                job_repository::transition(
                    &self.pool,
                    job.id,
                    &[JobStatus::Pending],
                    JobStatus::InProgress,
                    None,
                )
                .await?;
                info!(
                    "Dispatched job {} for release {} to target {}",
                    job.id,
                    release.id,
                    target.key()
                );
            }
            Err(e) => {
                // Recorded on the job; does not block future evaluations.
                job_repository::transition(
                    &self.pool,
                    job.id,
                    &[JobStatus::Pending],
                    JobStatus::Failure,
                    Some(&e.to_string()),
                )
                .await?;
                error!("Dispatch of job {} failed: {}", job.id, e);
            }
        }

        Ok(())
    }
}
