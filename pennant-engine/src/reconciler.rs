//! Selector Reconciler
//!
//! Keeps the computed match tables consistent with current selector
//! definitions and entity sets, then derives the release-target set from the
//! refreshed matches. Each run covers one bounded scope and holds that
//! scope's mutex, so recomputations of the same scope never interleave;
//! the row replacement itself is transactional, so readers never observe a
//! partial match set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use pennant_core::condition::Condition;
use pennant_core::domain::entity::{Deployment, Environment, Resource, System};
use pennant_core::domain::policy::PolicyTarget;
use pennant_core::domain::target::ReleaseTarget;
use pennant_core::workitem::WorkItemKind;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lock::{LockService, acquire_blocking};
use crate::queue::WorkQueue;
use crate::repository::{
    entity_repository, match_repository, policy_repository, target_repository,
};

/// What one reconciliation run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope {
    Resource(Uuid),
    Environment(Uuid),
    Deployment(Uuid),
    Policy(Uuid),
    /// Fans out to per-entity scopes through the queue; holds no lock itself.
    Workspace(Uuid),
}

impl ReconcileScope {
    /// Mutex name; disjoint from the `target:` key space used for dispatch.
    pub fn lock_key(&self) -> String {
        match self {
            ReconcileScope::Resource(id) => format!("reconcile:resource:{}", id),
            ReconcileScope::Environment(id) => format!("reconcile:environment:{}", id),
            ReconcileScope::Deployment(id) => format!("reconcile:deployment:{}", id),
            ReconcileScope::Policy(id) => format!("reconcile:policy:{}", id),
            ReconcileScope::Workspace(id) => format!("reconcile:workspace:{}", id),
        }
    }
}

pub struct SelectorReconciler {
    pool: PgPool,
    queue: Arc<dyn WorkQueue>,
    locks: Arc<dyn LockService>,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl SelectorReconciler {
    pub fn new(
        pool: PgPool,
        queue: Arc<dyn WorkQueue>,
        locks: Arc<dyn LockService>,
        lock_ttl: Duration,
        lock_wait: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            locks,
            lock_ttl,
            lock_wait,
        }
    }

    /// Run one reconciliation under the scope's mutex.
    ///
    /// Failing to acquire the lock within the bounded wait surfaces as the
    /// retryable [`EngineError::LockBusy`].
    pub async fn run(&self, scope: ReconcileScope) -> Result<()> {
        if let ReconcileScope::Workspace(workspace_id) = scope {
            return self.fan_out_workspace(workspace_id).await;
        }

        let key = scope.lock_key();
        let token =
            acquire_blocking(self.locks.as_ref(), &key, self.lock_ttl, self.lock_wait).await?;

        let result = match scope {
            ReconcileScope::Resource(id) => self.reconcile_resource(id).await,
            ReconcileScope::Environment(id) => self.reconcile_environment(id).await,
            ReconcileScope::Deployment(id) => self.reconcile_deployment(id).await,
            ReconcileScope::Policy(id) => self.reconcile_policy(id).await,
            ReconcileScope::Workspace(_) => unreachable!("handled above"),
        };

        if let Err(e) = self.locks.release(&token).await {
            tracing::warn!("Failed to release reconcile lock {}: {}", key, e);
        }

        result
    }

    /// Workspace-wide reconciliation enqueues one scoped item per entity so
    /// each runs under its own mutex; the queue suppresses duplicates.
    async fn fan_out_workspace(&self, workspace_id: Uuid) -> Result<()> {
        for environment in entity_repository::list_environments(&self.pool, workspace_id).await? {
            self.queue
                .enqueue(WorkItemKind::EnvironmentChanged, environment.id, workspace_id)
                .await?;
        }
        for deployment in entity_repository::list_deployments(&self.pool, workspace_id).await? {
            self.queue
                .enqueue(WorkItemKind::DeploymentChanged, deployment.id, workspace_id)
                .await?;
        }
        for policy in policy_repository::list_for_workspace(&self.pool, workspace_id).await? {
            self.queue
                .enqueue(WorkItemKind::PolicyChanged, policy.id, workspace_id)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_environment(&self, environment_id: Uuid) -> Result<()> {
        let environment = entity_repository::find_environment(&self.pool, environment_id)
            .await?
            .ok_or(EngineError::missing("environment", environment_id))?;
        let system = entity_repository::find_system(&self.pool, environment.system_id)
            .await?
            .ok_or(EngineError::missing("system", environment.system_id))?;

        let resources = entity_repository::list_resources(&self.pool, system.workspace_id).await?;
        let matched =
            matching_resource_ids(environment.resource_selector.as_ref(), &resources, false);
        match_repository::replace_environment_matches(&self.pool, environment.id, &matched).await?;

        tracing::info!(
            "Environment {} matches {} of {} resources",
            environment.id,
            matched.len(),
            resources.len()
        );

        self.sync_targets_for_environment(&environment, &system).await
    }

    async fn reconcile_deployment(&self, deployment_id: Uuid) -> Result<()> {
        let deployment = entity_repository::find_deployment(&self.pool, deployment_id)
            .await?
            .ok_or(EngineError::missing("deployment", deployment_id))?;
        let system = entity_repository::find_system(&self.pool, deployment.system_id)
            .await?
            .ok_or(EngineError::missing("system", deployment.system_id))?;

        let resources = entity_repository::list_resources(&self.pool, system.workspace_id).await?;
        let matched =
            matching_resource_ids(deployment.resource_selector.as_ref(), &resources, true);
        match_repository::replace_deployment_matches(&self.pool, deployment.id, &matched).await?;

        // The deployment's membership feeds every environment of its system.
        for environment in
            entity_repository::list_environments_for_system(&self.pool, system.id).await?
        {
            self.sync_targets_for_environment(&environment, &system).await?;
        }
        Ok(())
    }

    async fn reconcile_resource(&self, resource_id: Uuid) -> Result<()> {
        let resource = entity_repository::find_resource(&self.pool, resource_id)
            .await?
            .ok_or(EngineError::missing("resource", resource_id))?;

        let environments =
            entity_repository::list_environments(&self.pool, resource.workspace_id).await?;
        let deployments =
            entity_repository::list_deployments(&self.pool, resource.workspace_id).await?;

        let matched_environments: Vec<Uuid> = environments
            .iter()
            .filter(|e| selector_admits(e.resource_selector.as_ref(), &resource, false))
            .map(|e| e.id)
            .collect();
        let matched_deployments: Vec<Uuid> = deployments
            .iter()
            .filter(|d| selector_admits(d.resource_selector.as_ref(), &resource, true))
            .map(|d| d.id)
            .collect();

        match_repository::replace_resource_matches(
            &self.pool,
            resource.id,
            &matched_environments,
            &matched_deployments,
        )
        .await?;

        // Re-derive targets for every environment the resource could join or
        // leave.
        let mut systems: HashMap<Uuid, System> = HashMap::new();
        for environment in &environments {
            let system = match systems.get(&environment.system_id) {
                Some(system) => system.clone(),
                None => {
                    let system =
                        entity_repository::find_system(&self.pool, environment.system_id)
                            .await?
                            .ok_or(EngineError::missing("system", environment.system_id))?;
                    systems.insert(system.id, system.clone());
                    system
                }
            };
            self.sync_targets_for_environment(environment, &system).await?;
        }
        Ok(())
    }

    async fn reconcile_policy(&self, policy_id: Uuid) -> Result<()> {
        let policy = policy_repository::find_by_id(&self.pool, policy_id)
            .await?
            .ok_or(EngineError::missing("policy", policy_id))?;
        let policy_targets =
            policy_repository::list_targets_for_policy(&self.pool, policy_id).await?;

        let release_targets =
            target_repository::list_for_workspace(&self.pool, policy.workspace_id).await?;
        let resources = index_by_id(
            entity_repository::list_resources(&self.pool, policy.workspace_id).await?,
            |r: &Resource| r.id,
        );
        let environments = index_by_id(
            entity_repository::list_environments(&self.pool, policy.workspace_id).await?,
            |e: &Environment| e.id,
        );
        let deployments = index_by_id(
            entity_repository::list_deployments(&self.pool, policy.workspace_id).await?,
            |d: &Deployment| d.id,
        );

        let previous: HashSet<Uuid> =
            match_repository::policy_target_ids(&self.pool, policy_id)
                .await?
                .into_iter()
                .collect();

        let mut rows = Vec::new();
        let mut current = HashSet::new();
        for target in &release_targets {
            let (Some(resource), Some(environment), Some(deployment)) = (
                resources.get(&target.resource_id),
                environments.get(&target.environment_id),
                deployments.get(&target.deployment_id),
            ) else {
                continue;
            };
            for policy_target in &policy_targets {
                if policy_target_matches(policy_target, resource, environment, deployment) {
                    rows.push((policy_target.id, target.id));
                    current.insert(target.id);
                }
            }
        }

        match_repository::replace_policy_matches(&self.pool, policy_id, &rows).await?;

        // Targets entering or leaving the policy need a fresh decision.
        for target in &release_targets {
            if previous.contains(&target.id) != current.contains(&target.id) {
                self.queue
                    .enqueue(
                        WorkItemKind::EvaluateReleaseTarget,
                        target.id,
                        target.workspace_id,
                    )
                    .await?;
            }
        }

        tracing::info!(
            "Policy {} matches {} release targets",
            policy_id,
            current.len()
        );
        Ok(())
    }

    /// Intersect the environment's and each deployment's matched resources,
    /// upsert the resulting targets, retire the rest, and queue evaluations.
    async fn sync_targets_for_environment(
        &self,
        environment: &Environment,
        system: &System,
    ) -> Result<()> {
        let environment_resources =
            match_repository::environment_resource_ids(&self.pool, environment.id).await?;
        let deployments =
            entity_repository::list_deployments_for_system(&self.pool, system.id).await?;

        let mut kept = Vec::new();
        let mut created_or_kept_targets = Vec::new();
        for deployment in &deployments {
            let deployment_resources =
                match_repository::deployment_resource_ids(&self.pool, deployment.id).await?;
            for resource_id in
                derive_target_resources(&environment_resources, &deployment_resources)
            {
                let (target, created) = target_repository::upsert(
                    &self.pool,
                    system.workspace_id,
                    resource_id,
                    environment.id,
                    deployment.id,
                )
                .await?;
                kept.push(target.id);
                created_or_kept_targets.push((target, created));
            }
        }

        let retired = target_repository::retire_except(&self.pool, environment.id, &kept).await?;
        if !retired.is_empty() {
            tracing::info!(
                "Retired {} release targets in environment {}",
                retired.len(),
                environment.id
            );
        }

        // Gate new targets by their policies before the first evaluation.
        let new_targets: Vec<&ReleaseTarget> = created_or_kept_targets
            .iter()
            .filter(|(_, created)| *created)
            .map(|(target, _)| target)
            .collect();
        if !new_targets.is_empty() {
            self.sync_policies_for_new_targets(system.workspace_id, &new_targets)
                .await?;
        }

        for (target, _) in &created_or_kept_targets {
            self.queue
                .enqueue(
                    WorkItemKind::EvaluateReleaseTarget,
                    target.id,
                    target.workspace_id,
                )
                .await?;
        }
        Ok(())
    }

    async fn sync_policies_for_new_targets(
        &self,
        workspace_id: Uuid,
        targets: &[&ReleaseTarget],
    ) -> Result<()> {
        let policy_targets =
            policy_repository::list_targets_for_workspace(&self.pool, workspace_id).await?;
        if policy_targets.is_empty() {
            return Ok(());
        }

        let resources = index_by_id(
            entity_repository::list_resources(&self.pool, workspace_id).await?,
            |r: &Resource| r.id,
        );
        let environments = index_by_id(
            entity_repository::list_environments(&self.pool, workspace_id).await?,
            |e: &Environment| e.id,
        );
        let deployments = index_by_id(
            entity_repository::list_deployments(&self.pool, workspace_id).await?,
            |d: &Deployment| d.id,
        );

        let mut rows = Vec::new();
        let target_ids: Vec<Uuid> = targets.iter().map(|t| t.id).collect();
        for target in targets {
            let (Some(resource), Some(environment), Some(deployment)) = (
                resources.get(&target.resource_id),
                environments.get(&target.environment_id),
                deployments.get(&target.deployment_id),
            ) else {
                continue;
            };
            for policy_target in &policy_targets {
                if policy_target_matches(policy_target, resource, environment, deployment) {
                    rows.push((policy_target.id, policy_target.policy_id, target.id));
                }
            }
        }

        match_repository::replace_matches_for_targets(&self.pool, &target_ids, &rows).await?;
        Ok(())
    }
}

// =============================================================================
// Pure match derivation
// =============================================================================

/// Resource ids admitted by a selector.
///
/// `match_all_when_unset` distinguishes deployments (no selector applies to
/// every resource) from environments (no selector brings in none).
pub fn matching_resource_ids(
    selector: Option<&Condition>,
    resources: &[Resource],
    match_all_when_unset: bool,
) -> Vec<Uuid> {
    resources
        .iter()
        .filter(|r| selector_admits(selector, r, match_all_when_unset))
        .map(|r| r.id)
        .collect()
}

fn selector_admits(
    selector: Option<&Condition>,
    resource: &Resource,
    match_all_when_unset: bool,
) -> bool {
    match selector {
        Some(condition) => condition.matches(resource),
        None => match_all_when_unset,
    }
}

/// Intersection of an environment's and a deployment's resource sets, in the
/// environment set's order.
pub fn derive_target_resources(
    environment_resources: &[Uuid],
    deployment_resources: &[Uuid],
) -> Vec<Uuid> {
    let deployment_set: HashSet<&Uuid> = deployment_resources.iter().collect();
    environment_resources
        .iter()
        .filter(|id| deployment_set.contains(id))
        .copied()
        .collect()
}

/// Whether one policy selector triple matches a target's entity triple.
///
/// All selectors are optional and ANDed; a null selector passes.
pub fn policy_target_matches(
    policy_target: &PolicyTarget,
    resource: &Resource,
    environment: &Environment,
    deployment: &Deployment,
) -> bool {
    policy_target
        .deployment_selector
        .as_ref()
        .map_or(true, |s| s.matches(deployment))
        && policy_target
            .environment_selector
            .as_ref()
            .map_or(true, |s| s.matches(environment))
        && policy_target
            .resource_selector
            .as_ref()
            .map_or(true, |s| s.matches(resource))
}

fn index_by_id<T, F: Fn(&T) -> Uuid>(items: Vec<T>, key: F) -> HashMap<Uuid, T> {
    items.into_iter().map(|item| (key(&item), item)).collect()
}
