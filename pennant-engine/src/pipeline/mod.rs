//! Policy Pipeline
//!
//! Narrows a newest-first candidate list down to zero-or-one dispatchable
//! release for a target. Rules apply in a fixed kind order, independent of
//! policy priority; within one kind the rule from the highest-priority
//! matching policy wins. The first rule to empty the candidate set
//! short-circuits the rest and its reason is surfaced to the caller.
//!
//! A rule whose data lookup fails degrades to "no opinion" with a warning;
//! the evaluation as a whole fails only when every lookup path failed.

mod context;

pub use context::{PgPipelineContext, PipelineContext};

use pennant_core::condition::Condition;
use pennant_core::domain::entity::DeploymentVersion;
use pennant_core::domain::policy::{Policy, PolicyRule, Recurrence, deny_window_brackets};
use pennant_core::domain::release::Release;
use pennant_core::domain::target::ReleaseTarget;
use pennant_core::rollout;
use uuid::Uuid;

use crate::error::{EngineError, Result};

pub const REASON_NO_VERSION: &str = "no version satisfies version selector";
pub const REASON_DENY_WINDOW: &str = "deny window active";
pub const REASON_DEPENDENCY: &str = "release dependency not satisfied";
pub const REASON_ROLLOUT: &str = "rollout window not reached";
pub const REASON_APPROVAL: &str = "awaiting approval";
pub const REASON_CONCURRENCY: &str = "concurrency limit reached";

/// One dispatchable (version, release) pair under consideration
#[derive(Debug, Clone)]
pub struct Candidate {
    pub version: DeploymentVersion,
    pub release: Release,
}

/// Outcome of a pipeline evaluation
#[derive(Debug, Clone)]
pub struct Decision {
    pub release: Option<Release>,
    /// Why the candidate set emptied, when it did.
    pub reason: Option<String>,
    /// Rules that degraded to "no opinion" during this evaluation.
    pub warnings: Vec<String>,
}

impl Decision {
    fn rejected(reason: &str, warnings: Vec<String>) -> Self {
        Self {
            release: None,
            reason: Some(reason.to_string()),
            warnings,
        }
    }
}

/// Select the release to dispatch for `target`, if any.
///
/// `policies` are the target's matched policies; `candidates` arrive
/// newest-version-first (re-sorted here for determinism).
pub async fn select(
    target: &ReleaseTarget,
    policies: &[Policy],
    mut candidates: Vec<Candidate>,
    ctx: &dyn PipelineContext,
) -> Result<Decision> {
    sort_newest_first(&mut candidates);

    let rules = RuleSet::winning(policies);
    let mut warnings = Vec::new();
    let mut lookups = LookupStats::default();

    // 1. Version selector
    if let Some(condition) = &rules.version_selector {
        candidates.retain(|c| condition.matches(&c.version));
        if candidates.is_empty() {
            return Ok(Decision::rejected(REASON_NO_VERSION, warnings));
        }
    }

    // 2. Deny windows: any active window across matched policies blocks all
    // candidates.
    let now = ctx.now();
    for window in &rules.deny_windows {
        if deny_window_brackets(
            window.start,
            window.end,
            window.recurrence,
            window.timezone_offset_minutes,
            now,
        ) {
            return Ok(Decision::rejected(REASON_DENY_WINDOW, warnings));
        }
    }

    // 3. Release dependencies
    for dependency in &rules.dependencies {
        let versions = match ctx
            .successful_dependency_versions(
                target.resource_id,
                target.environment_id,
                dependency.deployment_id,
            )
            .await
        {
            Ok(versions) => {
                lookups.succeeded += 1;
                versions
            }
            Err(e) => {
                lookups.failed += 1;
                warnings.push(format!("release-dependency degraded: {}", e));
                continue;
            }
        };

        let satisfied = versions.iter().any(|v| {
            dependency
                .version_selector
                .as_ref()
                .map_or(true, |selector| selector.matches(v))
        });
        if !satisfied {
            return Ok(Decision::rejected(REASON_DEPENDENCY, warnings));
        }
    }

    // 4. Gradual rollout: deterministic per (target, version) session.
    if let Some(window_minutes) = rules.rollout_window_minutes {
        let window = chrono::Duration::minutes(window_minutes);
        candidates.retain(|c| {
            let session = format!("{}:{}", target.key(), c.version.id);
            rollout::is_admitted(&session, c.version.created_at, window, now)
        });
        if candidates.is_empty() {
            return Ok(Decision::rejected(REASON_ROLLOUT, warnings));
        }
    }

    // 5. Approvals: recorded externally, only looked up here.
    if rules.requires_approvals() {
        let mut passing = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match ctx.approvals(target.id, candidate.version.id).await {
                Ok(summary) => {
                    lookups.succeeded += 1;
                    if rules.approvals_satisfied(&summary) {
                        passing.push(candidate);
                    }
                }
                Err(e) => {
                    lookups.failed += 1;
                    warnings.push(format!("approval lookup degraded: {}", e));
                    // No opinion: the candidate stays.
                    passing.push(candidate);
                }
            }
        }
        candidates = passing;
        if candidates.is_empty() {
            return Ok(Decision::rejected(REASON_APPROVAL, warnings));
        }
    }

    // 6. Concurrency: count non-terminal jobs among the policy's sibling
    // targets.
    if let Some((policy_id, limit)) = rules.concurrency {
        match ctx.active_sibling_jobs(policy_id, target.id).await {
            Ok(active) => {
                lookups.succeeded += 1;
                if active >= limit {
                    return Ok(Decision::rejected(REASON_CONCURRENCY, warnings));
                }
            }
            Err(e) => {
                lookups.failed += 1;
                warnings.push(format!("concurrency degraded: {}", e));
            }
        }
    }

    if lookups.all_failed() {
        return Err(EngineError::EvaluationFailed(format!(
            "all {} rule lookups failed",
            lookups.failed
        )));
    }

    let selected = candidates.into_iter().next().map(|c| c.release);
    Ok(Decision {
        release: selected,
        reason: None,
        warnings,
    })
}

/// Highest-priority retry budget among matched policies, consumed by the
/// dispatch worker and the timeout sweeper.
pub fn retry_max(policies: &[Policy]) -> Option<i32> {
    sorted_by_priority(policies)
        .into_iter()
        .find_map(|policy| {
            policy.rules.iter().find_map(|rule| match rule {
                PolicyRule::Retry { max_retries } => Some(*max_retries),
                _ => None,
            })
        })
}

/// Newest version first; ties broken by release recency, then id, so the
/// selection is fully deterministic.
fn sort_newest_first(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.version
            .created_at
            .cmp(&a.version.created_at)
            .then_with(|| b.release.created_at.cmp(&a.release.created_at))
            .then_with(|| b.release.id.cmp(&a.release.id))
    });
}

fn sorted_by_priority(policies: &[Policy]) -> Vec<&Policy> {
    let mut sorted: Vec<&Policy> = policies.iter().collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
    sorted
}

#[derive(Default)]
struct LookupStats {
    succeeded: u32,
    failed: u32,
}

impl LookupStats {
    fn all_failed(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

#[derive(Debug)]
struct DenyWindowSpec {
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
    recurrence: Option<Recurrence>,
    timezone_offset_minutes: i32,
}

#[derive(Debug)]
struct DependencySpec {
    deployment_id: Uuid,
    version_selector: Option<Condition>,
}

/// The rules that apply to one evaluation after conflict resolution.
///
/// Deny windows and dependencies aggregate across policies (any of them can
/// block); the other kinds resolve to the rule from the highest-priority
/// policy defining them, with equal-priority concurrency conflicts resolved
/// to the stricter limit.
struct RuleSet {
    version_selector: Option<Condition>,
    deny_windows: Vec<DenyWindowSpec>,
    dependencies: Vec<DependencySpec>,
    rollout_window_minutes: Option<i64>,
    any_approval_min: Option<i64>,
    user_approval: Option<Uuid>,
    role_approval: Option<(Uuid, i64)>,
    concurrency: Option<(Uuid, i64)>,
}

impl RuleSet {
    fn winning(policies: &[Policy]) -> Self {
        let sorted = sorted_by_priority(policies);

        let mut set = RuleSet {
            version_selector: None,
            deny_windows: Vec::new(),
            dependencies: Vec::new(),
            rollout_window_minutes: None,
            any_approval_min: None,
            user_approval: None,
            role_approval: None,
            concurrency: None,
        };
        let mut concurrency_priority = i32::MIN;

        for policy in sorted {
            for rule in &policy.rules {
                match rule {
                    PolicyRule::VersionSelector { condition } => {
                        if set.version_selector.is_none() {
                            set.version_selector = Some(condition.clone());
                        }
                    }
                    PolicyRule::DenyWindow {
                        start,
                        end,
                        recurrence,
                        timezone_offset_minutes,
                    } => set.deny_windows.push(DenyWindowSpec {
                        start: *start,
                        end: *end,
                        recurrence: *recurrence,
                        timezone_offset_minutes: *timezone_offset_minutes,
                    }),
                    PolicyRule::ReleaseDependency {
                        deployment_id,
                        version_selector,
                    } => set.dependencies.push(DependencySpec {
                        deployment_id: *deployment_id,
                        version_selector: version_selector.clone(),
                    }),
                    PolicyRule::GradualRollout { window_minutes } => {
                        if set.rollout_window_minutes.is_none() {
                            set.rollout_window_minutes = Some(*window_minutes);
                        }
                    }
                    PolicyRule::AnyApproval { min_approvals } => {
                        if set.any_approval_min.is_none() {
                            set.any_approval_min = Some(*min_approvals);
                        }
                    }
                    PolicyRule::UserApproval { user_id } => {
                        if set.user_approval.is_none() {
                            set.user_approval = Some(*user_id);
                        }
                    }
                    PolicyRule::RoleApproval {
                        role_id,
                        min_approvals,
                    } => {
                        if set.role_approval.is_none() {
                            set.role_approval = Some((*role_id, *min_approvals));
                        }
                    }
                    PolicyRule::Concurrency { limit } => match set.concurrency {
                        None => {
                            set.concurrency = Some((policy.id, *limit));
                            concurrency_priority = policy.priority;
                        }
                        // Same priority tier: the stricter limit wins.
                        Some((_, current))
                            if policy.priority == concurrency_priority && *limit < current =>
                        {
                            set.concurrency = Some((policy.id, *limit));
                        }
                        Some(_) => {}
                    },
                    PolicyRule::Retry { .. } => {}
                }
            }
        }

        set
    }

    fn requires_approvals(&self) -> bool {
        self.any_approval_min.is_some()
            || self.user_approval.is_some()
            || self.role_approval.is_some()
    }

    fn approvals_satisfied(&self, summary: &crate::repository::approval::ApprovalSummary) -> bool {
        if summary.rejections > 0 {
            return false;
        }
        if let Some(min) = self.any_approval_min {
            if summary.approval_count() < min {
                return false;
            }
        }
        if let Some(user_id) = self.user_approval {
            if !summary.approved_by(user_id) {
                return false;
            }
        }
        if let Some((role_id, min)) = self.role_approval {
            if summary.role_approval_count(role_id) < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests;
