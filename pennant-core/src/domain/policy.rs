//! Policies and their rule variants
//!
//! A policy attaches to release targets through selector triples and carries
//! an ordered bag of rules. Rules are a closed tagged union; the pipeline
//! dispatches on the `kind` discriminator, never on structure.

use chrono::{DateTime, Duration, FixedOffset, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;

/// An organization-defined deployment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    /// Policies apply in descending priority; ties resolved per rule kind.
    pub priority: i32,
    pub rules: Vec<PolicyRule>,
    pub created_at: DateTime<Utc>,
}

/// Selector triple attaching a policy to a subset of release targets.
///
/// All selectors are optional and ANDed; a target matches the policy when it
/// is matched by every non-null selector of at least one target triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTarget {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub deployment_selector: Option<Condition>,
    pub environment_selector: Option<Condition>,
    pub resource_selector: Option<Condition>,
}

/// Recurrence of a deny window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recurrence {
    Weekly,
    Monthly,
}

/// One rule inside a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PolicyRule {
    /// Cap on concurrent non-terminal jobs across targets sharing the policy
    Concurrency { limit: i64 },
    /// Re-dispatch budget after failed jobs
    Retry { max_retries: i32 },
    /// Require N recorded approvals for the target + version pair
    AnyApproval { min_approvals: i64 },
    /// Require an approval recorded by one specific user
    UserApproval { user_id: Uuid },
    /// Require N approvals recorded by holders of a role
    RoleApproval { role_id: Uuid, min_approvals: i64 },
    /// Block dispatch while "now" falls inside the (recurring) window
    DenyWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        recurrence: Option<Recurrence>,
        #[serde(default)]
        timezone_offset_minutes: i32,
    },
    /// Spread admissions across a time window, deterministically per target
    GradualRollout { window_minutes: i64 },
    /// Keep only candidate versions matching the condition
    VersionSelector { condition: Condition },
    /// Require the dependency deployment to have succeeded on the same
    /// resource + environment first
    ReleaseDependency {
        deployment_id: Uuid,
        version_selector: Option<Condition>,
    },
}

impl PolicyRule {
    /// Stable discriminator, used in logs and degradation warnings.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyRule::Concurrency { .. } => "concurrency",
            PolicyRule::Retry { .. } => "retry",
            PolicyRule::AnyApproval { .. } => "any-approval",
            PolicyRule::UserApproval { .. } => "user-approval",
            PolicyRule::RoleApproval { .. } => "role-approval",
            PolicyRule::DenyWindow { .. } => "deny-window",
            PolicyRule::GradualRollout { .. } => "gradual-rollout",
            PolicyRule::VersionSelector { .. } => "version-selector",
            PolicyRule::ReleaseDependency { .. } => "release-dependency",
        }
    }
}

/// Whether a (possibly recurring) deny window brackets `now`.
///
/// Recurrence advances the anchored window forward, never backward, until it
/// reaches or passes `now`. Monthly recurrence is calendar-aware in the
/// window's configured UTC offset. Both bounds are inclusive.
pub fn deny_window_brackets(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    recurrence: Option<Recurrence>,
    timezone_offset_minutes: i32,
    now: DateTime<Utc>,
) -> bool {
    if end <= start {
        return false;
    }

    let Some(offset) = FixedOffset::east_opt(timezone_offset_minutes * 60) else {
        return false;
    };
    let mut start = start.with_timezone(&offset);
    let mut end = end.with_timezone(&offset);
    let now = now.with_timezone(&offset);

    if let Some(recurrence) = recurrence {
        while end < now {
            match recurrence {
                Recurrence::Weekly => {
                    start = start + Duration::weeks(1);
                    end = end + Duration::weeks(1);
                }
                Recurrence::Monthly => {
                    let (Some(next_start), Some(next_end)) = (
                        start.checked_add_months(Months::new(1)),
                        end.checked_add_months(Months::new(1)),
                    ) else {
                        return false;
                    };
                    start = next_start;
                    end = next_end;
                }
            }
        }
    }

    start <= now && now <= end
}
