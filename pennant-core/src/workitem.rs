//! Work-item envelopes
//!
//! Everything the engine does is driven by work items: entity mutations
//! enqueue change items, the reconciler enqueues evaluate items, workers
//! consume both. Delivery is at-least-once; handlers re-read current state
//! and stay idempotent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a work item asks the engine to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkItemKind {
    ResourceChanged,
    EnvironmentChanged,
    DeploymentChanged,
    PolicyChanged,
    EvaluateReleaseTarget,
}

impl WorkItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemKind::ResourceChanged => "resource-changed",
            WorkItemKind::EnvironmentChanged => "environment-changed",
            WorkItemKind::DeploymentChanged => "deployment-changed",
            WorkItemKind::PolicyChanged => "policy-changed",
            WorkItemKind::EvaluateReleaseTarget => "evaluate-release-target",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resource-changed" => Some(WorkItemKind::ResourceChanged),
            "environment-changed" => Some(WorkItemKind::EnvironmentChanged),
            "deployment-changed" => Some(WorkItemKind::DeploymentChanged),
            "policy-changed" => Some(WorkItemKind::PolicyChanged),
            "evaluate-release-target" => Some(WorkItemKind::EvaluateReleaseTarget),
            _ => None,
        }
    }
}

/// A queued unit of engine work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub kind: WorkItemKind,
    /// The mutated entity or the release target to evaluate, per `kind`.
    pub subject_id: Uuid,
    pub workspace_id: Uuid,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}
