//! DTOs exchanged over the engine's operational HTTP surface

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::Job;
use crate::domain::release::Release;
use crate::domain::target::ReleaseTarget;
use crate::workitem::WorkItemKind;

/// Change-event envelope posted by external surfaces when an entity mutates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: WorkItemKind,
    pub subject_id: Uuid,
    pub workspace_id: Uuid,
}

/// Current state of a release target, for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTargetStatus {
    pub target: ReleaseTarget,
    pub desired_release: Option<Release>,
    pub latest_job: Option<Job>,
}
