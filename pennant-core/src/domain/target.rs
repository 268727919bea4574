//! Release target: the unit of dispatch
//!
//! One resource in one environment for one deployment. Targets are derived by
//! the selector reconciler and retired when any leg of the triple disappears.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The (resource, environment, deployment) triple the engine dispatches to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTarget {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub resource_id: Uuid,
    pub environment_id: Uuid,
    pub deployment_id: Uuid,
    pub desired_release_id: Option<Uuid>,
    pub last_decision_reason: Option<String>,
    pub last_evaluated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ReleaseTarget {
    /// Derived addressing key, also the dispatch mutex name for this target.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.deployment_id, self.resource_id, self.environment_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deployment_resource_environment() {
        let target = ReleaseTarget {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
            desired_release_id: None,
            last_decision_reason: None,
            last_evaluated_at: None,
        };

        let key = target.key();
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], target.deployment_id.to_string());
        assert_eq!(parts[1], target.resource_id.to_string());
        assert_eq!(parts[2], target.environment_id.to_string());
    }
}
