//! Selectable entities
//!
//! Resources, environments, deployments, systems, and deployment versions.
//! Structure shared between the engine (persists) and external intake
//! surfaces (mutate via the store).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{Condition, Selectable};

/// An execution target discovered in a workspace (cluster, VM, namespace, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub kind: String,
    pub identifier: String,
    pub version: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Selectable for Resource {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn kind(&self) -> Option<&str> {
        Some(&self.kind)
    }
    fn identifier(&self) -> Option<&str> {
        Some(&self.identifier)
    }
    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
    fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(self.created_at)
    }
    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// A group of environments and deployments that evolve together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub slug: String,
}

/// A deployment stage (dev, staging, prod, ...) within a system
///
/// The resource selector decides which resources belong to the environment;
/// an environment without a selector has no resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub system_id: Uuid,
    pub name: String,
    pub resource_selector: Option<Condition>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Selectable for Environment {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(self.created_at)
    }
}

/// A deployable component within a system
///
/// A deployment without a resource selector applies to every resource its
/// environments bring in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub system_id: Uuid,
    pub name: String,
    pub slug: String,
    pub resource_selector: Option<Condition>,
    pub job_agent_id: Option<Uuid>,
    pub job_timeout_seconds: Option<i64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Selectable for Deployment {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
    fn slug(&self) -> Option<&str> {
        Some(&self.slug)
    }
    fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(self.created_at)
    }
}

/// Build status of a deployment version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionStatus {
    Ready,
    Building,
    Failed,
    Rejected,
}

/// A released artifact version of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub tag: String,
    pub status: VersionStatus,
    pub metadata: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Selectable for DeploymentVersion {
    // Version selectors address the tag through both `name` and `version`.
    fn name(&self) -> Option<&str> {
        Some(&self.tag)
    }
    fn version(&self) -> Option<&str> {
        Some(&self.tag)
    }
    fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
    fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        Some(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::StringOperator;

    #[test]
    fn test_resource_exposes_selector_fields() {
        let resource = Resource {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "web-1".to_string(),
            kind: "kubernetes".to_string(),
            identifier: "cluster/web-1".to_string(),
            version: Some("v1".to_string()),
            metadata: HashMap::from([("env".to_string(), "prod".to_string())]),
            created_at: chrono::Utc::now(),
        };

        let cond = Condition::Kind {
            operator: StringOperator::Equals,
            value: "kubernetes".to_string(),
        };
        assert!(cond.matches(&resource));

        // Environments do not carry a kind, so the same leaf is false there.
        let environment = Environment {
            id: Uuid::new_v4(),
            system_id: Uuid::new_v4(),
            name: "prod".to_string(),
            resource_selector: None,
            created_at: chrono::Utc::now(),
        };
        assert!(!cond.matches(&environment));
    }
}
