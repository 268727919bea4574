//! Release: an immutable version + variables snapshot
//!
//! Exactly one release may exist per (release target, version, variables
//! fingerprint); creation is idempotent. The target's desired-release pointer
//! moves between releases, releases themselves never mutate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Immutable snapshot of a version and its resolved variables for one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub release_target_id: Uuid,
    pub version_id: Uuid,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Release {
    pub fn variables_hash(&self) -> String {
        variables_hash(&self.variables)
    }
}

/// Fingerprint of a variables map, part of the release identity key.
///
/// A `BTreeMap` keeps the serialization canonical so equal maps always hash
/// equal.
pub fn variables_hash(variables: &BTreeMap<String, serde_json::Value>) -> String {
    let canonical = serde_json::to_vec(variables).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_hash_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("region".to_string(), serde_json::json!("us-east-1"));
        a.insert("replicas".to_string(), serde_json::json!(3));

        let mut b = BTreeMap::new();
        b.insert("replicas".to_string(), serde_json::json!(3));
        b.insert("region".to_string(), serde_json::json!("us-east-1"));

        assert_eq!(variables_hash(&a), variables_hash(&b));
    }

    #[test]
    fn test_variables_hash_distinguishes_values() {
        let mut a = BTreeMap::new();
        a.insert("replicas".to_string(), serde_json::json!(3));

        let mut b = BTreeMap::new();
        b.insert("replicas".to_string(), serde_json::json!(4));

        assert_ne!(variables_hash(&a), variables_hash(&b));
        assert_eq!(variables_hash(&a).len(), 64);
    }
}
