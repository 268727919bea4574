//! Selector condition trees
//!
//! A condition is a boolean tree matched against an entity: leaves compare a
//! single entity field, comparison nodes combine children with AND/OR and an
//! optional negation. Conditions are authored as JSON and stored verbatim on
//! environments, deployments, and policy targets.

mod eval;

pub use eval::Selectable;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum nesting depth accepted at authoring time.
///
/// Evaluation never truncates; trees deeper than this are rejected by
/// [`Condition::validate`] before they reach a selector column.
pub const MAX_CONDITION_DEPTH: usize = 8;

/// Operator for string-valued leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperator {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
}

/// Operator for instant-valued leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

/// Combinator for comparison nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// A node in a selector condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    Name {
        operator: StringOperator,
        value: String,
    },
    Slug {
        operator: StringOperator,
        value: String,
    },
    Kind {
        operator: StringOperator,
        value: String,
    },
    Identifier {
        operator: StringOperator,
        value: String,
    },
    Metadata {
        key: String,
        operator: StringOperator,
        value: String,
    },
    CreatedAt {
        operator: DateOperator,
        value: chrono::DateTime<chrono::Utc>,
    },
    Version {
        operator: StringOperator,
        value: String,
    },
    Comparison {
        operator: LogicalOperator,
        #[serde(default)]
        not: bool,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
}

/// Error rejecting a condition at authoring time
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("condition tree exceeds maximum depth of {max}")]
    TooDeep { max: usize },
}

impl Condition {
    /// Nesting depth of this tree; a leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Condition::Comparison { conditions, .. } => {
                1 + conditions.iter().map(Condition::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    /// Validate a condition before persisting it as a selector.
    ///
    /// Depth is bounded here, at authoring time, so evaluation stays total.
    pub fn validate(&self) -> Result<(), ConditionError> {
        if self.depth() > MAX_CONDITION_DEPTH {
            return Err(ConditionError::TooDeep {
                max: MAX_CONDITION_DEPTH,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> Condition {
        Condition::Name {
            operator: StringOperator::Equals,
            value: "web".to_string(),
        }
    }

    fn nest(inner: Condition, levels: usize) -> Condition {
        let mut cond = inner;
        for _ in 0..levels {
            cond = Condition::Comparison {
                operator: LogicalOperator::And,
                not: false,
                conditions: vec![cond],
            };
        }
        cond
    }

    #[test]
    fn test_depth_of_leaf() {
        assert_eq!(leaf().depth(), 1);
    }

    #[test]
    fn test_validate_accepts_nested_trees() {
        // Three levels of comparison is the documented minimum we accept.
        let cond = nest(leaf(), 3);
        assert!(cond.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_excessive_depth() {
        let cond = nest(leaf(), MAX_CONDITION_DEPTH);
        assert_eq!(
            cond.validate(),
            Err(ConditionError::TooDeep {
                max: MAX_CONDITION_DEPTH
            })
        );
    }

    #[test]
    fn test_serde_round_trip_uses_kebab_case_tags() {
        let cond = Condition::Comparison {
            operator: LogicalOperator::Or,
            not: true,
            conditions: vec![Condition::Metadata {
                key: "env".to_string(),
                operator: StringOperator::Equals,
                value: "prod".to_string(),
            }],
        };

        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "comparison");
        assert_eq!(json["conditions"][0]["type"], "metadata");

        let parsed: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, cond);
    }

    #[test]
    fn test_comparison_defaults_for_missing_fields() {
        let parsed: Condition =
            serde_json::from_str(r#"{"type": "comparison", "operator": "and"}"#).unwrap();
        match parsed {
            Condition::Comparison {
                not, conditions, ..
            } => {
                assert!(!not);
                assert!(conditions.is_empty());
            }
            other => panic!("expected comparison, got {:?}", other),
        }
    }
}
