//! Condition evaluation
//!
//! Pure, total, deterministic: a leaf over a field the entity does not carry
//! evaluates to `false`, never errors.

use chrono::{DateTime, Utc};

use super::{Condition, DateOperator, LogicalOperator, StringOperator};

/// Field access for entities that can be matched by a selector.
///
/// Every accessor defaults to `None`; entities expose only the fields they
/// actually carry.
pub trait Selectable {
    fn name(&self) -> Option<&str> {
        None
    }
    fn slug(&self) -> Option<&str> {
        None
    }
    fn kind(&self) -> Option<&str> {
        None
    }
    fn identifier(&self) -> Option<&str> {
        None
    }
    fn metadata(&self, _key: &str) -> Option<&str> {
        None
    }
    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn version(&self) -> Option<&str> {
        None
    }
}

impl Condition {
    /// Evaluate this condition against an entity.
    pub fn matches(&self, entity: &impl Selectable) -> bool {
        match self {
            Condition::Name { operator, value } => string_op(entity.name(), *operator, value),
            Condition::Slug { operator, value } => string_op(entity.slug(), *operator, value),
            Condition::Kind { operator, value } => string_op(entity.kind(), *operator, value),
            Condition::Identifier { operator, value } => {
                string_op(entity.identifier(), *operator, value)
            }
            Condition::Metadata {
                key,
                operator,
                value,
            } => string_op(entity.metadata(key), *operator, value),
            Condition::CreatedAt { operator, value } => {
                date_op(entity.created_at(), *operator, *value)
            }
            Condition::Version { operator, value } => string_op(entity.version(), *operator, value),
            Condition::Comparison {
                operator,
                not,
                conditions,
            } => {
                // An empty child list is false before negation is applied.
                let combined = if conditions.is_empty() {
                    false
                } else {
                    match operator {
                        LogicalOperator::And => conditions.iter().all(|c| c.matches(entity)),
                        LogicalOperator::Or => conditions.iter().any(|c| c.matches(entity)),
                    }
                };
                combined ^ not
            }
        }
    }
}

fn string_op(field: Option<&str>, operator: StringOperator, value: &str) -> bool {
    let Some(field) = field else {
        return false;
    };
    match operator {
        StringOperator::Equals => field == value,
        StringOperator::StartsWith => field.starts_with(value),
        StringOperator::EndsWith => field.ends_with(value),
        StringOperator::Contains => field.contains(value),
    }
}

fn date_op(field: Option<DateTime<Utc>>, operator: DateOperator, value: DateTime<Utc>) -> bool {
    let Some(field) = field else {
        return false;
    };
    match operator {
        DateOperator::Before => field < value,
        DateOperator::After => field > value,
        DateOperator::BeforeOrOn => field <= value,
        DateOperator::AfterOrOn => field >= value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestEntity {
        name: String,
        metadata: HashMap<String, String>,
        created_at: DateTime<Utc>,
    }

    impl TestEntity {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                metadata: HashMap::new(),
                created_at: "2024-06-01T00:00:00Z".parse().unwrap(),
            }
        }

        fn with_metadata(mut self, key: &str, value: &str) -> Self {
            self.metadata.insert(key.to_string(), value.to_string());
            self
        }
    }

    impl Selectable for TestEntity {
        fn name(&self) -> Option<&str> {
            Some(&self.name)
        }
        fn metadata(&self, key: &str) -> Option<&str> {
            self.metadata.get(key).map(String::as_str)
        }
        fn created_at(&self) -> Option<DateTime<Utc>> {
            Some(self.created_at)
        }
    }

    fn name_equals(value: &str) -> Condition {
        Condition::Name {
            operator: StringOperator::Equals,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_string_operators() {
        let entity = TestEntity::new("api-server");

        let cases = [
            (StringOperator::Equals, "api-server", true),
            (StringOperator::Equals, "API-SERVER", false),
            (StringOperator::StartsWith, "api", true),
            (StringOperator::EndsWith, "server", true),
            (StringOperator::Contains, "i-s", true),
            (StringOperator::Contains, "worker", false),
        ];
        for (operator, value, expected) in cases {
            let cond = Condition::Name {
                operator,
                value: value.to_string(),
            };
            assert_eq!(cond.matches(&entity), expected, "{:?} {}", operator, value);
        }
    }

    #[test]
    fn test_metadata_equals_matches_prod_resource() {
        let resource = TestEntity::new("r").with_metadata("env", "prod");
        let cond = Condition::Metadata {
            key: "env".to_string(),
            operator: StringOperator::Equals,
            value: "prod".to_string(),
        };
        assert!(cond.matches(&resource));
    }

    #[test]
    fn test_missing_field_evaluates_false() {
        let entity = TestEntity::new("r");

        // No such metadata key.
        let cond = Condition::Metadata {
            key: "env".to_string(),
            operator: StringOperator::Equals,
            value: "prod".to_string(),
        };
        assert!(!cond.matches(&entity));

        // The entity does not expose a version at all.
        let cond = Condition::Version {
            operator: StringOperator::Equals,
            value: "1.0.0".to_string(),
        };
        assert!(!cond.matches(&entity));
    }

    #[test]
    fn test_temporal_operators_include_equality_on_or_variants() {
        let entity = TestEntity::new("r");
        let at = entity.created_at;

        let cases = [
            (DateOperator::Before, at, false),
            (DateOperator::BeforeOrOn, at, true),
            (DateOperator::After, at, false),
            (DateOperator::AfterOrOn, at, true),
        ];
        for (operator, value, expected) in cases {
            let cond = Condition::CreatedAt { operator, value };
            assert_eq!(cond.matches(&entity), expected, "{:?}", operator);
        }
    }

    #[test]
    fn test_and_or_reduction() {
        let entity = TestEntity::new("web").with_metadata("env", "prod");
        let hit = name_equals("web");
        let miss = name_equals("worker");

        let and = Condition::Comparison {
            operator: LogicalOperator::And,
            not: false,
            conditions: vec![hit.clone(), miss.clone()],
        };
        assert!(!and.matches(&entity));

        let or = Condition::Comparison {
            operator: LogicalOperator::Or,
            not: false,
            conditions: vec![hit, miss],
        };
        assert!(or.matches(&entity));
    }

    #[test]
    fn test_empty_comparison_is_false_before_not() {
        let entity = TestEntity::new("web");

        let empty = Condition::Comparison {
            operator: LogicalOperator::And,
            not: false,
            conditions: vec![],
        };
        assert!(!empty.matches(&entity));

        let negated_empty = Condition::Comparison {
            operator: LogicalOperator::And,
            not: true,
            conditions: vec![],
        };
        assert!(negated_empty.matches(&entity));
    }

    #[test]
    fn test_not_wrapper_negates_any_subtree() {
        let entity = TestEntity::new("web");
        let subtrees = [
            name_equals("web"),
            name_equals("worker"),
            Condition::Comparison {
                operator: LogicalOperator::Or,
                not: true,
                conditions: vec![name_equals("web")],
            },
        ];

        for subtree in subtrees {
            let wrapped = Condition::Comparison {
                operator: LogicalOperator::And,
                not: true,
                conditions: vec![subtree.clone()],
            };
            assert_eq!(wrapped.matches(&entity), !subtree.matches(&entity));
        }
    }
}
