//! Criteria tree for segment rules: OR across groups, AND within a group.
//!
//! Criteria are persisted as a serialized array of groups. Every load goes
//! through [`Criteria::parse_or_default`], which never fails: anything that is
//! not a well-formed, non-empty tree becomes a single empty group.

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

/// Ordered list of groups; a contact matches when any group matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criteria {
    pub groups: Vec<Group>,
}

/// Ordered list of conditions; matches when all conditions match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A single leaf comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// The condition value rendered as text; `null` renders as empty.
    pub fn value_text(&self) -> String {
        match &self.value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Comparison operators. Unrecognised names survive a round trip as
/// `Unknown` and never match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Contains,
    NotContains,
    Equals,
    StartsWith,
    GreaterThan,
    LessThan,
    After,
    Before,
    On,
    Is,
    IsNot,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::Equals => "equals",
            Operator::StartsWith => "starts_with",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::After => "after",
            Operator::Before => "before",
            Operator::On => "on",
            Operator::Is => "is",
            Operator::IsNot => "is_not",
            Operator::Unknown(name) => name,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            Operator::Contains | Operator::Equals | Operator::StartsWith | Operator::NotContains
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Operator::GreaterThan | Operator::LessThan | Operator::Equals
        )
    }

    pub fn is_date(&self) -> bool {
        matches!(self, Operator::After | Operator::Before | Operator::On)
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Operator::Is | Operator::IsNot)
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, Operator::Contains | Operator::NotContains)
    }
}

impl From<String> for Operator {
    fn from(name: String) -> Self {
        match name.as_str() {
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "equals" => Operator::Equals,
            "starts_with" => Operator::StartsWith,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            "after" => Operator::After,
            "before" => Operator::Before,
            "on" => Operator::On,
            "is" => Operator::Is,
            "is_not" => Operator::IsNot,
            _ => Operator::Unknown(name),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl Default for Criteria {
    /// A single empty group, which matches every contact.
    fn default() -> Self {
        Self {
            groups: vec![Group::default()],
        }
    }
}

/// Stored groups come either as `{"conditions": [...]}` objects or as bare
/// condition arrays.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredGroup {
    Object(Group),
    Bare(Vec<Condition>),
}

impl From<StoredGroup> for Group {
    fn from(stored: StoredGroup) -> Self {
        match stored {
            StoredGroup::Object(group) => group,
            StoredGroup::Bare(conditions) => Group { conditions },
        }
    }
}

impl Criteria {
    pub fn new(groups: Vec<Group>) -> Self {
        Self { groups }.normalized()
    }

    /// Parses the persisted form. Never fails.
    pub fn parse_or_default(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value_or_default(value),
            Err(e) => {
                warn!(error = %e, "Segment criteria is not valid JSON, using default group");
                Self::default()
            }
        }
    }

    /// Like [`Criteria::parse_or_default`] for an already-decoded value. A JSON
    /// string is treated as a nested serialized tree.
    pub fn from_value_or_default(value: serde_json::Value) -> Self {
        if let serde_json::Value::String(raw) = &value {
            return Self::parse_or_default(raw);
        }
        match serde_json::from_value::<Vec<StoredGroup>>(value) {
            Ok(groups) => Self {
                groups: groups.into_iter().map(Group::from).collect(),
            }
            .normalized(),
            Err(e) => {
                warn!(error = %e, "Segment criteria has unexpected shape, using default group");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }

    /// A tree with no groups, or with an empty group, collapses to the default.
    pub fn normalized(self) -> Self {
        if self.groups.is_empty() || self.groups.iter().any(|g| g.conditions.is_empty()) {
            Self::default()
        } else {
            self
        }
    }

    pub fn condition_count(&self) -> usize {
        self.groups.iter().map(|g| g.conditions.len()).sum()
    }
}

/// `deserialize_with` helper applying the parse-or-default contract.
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Criteria, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(Criteria::from_value_or_default(value))
}
