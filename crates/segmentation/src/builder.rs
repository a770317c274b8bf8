//! Segment builder: fluent API for constructing segment criteria.
//!
//! Conditions accumulate into the current group; `or()` closes it and opens
//! the next one.

use crate::criteria::{Condition, Criteria, Group, Operator};
use crate::engine::Segment;
use uuid::Uuid;

pub struct SegmentBuilder {
    name: String,
    description: Option<String>,
    auto_cleanup_days: Option<u32>,
    groups: Vec<Group>,
    current: Vec<Condition>,
}

impl SegmentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            auto_cleanup_days: None,
            groups: Vec::new(),
            current: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn auto_cleanup_days(mut self, days: u32) -> Self {
        self.auto_cleanup_days = Some(days);
        self
    }

    pub fn condition(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.current.push(Condition::new(field, operator, value));
        self
    }

    pub fn has_tag(self, tag: impl Into<String>) -> Self {
        self.condition("tags", Operator::Contains, tag.into())
    }

    pub fn lacks_tag(self, tag: impl Into<String>) -> Self {
        self.condition("tags", Operator::NotContains, tag.into())
    }

    pub fn on_list(self, list_id: impl Into<String>) -> Self {
        self.condition("listIds", Operator::Contains, list_id.into())
    }

    pub fn status_is(self, status: impl Into<String>) -> Self {
        self.condition("status", Operator::Is, status.into())
    }

    pub fn opened_more_than(self, opens: u64) -> Self {
        self.condition("stats.emailsOpened", Operator::GreaterThan, opens)
    }

    pub fn joined_after(self, date: impl Into<String>) -> Self {
        self.condition("joinedAt", Operator::After, date.into())
    }

    pub fn or(mut self) -> Self {
        if !self.current.is_empty() {
            let conditions = std::mem::take(&mut self.current);
            self.groups.push(Group { conditions });
        }
        self
    }

    pub fn criteria(self) -> Criteria {
        let finished = self.or();
        Criteria::new(finished.groups)
    }

    pub fn build(self) -> Segment {
        let now = chrono::Utc::now();
        let name = self.name.clone();
        let description = self.description.clone();
        let auto_cleanup_days = self.auto_cleanup_days;
        Segment {
            id: Uuid::new_v4(),
            name,
            description,
            criteria: self.criteria(),
            auto_cleanup_days,
            created_at: now,
            updated_at: now,
        }
    }
}
