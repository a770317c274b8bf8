//! Core segmentation engine: evaluates contact membership in real-time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mailflow_core::config::SegmentationConfig;
use mailflow_core::types::Contact;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::criteria::{deserialize_lenient, Criteria, Group};
use crate::predicates::evaluate_condition;

/// Pure rule evaluation. Holds no state, so one instance can serve live
/// filtering, dry-run counts, and worker-time re-evaluation alike.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn matches(contact: &Contact, criteria: &Criteria) -> bool {
        criteria
            .groups
            .iter()
            .any(|group| Self::group_matches(contact, group))
    }

    /// An empty group matches everyone.
    pub fn group_matches(contact: &Contact, group: &Group) -> bool {
        group
            .conditions
            .iter()
            .all(|condition| evaluate_condition(contact, condition))
    }

    pub fn count<'a>(criteria: &Criteria, contacts: impl IntoIterator<Item = &'a Contact>) -> usize {
        contacts
            .into_iter()
            .filter(|c| Self::matches(c, criteria))
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_lenient")]
    pub criteria: Criteria,
    /// Archival hint only.
    #[serde(default)]
    pub auto_cleanup_days: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    /// Builds a segment from its persisted criteria string.
    pub fn from_stored(id: Uuid, name: impl Into<String>, raw_criteria: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            description: None,
            criteria: Criteria::parse_or_default(raw_criteria),
            auto_cleanup_days: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn matches(&self, contact: &Contact) -> bool {
        RuleEngine::matches(contact, &self.criteria)
    }
}

pub struct SegmentationEngine {
    segments: DashMap<Uuid, Segment>,
    config: SegmentationConfig,
}

impl SegmentationEngine {
    pub fn new() -> Self {
        Self::with_config(SegmentationConfig::default())
    }

    pub fn with_config(config: SegmentationConfig) -> Self {
        Self {
            segments: DashMap::new(),
            config,
        }
    }

    pub fn register_segment(&self, mut segment: Segment) {
        if segment.auto_cleanup_days.is_none() {
            segment.auto_cleanup_days = self.config.default_cleanup_days;
        }
        info!(
            segment_id = %segment.id,
            name = %segment.name,
            conditions = segment.criteria.condition_count(),
            "Registered segment"
        );
        self.segments.insert(segment.id, segment);
    }

    pub fn update_criteria(&self, id: &Uuid, criteria: Criteria) -> bool {
        match self.segments.get_mut(id) {
            Some(mut segment) => {
                segment.criteria = criteria.normalized();
                segment.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove_segment(&self, id: &Uuid) -> Option<Segment> {
        self.segments.remove(id).map(|(_, s)| s)
    }

    /// Ids of every registered segment the contact belongs to.
    pub fn evaluate_contact(&self, contact: &Contact) -> Vec<Uuid> {
        let mut memberships: Vec<Uuid> = self
            .segments
            .iter()
            .filter(|entry| entry.value().matches(contact))
            .map(|entry| *entry.key())
            .collect();
        memberships.sort();
        memberships
    }

    /// Segments the contact belongs to after a mutation but not before it.
    pub fn entered_segments(&self, before: &Contact, after: &Contact) -> Vec<Uuid> {
        let previous = self.evaluate_contact(before);
        let entered: Vec<Uuid> = self
            .evaluate_contact(after)
            .into_iter()
            .filter(|id| !previous.contains(id))
            .collect();
        if !entered.is_empty() {
            debug!(contact_id = %after.id, count = entered.len(), "Contact entered segments");
        }
        entered
    }

    /// Real match count for draft criteria over a contact population.
    pub fn estimate_count<'a>(
        &self,
        criteria: &Criteria,
        contacts: impl IntoIterator<Item = &'a Contact>,
    ) -> usize {
        RuleEngine::count(criteria, contacts)
    }

    /// Current size of a registered segment.
    pub fn segment_size<'a>(
        &self,
        id: &Uuid,
        contacts: impl IntoIterator<Item = &'a Contact>,
    ) -> Option<usize> {
        let segment = self.segments.get(id)?;
        Some(RuleEngine::count(&segment.criteria, contacts))
    }

    pub fn get_segment(&self, id: &Uuid) -> Option<Segment> {
        self.segments.get(id).map(|s| s.clone())
    }

    pub fn list_segments(&self) -> Vec<Segment> {
        self.segments.iter().map(|s| s.value().clone()).collect()
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{Condition, Operator};

    fn vip_with_opens(opens: u64) -> Contact {
        let mut c = Contact::new(format!("vip{opens}@example.com")).with_tag("VIP");
        c.stats.emails_opened = opens;
        c
    }

    fn vip_and_engaged() -> Criteria {
        Criteria::new(vec![Group {
            conditions: vec![
                Condition::new("tags", Operator::Contains, "VIP"),
                Condition::new("stats.emailsOpened", Operator::GreaterThan, "10"),
            ],
        }])
    }

    #[test]
    fn test_empty_group_matches_everyone() {
        let criteria = Criteria {
            groups: vec![
                Group {
                    conditions: vec![Condition::new("email", Operator::Equals, "nobody")],
                },
                Group::default(),
            ],
        };
        for contact in [Contact::new("a@b.c"), vip_with_opens(0)] {
            assert!(RuleEngine::matches(&contact, &criteria));
        }
        assert!(RuleEngine::matches(&Contact::new("x@y.z"), &Criteria::default()));
    }

    #[test]
    fn test_conditions_in_one_group_are_anded() {
        let criteria = vip_and_engaged();
        assert!(!RuleEngine::matches(&vip_with_opens(5), &criteria));
        assert!(RuleEngine::matches(&vip_with_opens(11), &criteria));
    }

    #[test]
    fn test_groups_are_ored() {
        let criteria = Criteria::new(vec![
            Group {
                conditions: vec![Condition::new("tags", Operator::Contains, "VIP")],
            },
            Group {
                conditions: vec![Condition::new("status", Operator::Is, "unsubscribed")],
            },
        ]);
        let mut contact = Contact::new("gone@example.com");
        contact.status = mailflow_core::types::ContactStatus::Unsubscribed;
        assert!(RuleEngine::matches(&contact, &criteria));
        assert!(!RuleEngine::matches(&Contact::new("plain@example.com"), &criteria));
    }

    #[test]
    fn test_registry_membership_and_counts() {
        let engine = SegmentationEngine::with_config(SegmentationConfig {
            default_cleanup_days: Some(90),
        });
        let segment = Segment::from_stored(Uuid::new_v4(), "Engaged VIPs", &vip_and_engaged().to_json());
        let id = segment.id;
        engine.register_segment(segment);

        assert_eq!(engine.get_segment(&id).unwrap().auto_cleanup_days, Some(90));

        let contacts = vec![vip_with_opens(3), vip_with_opens(12), vip_with_opens(40)];
        assert_eq!(engine.segment_size(&id, &contacts), Some(2));
        assert_eq!(engine.evaluate_contact(&contacts[1]), vec![id]);
        assert!(engine.evaluate_contact(&contacts[0]).is_empty());
        assert_eq!(engine.estimate_count(&Criteria::default(), &contacts), 3);
    }

    #[test]
    fn test_entered_segments_reports_new_memberships_only() {
        let engine = SegmentationEngine::new();
        let segment = Segment::from_stored(
            Uuid::new_v4(),
            "Buyers",
            r#"[{"conditions":[{"field":"tags","operator":"contains","value":"buyer"}]}]"#,
        );
        let id = segment.id;
        engine.register_segment(segment);

        let before = Contact::new("c@example.com");
        let after = before.clone().with_tag("Buyer");
        assert_eq!(engine.entered_segments(&before, &after), vec![id]);
        assert!(engine.entered_segments(&after, &after).is_empty());
    }

    #[test]
    fn test_segment_deserializes_with_stored_string_criteria() {
        let segment: Segment = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "Broken",
            "criteria": "{not valid",
            "autoCleanupDays": 30
        }))
        .unwrap();
        assert_eq!(segment.criteria, Criteria::default());
        assert_eq!(segment.auto_cleanup_days, Some(30));
    }
}
