use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ContactId = Uuid;
pub type FlowId = Uuid;
pub type StepId = String;

/// A subscriber record. `email` is the unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub status: ContactStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub list_ids: BTreeSet<String>,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: ContactStats,
    #[serde(default)]
    pub custom_attributes: HashMap<String, serde_json::Value>,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            status: ContactStatus::Active,
            tags: BTreeSet::new(),
            list_ids: BTreeSet::new(),
            joined_at: Utc::now(),
            stats: ContactStats::default(),
            custom_attributes: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_list(mut self, list_id: impl Into<String>) -> Self {
        self.list_ids.insert(list_id.into());
        self
    }

    /// Tag membership ignores case.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn is_active(&self) -> bool {
        self.status == ContactStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    #[default]
    Active,
    Unsubscribed,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Active => "active",
            ContactStatus::Unsubscribed => "unsubscribed",
        }
    }
}

/// Engagement counters kept on the contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactStats {
    #[serde(default)]
    pub emails_opened: u64,
    #[serde(default)]
    pub links_clicked: u64,
    #[serde(default)]
    pub last_open_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_click_at: Option<DateTime<Utc>>,
}

// ─── Email engagement ───────────────────────────────────────────────────

/// Engagement signals a condition step can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Delivered,
    Opened,
    Clicked,
    Replied,
    Unsubscribed,
}

/// One engagement signal, attributed to the flow step that sent the email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub contact_id: ContactId,
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub kind: EngagementKind,
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A fully resolved email ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub contact_id: ContactId,
    pub to: String,
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub subject: String,
    pub sender: Option<String>,
    pub html: String,
}

// ─── Flow events ────────────────────────────────────────────────────────

/// Event emitted by the flow engine for the owner's activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_id: Uuid,
    pub event_type: FlowEventType,
    pub flow_id: Option<FlowId>,
    pub enrollment_id: Option<Uuid>,
    pub contact_id: Option<ContactId>,
    pub step_id: Option<StepId>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventType {
    EnrollmentCreated,
    StepExecuted,
    EnrollmentCompleted,
    EnrollmentBlocked,
    EnrollmentRemoved,
    SideEffectFailed,
    CrossFlowDependency,
    EngagementRecorded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_json_uses_camel_case() {
        let contact = Contact::new("ada@example.com").with_tag("VIP").with_list("list-1");
        let json = serde_json::to_value(&contact).unwrap();
        assert!(json.get("listIds").is_some());
        assert!(json.get("joinedAt").is_some());
        assert_eq!(json["stats"]["emailsOpened"], 0);
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn test_has_tag_ignores_case() {
        let contact = Contact::new("ada@example.com").with_tag("VIP");
        assert!(contact.has_tag("vip"));
        assert!(!contact.has_tag("vip-gold"));
    }

    #[test]
    fn test_minimal_contact_deserializes() {
        let contact: Contact = serde_json::from_value(serde_json::json!({
            "id": Uuid::new_v4(),
            "email": "grace@example.com"
        }))
        .unwrap();
        assert!(contact.is_active());
        assert!(contact.tags.is_empty());
    }
}
