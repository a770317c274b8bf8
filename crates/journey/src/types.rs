use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use mailflow_core::error::MailflowResult;
use mailflow_core::types::{ContactId, FlowId, StepId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::state_machine::EnrollmentStateMachine;

/// An automation flow: a directed graph of steps entered through one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    #[serde(default)]
    pub status: FlowStatus,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub stats: FlowStats,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn new(name: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: FlowStatus::Draft,
            steps,
            stats: FlowStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The first trigger step; validation guarantees there is exactly one.
    pub fn trigger(&self) -> Option<&FlowStep> {
        self.steps
            .iter()
            .find(|s| s.step_type() == StepType::Trigger)
    }

    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        match &self.trigger()?.config {
            StepConfig::Trigger(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }
}

/// Lifecycle status of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    #[serde(default)]
    pub enrolled: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub blocked: u64,
}

// ─── Steps ──────────────────────────────────────────────────────────────

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Trigger,
    Action,
    Wait,
    Condition,
    SplitTest,
    UpdateTag,
    ListAction,
    LinkFlow,
    RemoveAction,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Trigger => "trigger",
            StepType::Action => "action",
            StepType::Wait => "wait",
            StepType::Condition => "condition",
            StepType::SplitTest => "split_test",
            StepType::UpdateTag => "update_tag",
            StepType::ListAction => "list_action",
            StepType::LinkFlow => "link_flow",
            StepType::RemoveAction => "remove_action",
        }
    }

    /// Outgoing edges a step of this type may carry.
    pub fn allowed_edges(&self) -> &'static [EdgeKind] {
        match self {
            StepType::Trigger
            | StepType::Action
            | StepType::Wait
            | StepType::UpdateTag
            | StepType::ListAction => &[EdgeKind::Next],
            StepType::Condition => &[EdgeKind::Yes, EdgeKind::No],
            StepType::SplitTest => &[EdgeKind::PathA, EdgeKind::PathB],
            StepType::LinkFlow | StepType::RemoveAction => &[],
        }
    }
}

/// Named outgoing edge of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Next,
    Yes,
    No,
    PathA,
    PathB,
}

impl EdgeKind {
    pub fn field_name(&self) -> &'static str {
        match self {
            EdgeKind::Next => "nextStepId",
            EdgeKind::Yes => "yesStepId",
            EdgeKind::No => "noStepId",
            EdgeKind::PathA => "pathAStepId",
            EdgeKind::PathB => "pathBStepId",
        }
    }
}

/// A single step within a flow. Serialized as
/// `{id, type, label, config, nextStepId, yesStepId, noStepId, pathAStepId, pathBStepId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStep", into = "RawStep")]
pub struct FlowStep {
    pub id: StepId,
    pub label: String,
    pub config: StepConfig,
    pub next_step_id: Option<StepId>,
    pub yes_step_id: Option<StepId>,
    pub no_step_id: Option<StepId>,
    pub path_a_step_id: Option<StepId>,
    pub path_b_step_id: Option<StepId>,
}

impl FlowStep {
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        let config = config.normalized();
        Self {
            id: id.into(),
            label: config.step_type().as_str().to_string(),
            config,
            next_step_id: None,
            yes_step_id: None,
            no_step_id: None,
            path_a_step_id: None,
            path_b_step_id: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next_step_id = Some(next.into());
        self
    }

    pub fn branches(mut self, yes: impl Into<String>, no: impl Into<String>) -> Self {
        self.yes_step_id = Some(yes.into());
        self.no_step_id = Some(no.into());
        self
    }

    pub fn paths(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.path_a_step_id = Some(a.into());
        self.path_b_step_id = Some(b.into());
        self
    }

    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    pub fn edge(&self, kind: EdgeKind) -> Option<&StepId> {
        match kind {
            EdgeKind::Next => self.next_step_id.as_ref(),
            EdgeKind::Yes => self.yes_step_id.as_ref(),
            EdgeKind::No => self.no_step_id.as_ref(),
            EdgeKind::PathA => self.path_a_step_id.as_ref(),
            EdgeKind::PathB => self.path_b_step_id.as_ref(),
        }
    }

    /// Every populated outgoing edge, whether or not the type allows it.
    pub fn outgoing(&self) -> Vec<(EdgeKind, &StepId)> {
        [
            EdgeKind::Next,
            EdgeKind::Yes,
            EdgeKind::No,
            EdgeKind::PathA,
            EdgeKind::PathB,
        ]
        .into_iter()
        .filter_map(|kind| self.edge(kind).map(|target| (kind, target)))
        .collect()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    id: StepId,
    #[serde(rename = "type")]
    step_type: StepType,
    #[serde(default)]
    label: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    yes_step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    no_step_id: Option<StepId>,
    #[serde(default, rename = "pathAStepId", skip_serializing_if = "Option::is_none")]
    path_a_step_id: Option<StepId>,
    #[serde(default, rename = "pathBStepId", skip_serializing_if = "Option::is_none")]
    path_b_step_id: Option<StepId>,
}

impl From<RawStep> for FlowStep {
    fn from(raw: RawStep) -> Self {
        let config = StepConfig::parse_or_default(raw.step_type, &raw.id, raw.config);
        Self {
            id: raw.id,
            label: raw.label,
            config,
            next_step_id: raw.next_step_id.filter(|s| !s.is_empty()),
            yes_step_id: raw.yes_step_id.filter(|s| !s.is_empty()),
            no_step_id: raw.no_step_id.filter(|s| !s.is_empty()),
            path_a_step_id: raw.path_a_step_id.filter(|s| !s.is_empty()),
            path_b_step_id: raw.path_b_step_id.filter(|s| !s.is_empty()),
        }
    }
}

impl From<FlowStep> for RawStep {
    fn from(step: FlowStep) -> Self {
        Self {
            step_type: step.step_type(),
            config: step.config.to_value(),
            id: step.id,
            label: step.label,
            next_step_id: step.next_step_id,
            yes_step_id: step.yes_step_id,
            no_step_id: step.no_step_id,
            path_a_step_id: step.path_a_step_id,
            path_b_step_id: step.path_b_step_id,
        }
    }
}

/// Per-type step configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Trigger(TriggerConfig),
    Action(EmailActionConfig),
    Wait(WaitConfig),
    Condition(ConditionConfig),
    SplitTest(SplitTestConfig),
    UpdateTag(UpdateTagConfig),
    ListAction(ListActionConfig),
    LinkFlow(LinkFlowConfig),
    RemoveAction(RemoveActionConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Trigger(_) => StepType::Trigger,
            StepConfig::Action(_) => StepType::Action,
            StepConfig::Wait(_) => StepType::Wait,
            StepConfig::Condition(_) => StepType::Condition,
            StepConfig::SplitTest(_) => StepType::SplitTest,
            StepConfig::UpdateTag(_) => StepType::UpdateTag,
            StepConfig::ListAction(_) => StepType::ListAction,
            StepConfig::LinkFlow(_) => StepType::LinkFlow,
            StepConfig::RemoveAction(_) => StepType::RemoveAction,
        }
    }

    /// Parses a stored config for the given type. Malformed configs become
    /// the type's default rather than failing the flow load.
    pub fn parse_or_default(step_type: StepType, step_id: &str, value: serde_json::Value) -> Self {
        let config = match step_type {
            StepType::Trigger => StepConfig::Trigger(parse_config(step_id, value)),
            StepType::Action => StepConfig::Action(parse_config(step_id, value)),
            StepType::Wait => StepConfig::Wait(parse_config(step_id, value)),
            StepType::Condition => StepConfig::Condition(parse_config(step_id, value)),
            StepType::SplitTest => StepConfig::SplitTest(parse_config(step_id, value)),
            StepType::UpdateTag => StepConfig::UpdateTag(parse_config(step_id, value)),
            StepType::ListAction => StepConfig::ListAction(parse_config(step_id, value)),
            StepType::LinkFlow => StepConfig::LinkFlow(parse_config(step_id, value)),
            StepType::RemoveAction => StepConfig::RemoveAction(parse_config(step_id, value)),
        };
        config.normalized()
    }

    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            StepConfig::Trigger(c) => serde_json::to_value(c),
            StepConfig::Action(c) => serde_json::to_value(c),
            StepConfig::Wait(c) => serde_json::to_value(c),
            StepConfig::Condition(c) => serde_json::to_value(c),
            StepConfig::SplitTest(c) => serde_json::to_value(c),
            StepConfig::UpdateTag(c) => serde_json::to_value(c),
            StepConfig::ListAction(c) => serde_json::to_value(c),
            StepConfig::LinkFlow(c) => serde_json::to_value(c),
            StepConfig::RemoveAction(c) => serde_json::to_value(c),
        };
        value.unwrap_or_default()
    }

    /// Applies load-time normalization rules.
    pub fn normalized(self) -> Self {
        match self {
            StepConfig::Wait(c) => StepConfig::Wait(c.normalized()),
            StepConfig::Condition(c) => StepConfig::Condition(c.normalized()),
            StepConfig::SplitTest(c) => StepConfig::SplitTest(c.normalized()),
            StepConfig::UpdateTag(c) => StepConfig::UpdateTag(c.normalized()),
            other => other,
        }
    }
}

fn parse_config<T: DeserializeOwned + Default>(step_id: &str, value: serde_json::Value) -> T {
    if value.is_null() {
        return T::default();
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(step_id = %step_id, error = %e, "Malformed step config, using defaults");
        T::default()
    })
}

/// External event class a trigger listens for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    List,
    Tag,
    Segment,
    Campaign,
    Form,
    Purchase,
    CustomEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerConfig {
    pub trigger_type: TriggerType,
    pub target_id: String,
}

impl TriggerConfig {
    pub fn new(trigger_type: TriggerType, target_id: impl Into<String>) -> Self {
        Self {
            trigger_type,
            target_id: target_id.into(),
        }
    }

    /// Tags match by name ignoring case; every other target matches exactly.
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if self.trigger_type != event.trigger_type || self.target_id.is_empty() {
            return false;
        }
        match self.trigger_type {
            TriggerType::Tag => self.target_id.eq_ignore_ascii_case(&event.target_id),
            _ => self.target_id == event.target_id,
        }
    }
}

/// Send-email step configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailActionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

/// Where an email's body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailContent<'a> {
    Template(&'a str),
    Html(&'a str),
}

impl EmailActionConfig {
    pub fn with_html(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            html: Some(html.into()),
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn with_template(subject: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            template_id: Some(template_id.into()),
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// A template id takes precedence over inline HTML.
    pub fn content(&self) -> Option<EmailContent<'_>> {
        if let Some(id) = self.template_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return Some(EmailContent::Template(id));
        }
        self.html
            .as_deref()
            .filter(|html| !html.trim().is_empty())
            .map(EmailContent::Html)
    }
}

/// Unit for wait durations and condition timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Legacy unit, normalized to one hour on load.
    Minutes,
    Hours,
    #[default]
    Days,
    Weeks,
}

/// Normalizes a stored `(duration, unit)` pair: legacy minutes become one
/// hour and durations are at least 1.
pub fn normalize_duration(duration: u32, unit: TimeUnit) -> (u32, TimeUnit) {
    match unit {
        TimeUnit::Minutes => (1, TimeUnit::Hours),
        other => (duration.max(1), other),
    }
}

pub fn to_chrono(duration: u32, unit: TimeUnit) -> Duration {
    let n = i64::from(duration);
    match unit {
        TimeUnit::Minutes => Duration::minutes(n),
        TimeUnit::Hours => Duration::hours(n),
        TimeUnit::Days => Duration::days(n),
        TimeUnit::Weeks => Duration::weeks(n),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitConfig {
    pub duration: u32,
    pub unit: TimeUnit,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            duration: 1,
            unit: TimeUnit::Days,
        }
    }
}

impl WaitConfig {
    pub fn new(duration: u32, unit: TimeUnit) -> Self {
        Self { duration, unit }.normalized()
    }

    pub fn normalized(self) -> Self {
        let (duration, unit) = normalize_duration(self.duration, self.unit);
        Self { duration, unit }
    }

    pub fn as_duration(&self) -> Duration {
        to_chrono(self.duration, self.unit)
    }
}

/// Engagement a condition step waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Delivered,
    #[default]
    Opened,
    Clicked,
    Replied,
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConditionConfig {
    pub condition_type: ConditionType,
    pub wait_duration: u32,
    pub wait_unit: TimeUnit,
    /// Only meaningful for `clicked`; empty means any link of the governing email.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub link_targets: BTreeSet<String>,
}

impl Default for ConditionConfig {
    fn default() -> Self {
        Self {
            condition_type: ConditionType::Opened,
            wait_duration: 1,
            wait_unit: TimeUnit::Days,
            link_targets: BTreeSet::new(),
        }
    }
}

impl ConditionConfig {
    pub fn new(condition_type: ConditionType, wait_duration: u32, wait_unit: TimeUnit) -> Self {
        Self {
            condition_type,
            wait_duration,
            wait_unit,
            link_targets: BTreeSet::new(),
        }
        .normalized()
    }

    pub fn with_link_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.link_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn normalized(self) -> Self {
        let (wait_duration, wait_unit) = normalize_duration(self.wait_duration, self.wait_unit);
        Self {
            wait_duration,
            wait_unit,
            ..self
        }
    }

    pub fn timeout(&self) -> Duration {
        to_chrono(self.wait_duration, self.wait_unit)
    }
}

/// A/B split weights. `ratio_a + ratio_b == 100`, each within `[1, 99]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitTestConfig {
    #[serde(rename = "ratioA")]
    pub ratio_a: u32,
    #[serde(rename = "ratioB")]
    pub ratio_b: u32,
}

impl Default for SplitTestConfig {
    fn default() -> Self {
        Self {
            ratio_a: 50,
            ratio_b: 50,
        }
    }
}

impl SplitTestConfig {
    pub fn new(ratio_a: i64) -> Self {
        let mut config = Self::default();
        config.set_ratio_a(ratio_a);
        config
    }

    pub fn set_ratio_a(&mut self, value: i64) {
        let a = clamp_ratio(value);
        self.ratio_a = a;
        self.ratio_b = 100 - a;
    }

    pub fn set_ratio_b(&mut self, value: i64) {
        let b = clamp_ratio(value);
        self.ratio_b = b;
        self.ratio_a = 100 - b;
    }

    pub fn is_valid(&self) -> bool {
        (1..=99).contains(&self.ratio_a)
            && (1..=99).contains(&self.ratio_b)
            && self.ratio_a + self.ratio_b == 100
    }

    /// Stored ratios that do not form a valid pair are rebuilt from `ratioA`.
    pub fn normalized(mut self) -> Self {
        if !self.is_valid() {
            self.set_ratio_a(i64::from(self.ratio_a));
        }
        self
    }

    /// Maps a roll in `[0, 100)` to a branch.
    pub fn branch_for_roll(&self, roll: u32) -> SplitBranch {
        if roll < self.ratio_a {
            SplitBranch::A
        } else {
            SplitBranch::B
        }
    }
}

fn clamp_ratio(value: i64) -> u32 {
    // Clamped to [1, 99], so the cast is lossless.
    value.clamp(1, 99) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitBranch {
    A,
    B,
}

/// Add or remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    #[default]
    Add,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTagConfig {
    pub action: MembershipAction,
    pub tags: Vec<String>,
}

impl UpdateTagConfig {
    pub fn new<I, S>(action: MembershipAction, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action,
            tags: tags.into_iter().map(Into::into).collect(),
        }
        .normalized()
    }

    /// Trims names and drops blanks and case-insensitive duplicates.
    pub fn normalized(self) -> Self {
        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags {
            let tag = tag.trim().to_string();
            if !tag.is_empty() && !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                tags.push(tag);
            }
        }
        Self {
            action: self.action,
            tags,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListActionConfig {
    pub action: MembershipAction,
    pub list_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkFlowConfig {
    pub linked_flow_id: Option<FlowId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalType {
    #[default]
    Unsubscribe,
    DeleteContact,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoveActionConfig {
    pub action_type: RemovalType,
}

// ─── Trigger events ─────────────────────────────────────────────────────

/// An inbound event that may enroll a contact into flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub contact_email: String,
    pub trigger_type: TriggerType,
    pub target_id: String,
}

impl TriggerEvent {
    pub fn new(
        trigger_type: TriggerType,
        contact_email: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            contact_email: contact_email.into(),
            trigger_type,
            target_id: target_id.into(),
        }
    }

    pub fn list_added(email: impl Into<String>, list_id: impl Into<String>) -> Self {
        Self::new(TriggerType::List, email, list_id)
    }

    pub fn tag_added(email: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::new(TriggerType::Tag, email, tag)
    }

    pub fn segment_entered(email: impl Into<String>, segment_id: impl Into<String>) -> Self {
        Self::new(TriggerType::Segment, email, segment_id)
    }

    pub fn campaign_sent(email: impl Into<String>, campaign_id: impl Into<String>) -> Self {
        Self::new(TriggerType::Campaign, email, campaign_id)
    }

    pub fn form_submitted(email: impl Into<String>, form_id: impl Into<String>) -> Self {
        Self::new(TriggerType::Form, email, form_id)
    }

    pub fn purchase_recorded(email: impl Into<String>, purchase_event_id: impl Into<String>) -> Self {
        Self::new(TriggerType::Purchase, email, purchase_event_id)
    }

    pub fn custom_event(email: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self::new(TriggerType::CustomEvent, email, event_id)
    }
}

// ─── Enrollments ────────────────────────────────────────────────────────

/// One contact's live position within one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: Uuid,
    pub flow_id: FlowId,
    pub contact_id: ContactId,
    pub current_step_id: StepId,
    pub state: EnrollmentState,
    pub enrolled_at: DateTime<Utc>,
    pub step_entered_at: DateTime<Utc>,
    /// Optimistic concurrency counter; bumped by every committed write.
    pub version: u64,
    /// Side-effecting steps already attempted for this enrollment.
    #[serde(default)]
    pub executed_steps: BTreeSet<StepId>,
    #[serde(default)]
    pub split_assignments: BTreeMap<StepId, SplitBranch>,
    /// Failed side-effect attempts on the current step.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Next time a pending condition is re-checked for engagement.
    #[serde(default)]
    pub next_check_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(flow_id: FlowId, contact_id: ContactId, entry_step: StepId, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id,
            contact_id,
            current_step_id: entry_step,
            state: EnrollmentState::Running,
            enrolled_at: now,
            step_entered_at: now,
            version: 0,
            executed_steps: BTreeSet::new(),
            split_assignments: BTreeMap::new(),
            attempts: 0,
            last_error: None,
            next_check_at: None,
            updated_at: now,
        }
    }

    /// Moves to a new state, enforcing the lifecycle transition table.
    pub fn set_state(&mut self, state: EnrollmentState) -> MailflowResult<()> {
        EnrollmentStateMachine::check(self.state.phase(), state.phase())?;
        self.state = state;
        Ok(())
    }

    /// Enters `next`, or completes when there is no outgoing edge.
    pub fn move_to(&mut self, next: Option<StepId>, now: DateTime<Utc>) -> MailflowResult<()> {
        match next {
            Some(step_id) => {
                self.set_state(EnrollmentState::Running)?;
                self.current_step_id = step_id;
                self.step_entered_at = now;
                self.attempts = 0;
                self.last_error = None;
                self.next_check_at = None;
            }
            None => self.set_state(EnrollmentState::Completed)?,
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            EnrollmentState::Running => true,
            EnrollmentState::Waiting { until } => *until <= now,
            EnrollmentState::BranchPending { .. } => self.due_at() <= now,
            EnrollmentState::Completed | EnrollmentState::Blocked { .. } => false,
        }
    }

    /// When the executor should next look at this enrollment. A pending
    /// condition is looked at on its re-check schedule or at its deadline,
    /// whichever comes first.
    pub fn due_at(&self) -> DateTime<Utc> {
        match &self.state {
            EnrollmentState::Running => self.step_entered_at,
            EnrollmentState::Waiting { until } => *until,
            EnrollmentState::BranchPending { deadline } => self
                .next_check_at
                .map_or(self.step_entered_at, |t| t.min(*deadline)),
            EnrollmentState::Completed | EnrollmentState::Blocked { .. } => self.updated_at,
        }
    }
}

/// Runtime state of an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EnrollmentState {
    Running,
    Waiting { until: DateTime<Utc> },
    BranchPending { deadline: DateTime<Utc> },
    Completed,
    /// A configuration problem stops this enrollment until the owner acts.
    Blocked { reason: String },
}

impl EnrollmentState {
    pub fn phase(&self) -> EnrollmentPhase {
        match self {
            EnrollmentState::Running => EnrollmentPhase::Running,
            EnrollmentState::Waiting { .. } => EnrollmentPhase::Waiting,
            EnrollmentState::BranchPending { .. } => EnrollmentPhase::BranchPending,
            EnrollmentState::Completed => EnrollmentPhase::Completed,
            EnrollmentState::Blocked { .. } => EnrollmentPhase::Blocked,
        }
    }

    /// Completed enrollments no longer hold the (flow, contact) slot.
    pub fn is_open(&self) -> bool {
        !matches!(self, EnrollmentState::Completed)
    }
}

/// State discriminant used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPhase {
    Running,
    Waiting,
    BranchPending,
    Completed,
    Blocked,
}
