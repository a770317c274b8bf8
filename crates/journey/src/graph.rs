//! Read-only graph view over a flow's steps.
//!
//! Steps live in a flat list and reference each other by id, so cycles and
//! diamonds are representable. Every traversal here keeps a visited set.

use std::collections::{HashMap, HashSet, VecDeque};

use mailflow_channels::links::{EmailLink, LinkExtractor};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::services::TemplateSource;
use mailflow_core::types::FlowId;
use serde::{Deserialize, Serialize};

use crate::types::{
    EmailContent, Flow, FlowStatus, FlowStep, MembershipAction, StepConfig, StepType, TriggerType,
};

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphIssue {
    pub step_id: Option<String>,
    pub message: String,
}

impl GraphIssue {
    fn flow(message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            message: message.into(),
        }
    }

    fn step(step_id: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            message: message.into(),
        }
    }
}

/// Errors block activation; warnings are informational.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphReport {
    pub errors: Vec<GraphIssue>,
    pub warnings: Vec<GraphIssue>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// An update-tag step whose tag enrolls contacts into another active flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossFlowDependency {
    pub step_id: String,
    pub tag: String,
    pub dependent_flow_id: FlowId,
    pub dependent_flow_name: String,
}

pub struct FlowGraph<'a> {
    flow: &'a Flow,
    steps: HashMap<&'a str, &'a FlowStep>,
    inbound: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> FlowGraph<'a> {
    pub fn new(flow: &'a Flow) -> Self {
        let mut steps = HashMap::with_capacity(flow.steps.len());
        let mut inbound: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &flow.steps {
            steps.entry(step.id.as_str()).or_insert(step);
        }
        for step in &flow.steps {
            for (_, target) in step.outgoing() {
                let parents = inbound.entry(target.as_str()).or_default();
                if !parents.contains(&step.id.as_str()) {
                    parents.push(step.id.as_str());
                }
            }
        }
        Self {
            flow,
            steps,
            inbound,
        }
    }

    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    pub fn step(&self, id: &str) -> Option<&'a FlowStep> {
        self.steps.get(id).copied()
    }

    pub fn parents(&self, id: &str) -> &[&'a str] {
        self.inbound.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// The nearest `action` ancestor of `step_id`, searched breadth-first
    /// over inbound edges. Terminates on cycles and shared ancestors.
    pub fn governing_email(&self, step_id: &str) -> Option<&'a FlowStep> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(step_id);
        for &parent in self.parents(step_id) {
            if visited.insert(parent) {
                queue.push_back(parent);
            }
        }

        while let Some(id) = queue.pop_front() {
            let Some(step) = self.step(id) else {
                continue;
            };
            if step.step_type() == StepType::Action {
                return Some(step);
            }
            for &parent in self.parents(id) {
                if visited.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        None
    }

    /// Step ids reachable from the trigger.
    pub fn reachable(&self) -> HashSet<&'a str> {
        let mut visited = HashSet::new();
        let Some(trigger) = self.flow.trigger() else {
            return visited;
        };
        let mut stack = vec![trigger.id.as_str()];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(step) = self.step(id) {
                for (_, target) in step.outgoing() {
                    if self.steps.contains_key(target.as_str()) {
                        stack.push(target.as_str());
                    }
                }
            }
        }
        visited
    }

    /// Structural and per-step configuration checks.
    pub fn validate(&self) -> GraphReport {
        let mut report = GraphReport::default();

        let triggers: Vec<&FlowStep> = self
            .flow
            .steps
            .iter()
            .filter(|s| s.step_type() == StepType::Trigger)
            .collect();
        match triggers.len() {
            0 => report.errors.push(GraphIssue::flow("flow has no trigger step")),
            1 => {}
            n => report
                .errors
                .push(GraphIssue::flow(format!("flow has {n} trigger steps, expected one"))),
        }

        let mut seen = HashSet::new();
        for step in &self.flow.steps {
            if step.id.trim().is_empty() {
                report.errors.push(GraphIssue::flow("step with empty id"));
            } else if !seen.insert(step.id.as_str()) {
                report
                    .errors
                    .push(GraphIssue::step(&step.id, "duplicate step id"));
            }
        }

        for step in &self.flow.steps {
            self.check_edges(step, &mut report);
            self.check_config(step, &mut report);
        }

        if triggers.len() == 1 {
            let reachable = self.reachable();
            for step in &self.flow.steps {
                if !reachable.contains(step.id.as_str()) {
                    report.warnings.push(GraphIssue::step(
                        &step.id,
                        "step is not reachable from the trigger",
                    ));
                }
            }
        }

        report
    }

    fn check_edges(&self, step: &FlowStep, report: &mut GraphReport) {
        let allowed = step.step_type().allowed_edges();
        for (kind, target) in step.outgoing() {
            if !allowed.contains(&kind) {
                report.errors.push(GraphIssue::step(
                    &step.id,
                    format!(
                        "{} step cannot have {}",
                        step.step_type().as_str(),
                        kind.field_name()
                    ),
                ));
            }
            match self.step(target) {
                None => report.errors.push(GraphIssue::step(
                    &step.id,
                    format!("{} references unknown step {target}", kind.field_name()),
                )),
                Some(t) if t.step_type() == StepType::Trigger => report.errors.push(
                    GraphIssue::step(&step.id, "edges cannot point at the trigger step"),
                ),
                Some(_) => {}
            }
        }
    }

    fn check_config(&self, step: &FlowStep, report: &mut GraphReport) {
        match &step.config {
            StepConfig::Trigger(cfg) => {
                if cfg.target_id.trim().is_empty() {
                    report
                        .errors
                        .push(GraphIssue::step(&step.id, "trigger has no target"));
                }
            }
            StepConfig::Action(cfg) => {
                if cfg.content().is_none() {
                    report.errors.push(GraphIssue::step(
                        &step.id,
                        "email step needs a template or inline HTML",
                    ));
                }
                if cfg.subject.trim().is_empty() {
                    report
                        .warnings
                        .push(GraphIssue::step(&step.id, "email step has no subject"));
                }
            }
            StepConfig::Condition(_) => {
                if self.governing_email(&step.id).is_none() {
                    report.errors.push(GraphIssue::step(
                        &step.id,
                        "condition has no upstream email step",
                    ));
                }
            }
            StepConfig::SplitTest(cfg) => {
                if !cfg.is_valid() {
                    report.errors.push(GraphIssue::step(
                        &step.id,
                        "split ratios must be within 1..=99 and sum to 100",
                    ));
                }
            }
            StepConfig::UpdateTag(cfg) => {
                if cfg.tags.is_empty() {
                    report
                        .errors
                        .push(GraphIssue::step(&step.id, "tag step has no tags"));
                }
            }
            StepConfig::ListAction(cfg) => {
                if cfg.list_id.trim().is_empty() {
                    report
                        .errors
                        .push(GraphIssue::step(&step.id, "list step has no list"));
                }
            }
            StepConfig::LinkFlow(cfg) => match cfg.linked_flow_id {
                None => report
                    .errors
                    .push(GraphIssue::step(&step.id, "link step has no target flow")),
                Some(id) if id == self.flow.id => report
                    .errors
                    .push(GraphIssue::step(&step.id, "flow cannot link to itself")),
                Some(_) => {}
            },
            StepConfig::Wait(_) | StepConfig::RemoveAction(_) => {}
        }
    }

    /// Links of the email governing a `clicked` condition.
    pub fn link_targets(
        &self,
        step_id: &str,
        templates: &dyn TemplateSource,
        extractor: &LinkExtractor,
    ) -> MailflowResult<Vec<EmailLink>> {
        let email = self
            .governing_email(step_id)
            .ok_or_else(|| self.invalid(step_id, "no upstream email step"))?;
        let html = resolve_html(email, templates)
            .ok_or_else(|| self.invalid(&email.id, "email content cannot be resolved"))?;
        Ok(extractor.extract(&html))
    }

    /// Update-tag steps that add a tag another active flow is triggered by.
    pub fn cross_flow_dependencies(&self, others: &[Flow]) -> Vec<CrossFlowDependency> {
        let mut deps = Vec::new();
        for step in &self.flow.steps {
            let StepConfig::UpdateTag(cfg) = &step.config else {
                continue;
            };
            if cfg.action != MembershipAction::Add {
                continue;
            }
            for other in others {
                if other.id == self.flow.id || other.status != FlowStatus::Active {
                    continue;
                }
                let Some(trigger) = other.trigger_config() else {
                    continue;
                };
                if trigger.trigger_type != TriggerType::Tag {
                    continue;
                }
                for tag in &cfg.tags {
                    if tag.eq_ignore_ascii_case(&trigger.target_id) {
                        deps.push(CrossFlowDependency {
                            step_id: step.id.clone(),
                            tag: tag.clone(),
                            dependent_flow_id: other.id,
                            dependent_flow_name: other.name.clone(),
                        });
                    }
                }
            }
        }
        deps
    }

    /// Flows a link-flow step in this flow may point at.
    pub fn link_flow_candidates<'f>(&self, flows: &'f [Flow]) -> Vec<&'f Flow> {
        flows
            .iter()
            .filter(|f| f.id != self.flow.id && f.status == FlowStatus::Active)
            .filter(|f| {
                f.trigger_config()
                    .map(|t| t.trigger_type != TriggerType::Campaign)
                    .unwrap_or(true)
            })
            .collect()
    }

    fn invalid(&self, step_id: &str, reason: &str) -> MailflowError {
        MailflowError::InvalidFlow {
            flow_id: self.flow.id,
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Compiled HTML for an email step: template content or inline HTML.
pub fn resolve_html(step: &FlowStep, templates: &dyn TemplateSource) -> Option<String> {
    let StepConfig::Action(cfg) = &step.config else {
        return None;
    };
    match cfg.content()? {
        EmailContent::Template(id) => templates.compiled_html(id),
        EmailContent::Html(html) => Some(html.to_string()),
    }
}
