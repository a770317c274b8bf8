//! Polling executor: advances due enrollments through their flow graphs.
//!
//! Each pass loads a snapshot of due enrollments and moves each one as far
//! as it can go, chaining instantaneous steps up to `max_steps_per_pass`.
//! Every write is a version compare-and-swap, so overlapping passes never
//! both act on the same enrollment. Side effects are claimed before they are
//! performed: the executed marker is committed first and rolled back if the
//! effect fails.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mailflow_channels::links::LinkExtractor;
use mailflow_core::config::{AppConfig, ExecutorConfig};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::{noop_sink, EventSink};
use mailflow_core::services::{ContactDirectory, EmailSender, EngagementSource, TemplateSource};
use mailflow_core::types::{Contact, FlowEvent, FlowEventType, FlowId};
use mailflow_segmentation::SegmentationEngine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::evaluator::{SideEffect, StepContext, StepEvaluator, StepOutcome};
use crate::graph::{CrossFlowDependency, FlowGraph};
use crate::store::{EnrollmentStore, FlowStore};
use crate::triggers::TriggerMatcher;
use crate::types::{Enrollment, EnrollmentState, Flow, RemovalType, TriggerEvent};

/// Tally of one executor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    pub examined: usize,
    pub advanced: usize,
    pub completed: usize,
    pub blocked: usize,
    pub removed: usize,
    pub conflicts: usize,
    pub failures: usize,
}

/// What happened to one enrollment during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Idle,
    Moved,
    Completed,
    Blocked,
    Retrying,
    Removed,
}

/// External collaborators the executor drives.
#[derive(Clone)]
pub struct ExecutorServices {
    pub contacts: Arc<dyn ContactDirectory>,
    pub mailer: Arc<dyn EmailSender>,
    pub engagement: Arc<dyn EngagementSource>,
    pub templates: Arc<dyn TemplateSource>,
}

pub struct FlowExecutor {
    config: ExecutorConfig,
    node_id: String,
    flows: Arc<FlowStore>,
    enrollments: Arc<EnrollmentStore>,
    matcher: Arc<TriggerMatcher>,
    contacts: Arc<dyn ContactDirectory>,
    mailer: Arc<dyn EmailSender>,
    evaluator: StepEvaluator,
    segments: Option<Arc<SegmentationEngine>>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for FlowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowExecutor")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("enrollments", &self.enrollments.len())
            .finish()
    }
}

impl FlowExecutor {
    pub fn new(
        config: &AppConfig,
        flows: Arc<FlowStore>,
        enrollments: Arc<EnrollmentStore>,
        matcher: Arc<TriggerMatcher>,
        services: ExecutorServices,
    ) -> Self {
        let links = LinkExtractor::new(config.email.unsubscribe_placeholder.clone());
        info!(
            node_id = %config.node_id,
            batch_size = config.executor.batch_size,
            max_steps_per_pass = config.executor.max_steps_per_pass,
            "Flow executor initialized"
        );
        Self {
            config: config.executor.clone(),
            node_id: config.node_id.clone(),
            flows,
            enrollments,
            matcher,
            contacts: services.contacts,
            mailer: services.mailer,
            evaluator: StepEvaluator::new(services.engagement, services.templates, links),
            segments: None,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Segment entries caused by tag or list steps become trigger events.
    pub fn with_segments(mut self, segments: Arc<SegmentationEngine>) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Activates a flow and reports which other active flows its tag steps
    /// would enroll contacts into.
    pub fn activate_flow(&self, flow_id: &FlowId) -> MailflowResult<Vec<CrossFlowDependency>> {
        self.flows.activate(flow_id)?;
        let flow = self
            .flows
            .get(flow_id)
            .ok_or_else(|| MailflowError::NotFound(format!("flow {flow_id}")))?;
        let deps = FlowGraph::new(&flow).cross_flow_dependencies(&self.flows.list());
        for dep in &deps {
            info!(
                flow_id = %flow_id,
                step_id = %dep.step_id,
                tag = %dep.tag,
                dependent_flow_id = %dep.dependent_flow_id,
                "Tag step enrolls contacts into another flow"
            );
            self.event_sink.emit(
                FlowEvent::new(FlowEventType::CrossFlowDependency, Some(*flow_id))
                    .with_step(dep.step_id.clone())
                    .with_detail(format!(
                        "tag '{}' triggers flow '{}'",
                        dep.tag, dep.dependent_flow_name
                    ))
                    .on_node(&self.node_id),
            );
        }
        Ok(deps)
    }

    /// Runs one pass over up to `batch_size` due enrollments.
    pub fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        // Draft and archived flows keep their enrollments in place, paused.
        let paused: HashSet<FlowId> = self
            .flows
            .list()
            .into_iter()
            .filter(|f| !f.is_active())
            .map(|f| f.id)
            .collect();
        let due = self.enrollments.due(now, self.config.batch_size, |e| {
            !paused.contains(&e.flow_id)
        });

        for enrollment in due {
            let enrollment_id = enrollment.id;
            // An earlier step in this pass may have deleted the contact.
            if self.enrollments.get(&enrollment_id).is_none() {
                debug!(enrollment_id = %enrollment_id, "Enrollment removed earlier in pass");
                continue;
            }
            report.examined += 1;
            match self.advance(enrollment, now) {
                Ok(Progress::Idle) => {}
                Ok(Progress::Moved) => report.advanced += 1,
                Ok(Progress::Completed) => {
                    report.advanced += 1;
                    report.completed += 1;
                }
                Ok(Progress::Blocked) => report.blocked += 1,
                Ok(Progress::Retrying) => report.failures += 1,
                Ok(Progress::Removed) => report.removed += 1,
                Err(MailflowError::NotFound(what)) => {
                    debug!(enrollment_id = %enrollment_id, missing = %what, "Enrollment removed mid-pass");
                }
                Err(e) if e.is_claim_conflict() => {
                    debug!(enrollment_id = %enrollment_id, "Enrollment claimed by another pass");
                    metrics::counter!("flow.claim_conflicts").increment(1);
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!(enrollment_id = %enrollment_id, error = %e, "Failed to advance enrollment");
                    report.failures += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                node_id = %self.node_id,
                examined = report.examined,
                advanced = report.advanced,
                completed = report.completed,
                blocked = report.blocked,
                conflicts = report.conflicts,
                failures = report.failures,
                "Executor pass finished"
            );
        }
        metrics::counter!("flow.passes").increment(1);
        report
    }

    fn advance(&self, mut enrollment: Enrollment, now: DateTime<Utc>) -> MailflowResult<Progress> {
        let Some(flow) = self.flows.get(&enrollment.flow_id) else {
            enrollment.last_error = Some("flow no longer exists".into());
            enrollment.set_state(EnrollmentState::Completed)?;
            self.enrollments.commit(enrollment)?;
            return Ok(Progress::Completed);
        };
        if !flow.is_active() {
            return Ok(Progress::Idle);
        }
        let Some(mut contact) = self.contacts.get(&enrollment.contact_id) else {
            enrollment.last_error = Some("contact no longer exists".into());
            enrollment.set_state(EnrollmentState::Completed)?;
            self.enrollments.commit(enrollment)?;
            self.flows.record_completed(&flow.id);
            return Ok(Progress::Completed);
        };

        let graph = FlowGraph::new(&flow);
        let mut dirty = false;

        for _ in 0..self.config.max_steps_per_pass.max(1) {
            let Some(step) = graph.step(&enrollment.current_step_id) else {
                let reason = format!("step {} no longer exists", enrollment.current_step_id);
                return self.block(enrollment, &flow, reason);
            };
            let outcome = {
                let ctx = StepContext {
                    graph: &graph,
                    enrollment: &enrollment,
                    contact: &contact,
                    now,
                };
                self.evaluator.evaluate(&ctx, step)
            };

            match outcome {
                StepOutcome::Pending => {
                    if matches!(enrollment.state, EnrollmentState::BranchPending { .. }) {
                        enrollment.next_check_at = Some(self.recheck_at(now));
                        if !dirty {
                            self.enrollments.commit(enrollment)?;
                            return Ok(Progress::Idle);
                        }
                        dirty = true;
                    }
                    break;
                }
                StepOutcome::Suspend(state) => {
                    enrollment.set_state(state)?;
                    if matches!(enrollment.state, EnrollmentState::BranchPending { .. }) {
                        enrollment.next_check_at = Some(self.recheck_at(now));
                    }
                    dirty = true;
                    break;
                }
                StepOutcome::Advance { next } | StepOutcome::Branch { next, .. } => {
                    enrollment.move_to(next, now)?;
                    dirty = true;
                }
                StepOutcome::Split { branch, next } => {
                    enrollment.split_assignments.insert(step.id.clone(), branch);
                    enrollment.move_to(next, now)?;
                    dirty = true;
                }
                StepOutcome::Execute { effect, next } => {
                    enrollment = self.claim(enrollment, &step.id)?;
                    if let Err(err) = self.apply(&effect, &mut contact, now) {
                        return self.retry_later(enrollment, &flow, &step.id, err);
                    }
                    self.step_executed(&enrollment, &step.id, effect.kind());
                    enrollment.move_to(next, now)?;
                    dirty = true;
                }
                StepOutcome::Jump { flow_id } => {
                    enrollment = self.claim(enrollment, &step.id)?;
                    if let Err(err) = self.matcher.enroll(&flow_id, &contact.id, now) {
                        let reason = format!("cannot enroll into linked flow {flow_id}: {err}");
                        return self.block(enrollment, &flow, reason);
                    }
                    self.step_executed(&enrollment, &step.id, "link_flow");
                    enrollment.move_to(None, now)?;
                    dirty = true;
                }
                StepOutcome::Remove(RemovalType::Unsubscribe) => {
                    enrollment = self.claim(enrollment, &step.id)?;
                    if let Err(err) = self.contacts.unsubscribe(&contact.id) {
                        return self.retry_later(enrollment, &flow, &step.id, err);
                    }
                    self.step_executed(&enrollment, &step.id, "unsubscribe");
                    enrollment.move_to(None, now)?;
                    dirty = true;
                }
                StepOutcome::Remove(RemovalType::DeleteContact) => {
                    enrollment = self.claim(enrollment, &step.id)?;
                    if let Err(err) = self.contacts.delete(&contact.id) {
                        return self.retry_later(enrollment, &flow, &step.id, err);
                    }
                    let removed = self.enrollments.remove_for_contact(&contact.id);
                    info!(
                        contact_id = %contact.id,
                        flow_id = %flow.id,
                        removed,
                        "Contact deleted by flow, enrollments removed"
                    );
                    metrics::counter!("flow.contacts_deleted").increment(1);
                    self.event_sink.emit(
                        FlowEvent::new(FlowEventType::EnrollmentRemoved, Some(flow.id))
                            .for_enrollment(enrollment.id, contact.id)
                            .with_step(step.id.clone())
                            .with_detail(format!("{removed} enrollment(s) removed"))
                            .on_node(&self.node_id),
                    );
                    return Ok(Progress::Removed);
                }
                StepOutcome::Blocked(reason) => return self.block(enrollment, &flow, reason),
            }

            if !enrollment.state.is_open() {
                break;
            }
        }

        if !dirty {
            return Ok(Progress::Idle);
        }
        let committed = self.enrollments.commit(enrollment)?;
        if committed.state == EnrollmentState::Completed {
            self.flows.record_completed(&flow.id);
            metrics::counter!("flow.enrollments_completed").increment(1);
            info!(
                flow_id = %flow.id,
                enrollment_id = %committed.id,
                contact_id = %committed.contact_id,
                "Enrollment completed"
            );
            self.emit(FlowEventType::EnrollmentCompleted, &committed, None);
            return Ok(Progress::Completed);
        }
        Ok(Progress::Moved)
    }

    /// Next engagement re-check for a pending condition. The deadline still
    /// bounds it through `Enrollment::due_at`.
    fn recheck_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ms = self.config.condition_recheck_ms.clamp(1, 86_400_000);
        now + Duration::milliseconds(ms as i64)
    }

    /// Persists the executed marker before the side effect runs.
    fn claim(&self, mut enrollment: Enrollment, step_id: &str) -> MailflowResult<Enrollment> {
        enrollment.executed_steps.insert(step_id.to_string());
        self.enrollments.commit(enrollment)
    }

    fn apply(
        &self,
        effect: &SideEffect,
        contact: &mut Contact,
        now: DateTime<Utc>,
    ) -> MailflowResult<()> {
        match effect {
            SideEffect::SendEmail(request) => {
                let message_id = self.mailer.send(request)?;
                debug!(message_id = %message_id, to = %request.to, "Flow email sent");
                metrics::counter!("flow.emails_sent").increment(1);
                return Ok(());
            }
            SideEffect::AddTags(tags) => {
                let added = self.contacts.add_tags(&contact.id, tags)?;
                for tag in added {
                    self.matcher
                        .handle_event(&TriggerEvent::tag_added(contact.email.clone(), tag), now);
                }
            }
            SideEffect::RemoveTags(tags) => self.contacts.remove_tags(&contact.id, tags)?,
            SideEffect::AddToList(list_id) => {
                if self.contacts.add_to_list(&contact.id, list_id)? {
                    self.matcher.handle_event(
                        &TriggerEvent::list_added(contact.email.clone(), list_id.clone()),
                        now,
                    );
                }
            }
            SideEffect::RemoveFromList(list_id) => {
                self.contacts.remove_from_list(&contact.id, list_id)?
            }
        }

        // Membership changed; pick up the new state and any segment entries.
        if let Some(after) = self.contacts.get(&contact.id) {
            if let Some(segments) = &self.segments {
                for segment_id in segments.entered_segments(contact, &after) {
                    self.matcher.handle_event(
                        &TriggerEvent::segment_entered(after.email.clone(), segment_id.to_string()),
                        now,
                    );
                }
            }
            *contact = after;
        }
        Ok(())
    }

    /// Rolls back the claim and schedules a retry, or blocks once the
    /// attempt budget is spent.
    fn retry_later(
        &self,
        mut enrollment: Enrollment,
        flow: &Flow,
        step_id: &str,
        err: MailflowError,
    ) -> MailflowResult<Progress> {
        enrollment.executed_steps.remove(step_id);
        enrollment.attempts += 1;
        enrollment.last_error = Some(err.to_string());
        warn!(
            flow_id = %flow.id,
            enrollment_id = %enrollment.id,
            step_id = %step_id,
            attempts = enrollment.attempts,
            error = %err,
            "Side effect failed"
        );
        metrics::counter!("flow.side_effect_failures").increment(1);
        self.emit(FlowEventType::SideEffectFailed, &enrollment, Some(err.to_string()));

        if enrollment.attempts >= self.config.max_attempts {
            let reason = format!("gave up after {} attempts: {err}", enrollment.attempts);
            return self.block(enrollment, flow, reason);
        }
        self.enrollments.commit(enrollment)?;
        Ok(Progress::Retrying)
    }

    fn block(&self, mut enrollment: Enrollment, flow: &Flow, reason: String) -> MailflowResult<Progress> {
        enrollment.set_state(EnrollmentState::Blocked {
            reason: reason.clone(),
        })?;
        let committed = self.enrollments.commit(enrollment)?;
        self.flows.record_blocked(&flow.id);
        warn!(
            flow_id = %flow.id,
            enrollment_id = %committed.id,
            step_id = %committed.current_step_id,
            reason = %reason,
            "Enrollment blocked by flow configuration"
        );
        metrics::counter!("flow.enrollments_blocked").increment(1);
        self.emit(FlowEventType::EnrollmentBlocked, &committed, Some(reason));
        Ok(Progress::Blocked)
    }

    fn step_executed(&self, enrollment: &Enrollment, step_id: &str, kind: &str) {
        metrics::counter!("flow.steps_executed", "kind" => kind.to_string()).increment(1);
        self.event_sink.emit(
            FlowEvent::new(FlowEventType::StepExecuted, Some(enrollment.flow_id))
                .for_enrollment(enrollment.id, enrollment.contact_id)
                .with_step(step_id.to_string())
                .with_detail(kind.to_string())
                .on_node(&self.node_id),
        );
    }

    fn emit(&self, event_type: FlowEventType, enrollment: &Enrollment, detail: Option<String>) {
        let mut event = FlowEvent::new(event_type, Some(enrollment.flow_id))
            .for_enrollment(enrollment.id, enrollment.contact_id)
            .with_step(enrollment.current_step_id.clone())
            .on_node(&self.node_id);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.event_sink.emit(event);
    }
}
