use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailflow_channels::links::LinkExtractor;
use mailflow_core::services::{EngagementSource, TemplateSource};
use mailflow_core::types::{Contact, EmailRequest, EngagementEvent, EngagementKind, FlowId, StepId};
use rand::Rng;
use tracing::{debug, info};

use crate::graph::{resolve_html, FlowGraph};
use crate::types::{
    ConditionConfig, ConditionType, EmailActionConfig, Enrollment, EnrollmentState, FlowStep,
    ListActionConfig, MembershipAction, RemovalType, SplitBranch, SplitTestConfig, StepConfig,
    UpdateTagConfig,
};

/// A mutation the executor must apply to the outside world.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    SendEmail(EmailRequest),
    AddTags(Vec<String>),
    RemoveTags(Vec<String>),
    AddToList(String),
    RemoveFromList(String),
}

impl SideEffect {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffect::SendEmail(_) => "send_email",
            SideEffect::AddTags(_) => "add_tags",
            SideEffect::RemoveTags(_) => "remove_tags",
            SideEffect::AddToList(_) => "add_to_list",
            SideEffect::RemoveFromList(_) => "remove_from_list",
        }
    }
}

/// Result of evaluating the enrollment's current step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Move on without side effects. `None` completes the run.
    Advance { next: Option<StepId> },
    /// Apply the effect, then move on.
    Execute {
        effect: SideEffect,
        next: Option<StepId>,
    },
    /// Park the enrollment in a waiting state.
    Suspend(EnrollmentState),
    /// Still waiting; nothing to write.
    Pending,
    Branch {
        matched: bool,
        next: Option<StepId>,
    },
    Split {
        branch: SplitBranch,
        next: Option<StepId>,
    },
    /// Enroll into another flow and finish this run.
    Jump { flow_id: FlowId },
    Remove(RemovalType),
    Blocked(String),
}

/// Everything a step needs to know about where it is being evaluated.
pub struct StepContext<'a> {
    pub graph: &'a FlowGraph<'a>,
    pub enrollment: &'a Enrollment,
    pub contact: &'a Contact,
    pub now: DateTime<Utc>,
}

/// Evaluates steps for an enrollment. Pure with respect to stores: it reads
/// engagement and templates but never mutates anything.
pub struct StepEvaluator {
    engagement: Arc<dyn EngagementSource>,
    templates: Arc<dyn TemplateSource>,
    links: LinkExtractor,
}

impl StepEvaluator {
    pub fn new(
        engagement: Arc<dyn EngagementSource>,
        templates: Arc<dyn TemplateSource>,
        links: LinkExtractor,
    ) -> Self {
        Self {
            engagement,
            templates,
            links,
        }
    }

    pub fn evaluate(&self, ctx: &StepContext<'_>, step: &FlowStep) -> StepOutcome {
        debug!(
            step_id = %step.id,
            step_type = step.step_type().as_str(),
            enrollment_id = %ctx.enrollment.id,
            "Evaluating flow step"
        );

        match &step.config {
            StepConfig::Trigger(_) => StepOutcome::Advance {
                next: step.next_step_id.clone(),
            },
            StepConfig::Action(cfg) => self.evaluate_email(ctx, step, cfg),
            StepConfig::Wait(cfg) => {
                let until = match &ctx.enrollment.state {
                    EnrollmentState::Waiting { until } => *until,
                    _ => ctx.enrollment.step_entered_at + cfg.as_duration(),
                };
                resume_or_suspend(
                    ctx,
                    until,
                    StepOutcome::Advance {
                        next: step.next_step_id.clone(),
                    },
                    EnrollmentState::Waiting { until },
                )
            }
            StepConfig::Condition(cfg) => self.evaluate_condition(ctx, step, cfg),
            StepConfig::SplitTest(cfg) => {
                let branch = match ctx.enrollment.split_assignments.get(&step.id) {
                    Some(branch) => *branch,
                    None => roll_split(cfg),
                };
                let next = match branch {
                    SplitBranch::A => step.path_a_step_id.clone(),
                    SplitBranch::B => step.path_b_step_id.clone(),
                };
                StepOutcome::Split { branch, next }
            }
            StepConfig::UpdateTag(cfg) => evaluate_tags(ctx, step, cfg),
            StepConfig::ListAction(cfg) => evaluate_list(ctx, step, cfg),
            StepConfig::LinkFlow(cfg) => match cfg.linked_flow_id {
                Some(flow_id) if flow_id != ctx.graph.flow().id => StepOutcome::Jump { flow_id },
                Some(_) => StepOutcome::Blocked("flow links to itself".into()),
                None => StepOutcome::Blocked("link step has no target flow".into()),
            },
            StepConfig::RemoveAction(cfg) => StepOutcome::Remove(cfg.action_type),
        }
    }

    fn evaluate_email(
        &self,
        ctx: &StepContext<'_>,
        step: &FlowStep,
        cfg: &EmailActionConfig,
    ) -> StepOutcome {
        let next = step.next_step_id.clone();
        if ctx.enrollment.executed_steps.contains(&step.id) {
            return StepOutcome::Advance { next };
        }
        if !ctx.contact.is_active() {
            info!(
                contact_id = %ctx.contact.id,
                step_id = %step.id,
                "Contact unsubscribed, email suppressed"
            );
            return StepOutcome::Advance { next };
        }
        let Some(html) = resolve_html(step, self.templates.as_ref()) else {
            return StepOutcome::Blocked(format!("email step {} has no resolvable content", step.id));
        };
        StepOutcome::Execute {
            effect: SideEffect::SendEmail(EmailRequest {
                contact_id: ctx.contact.id,
                to: ctx.contact.email.clone(),
                flow_id: ctx.graph.flow().id,
                step_id: step.id.clone(),
                subject: cfg.subject.clone(),
                sender: cfg.sender.clone(),
                html,
            }),
            next,
        }
    }

    fn evaluate_condition(
        &self,
        ctx: &StepContext<'_>,
        step: &FlowStep,
        cfg: &ConditionConfig,
    ) -> StepOutcome {
        let Some(email) = ctx.graph.governing_email(&step.id) else {
            return StepOutcome::Blocked(format!(
                "condition {} has no upstream email step",
                step.id
            ));
        };
        let deadline = match &ctx.enrollment.state {
            EnrollmentState::BranchPending { deadline } => *deadline,
            _ => ctx.enrollment.step_entered_at + cfg.timeout(),
        };

        let events = self
            .engagement
            .events_for(&ctx.contact.id, &ctx.graph.flow().id, &email.id);
        if self.engaged(ctx, email, cfg, deadline, &events) {
            return StepOutcome::Branch {
                matched: true,
                next: step.yes_step_id.clone(),
            };
        }
        resume_or_suspend(
            ctx,
            deadline,
            StepOutcome::Branch {
                matched: false,
                next: step.no_step_id.clone(),
            },
            EnrollmentState::BranchPending { deadline },
        )
    }

    /// Whether a qualifying event landed between enrollment and deadline.
    fn engaged(
        &self,
        ctx: &StepContext<'_>,
        email: &FlowStep,
        cfg: &ConditionConfig,
        deadline: DateTime<Utc>,
        events: &[EngagementEvent],
    ) -> bool {
        let wanted = engagement_kind(cfg.condition_type);
        let mut in_window = events.iter().filter(|e| {
            e.kind == wanted && e.occurred_at >= ctx.enrollment.enrolled_at && e.occurred_at <= deadline
        });

        if cfg.condition_type != ConditionType::Clicked {
            return in_window.next().is_some();
        }
        let targets: BTreeSet<String> = if cfg.link_targets.is_empty() {
            resolve_html(email, self.templates.as_ref())
                .map(|html| self.links.urls(&html).into_iter().collect())
                .unwrap_or_default()
        } else {
            cfg.link_targets.clone()
        };
        in_window.any(|e| e.url.as_ref().is_some_and(|url| targets.contains(url)))
    }
}

/// `ready` once `at` has passed; otherwise suspend on first visit and stay
/// pending on later ones.
fn resume_or_suspend(
    ctx: &StepContext<'_>,
    at: DateTime<Utc>,
    ready: StepOutcome,
    suspended: EnrollmentState,
) -> StepOutcome {
    if ctx.now >= at {
        ready
    } else if ctx.enrollment.state == EnrollmentState::Running {
        StepOutcome::Suspend(suspended)
    } else {
        StepOutcome::Pending
    }
}

fn evaluate_tags(ctx: &StepContext<'_>, step: &FlowStep, cfg: &UpdateTagConfig) -> StepOutcome {
    let next = step.next_step_id.clone();
    if ctx.enrollment.executed_steps.contains(&step.id) {
        return StepOutcome::Advance { next };
    }
    if cfg.tags.is_empty() {
        return StepOutcome::Blocked(format!("tag step {} has no tags", step.id));
    }
    let effect = match cfg.action {
        MembershipAction::Add => SideEffect::AddTags(cfg.tags.clone()),
        MembershipAction::Remove => SideEffect::RemoveTags(cfg.tags.clone()),
    };
    StepOutcome::Execute { effect, next }
}

fn evaluate_list(ctx: &StepContext<'_>, step: &FlowStep, cfg: &ListActionConfig) -> StepOutcome {
    let next = step.next_step_id.clone();
    if ctx.enrollment.executed_steps.contains(&step.id) {
        return StepOutcome::Advance { next };
    }
    if cfg.list_id.trim().is_empty() {
        return StepOutcome::Blocked(format!("list step {} has no list", step.id));
    }
    let effect = match cfg.action {
        MembershipAction::Add => SideEffect::AddToList(cfg.list_id.clone()),
        MembershipAction::Remove => SideEffect::RemoveFromList(cfg.list_id.clone()),
    };
    StepOutcome::Execute { effect, next }
}

fn roll_split(cfg: &SplitTestConfig) -> SplitBranch {
    let roll = rand::thread_rng().gen_range(0..100);
    cfg.branch_for_roll(roll)
}

fn engagement_kind(condition: ConditionType) -> EngagementKind {
    match condition {
        ConditionType::Delivered => EngagementKind::Delivered,
        ConditionType::Opened => EngagementKind::Opened,
        ConditionType::Clicked => EngagementKind::Clicked,
        ConditionType::Replied => EngagementKind::Replied,
        ConditionType::Unsubscribed => EngagementKind::Unsubscribed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Duration;
    use mailflow_channels::{EngagementTracker, TemplateLibrary};
    use mailflow_core::types::ContactStatus;

    const EMAIL_HTML: &str =
        r#"<a href="https://x.com/a">A</a><a href="https://x.com/b">B</a><a href="{{unsubscribe_url}}">u</a>"#;

    fn flow(condition: ConditionConfig) -> Flow {
        Flow::new(
            "cond",
            vec![
                FlowStep::new(
                    "t",
                    StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "news")),
                )
                .then("e1"),
                FlowStep::new(
                    "e1",
                    StepConfig::Action(EmailActionConfig::with_html("Hi", EMAIL_HTML)),
                )
                .then("c1"),
                FlowStep::new("c1", StepConfig::Condition(condition)).branches("yes", "no"),
                FlowStep::new("yes", StepConfig::Wait(WaitConfig::default())),
                FlowStep::new("no", StepConfig::Wait(WaitConfig::default())),
            ],
        )
    }

    fn evaluator(tracker: Arc<EngagementTracker>) -> StepEvaluator {
        StepEvaluator::new(tracker, Arc::new(TemplateLibrary::new()), LinkExtractor::default())
    }

    fn click(flow: &Flow, contact: &Contact, url: &str, at: DateTime<Utc>) -> EngagementEvent {
        EngagementEvent {
            contact_id: contact.id,
            flow_id: flow.id,
            step_id: "e1".into(),
            kind: EngagementKind::Clicked,
            url: Some(url.into()),
            occurred_at: at,
        }
    }

    fn at_condition(flow: &Flow, contact: &Contact, entered: DateTime<Utc>) -> Enrollment {
        let mut e = Enrollment::new(flow.id, contact.id, "c1".into(), entered);
        e.executed_steps.insert("e1".into());
        e
    }

    #[test]
    fn test_condition_suspends_then_times_out_to_no() {
        let flow = flow(ConditionConfig::new(ConditionType::Opened, 2, TimeUnit::Days));
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let t0 = Utc::now();
        let mut enrollment = at_condition(&flow, &contact, t0);
        let eval = evaluator(Arc::new(EngagementTracker::new()));
        let step = flow.step("c1").unwrap();

        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: t0 };
        let deadline = t0 + Duration::days(2);
        assert_eq!(
            eval.evaluate(&ctx, step),
            StepOutcome::Suspend(EnrollmentState::BranchPending { deadline })
        );

        enrollment.state = EnrollmentState::BranchPending { deadline };
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: t0 + Duration::days(1) };
        assert_eq!(eval.evaluate(&ctx, step), StepOutcome::Pending);

        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: deadline };
        assert_eq!(
            eval.evaluate(&ctx, step),
            StepOutcome::Branch { matched: false, next: Some("no".into()) }
        );
    }

    #[test]
    fn test_clicked_any_extracted_link() {
        let flow = flow(ConditionConfig::new(ConditionType::Clicked, 1, TimeUnit::Days));
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let t0 = Utc::now();
        let enrollment = at_condition(&flow, &contact, t0);
        let tracker = Arc::new(EngagementTracker::new());
        let eval = evaluator(Arc::clone(&tracker));
        let step = flow.step("c1").unwrap();
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: t0 + Duration::hours(1) };

        tracker.record(click(&flow, &contact, "{{unsubscribe_url}}", t0 + Duration::minutes(5)));
        assert!(matches!(eval.evaluate(&ctx, step), StepOutcome::Suspend(_)));

        tracker.record(click(&flow, &contact, "https://x.com/b", t0 + Duration::minutes(10)));
        assert_eq!(
            eval.evaluate(&ctx, step),
            StepOutcome::Branch { matched: true, next: Some("yes".into()) }
        );
    }

    #[test]
    fn test_clicked_specific_target() {
        let flow = flow(
            ConditionConfig::new(ConditionType::Clicked, 1, TimeUnit::Days)
                .with_link_targets(["https://x.com/a"]),
        );
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let t0 = Utc::now();
        let enrollment = at_condition(&flow, &contact, t0);
        let tracker = Arc::new(EngagementTracker::new());
        let eval = evaluator(Arc::clone(&tracker));
        let step = flow.step("c1").unwrap();
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: t0 + Duration::hours(2) };

        tracker.record(click(&flow, &contact, "https://x.com/b", t0 + Duration::hours(1)));
        assert!(matches!(eval.evaluate(&ctx, step), StepOutcome::Suspend(_)));

        tracker.record(click(&flow, &contact, "https://x.com/a", t0 + Duration::hours(1)));
        assert!(matches!(eval.evaluate(&ctx, step), StepOutcome::Branch { matched: true, .. }));
    }

    #[test]
    fn test_events_before_enrollment_do_not_count() {
        let flow = flow(ConditionConfig::new(ConditionType::Clicked, 1, TimeUnit::Days));
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let t0 = Utc::now();
        let enrollment = at_condition(&flow, &contact, t0);
        let tracker = Arc::new(EngagementTracker::new());
        tracker.record(click(&flow, &contact, "https://x.com/a", t0 - Duration::days(3)));
        let eval = evaluator(tracker);
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: t0 + Duration::days(1) };
        assert_eq!(
            eval.evaluate(&ctx, flow.step("c1").unwrap()),
            StepOutcome::Branch { matched: false, next: Some("no".into()) }
        );
    }

    #[test]
    fn test_condition_without_email_blocks() {
        let mut flow = flow(ConditionConfig::default());
        flow.steps[0].next_step_id = Some("c1".into());
        flow.steps.remove(1);
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let enrollment = Enrollment::new(flow.id, contact.id, "c1".into(), Utc::now());
        let eval = evaluator(Arc::new(EngagementTracker::new()));
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: Utc::now() };
        assert!(matches!(eval.evaluate(&ctx, flow.step("c1").unwrap()), StepOutcome::Blocked(_)));
    }

    #[test]
    fn test_email_step_is_sent_once_and_suppressed_for_unsubscribed() {
        let flow = flow(ConditionConfig::default());
        let graph = FlowGraph::new(&flow);
        let mut contact = Contact::new("a@example.com");
        let mut enrollment = Enrollment::new(flow.id, contact.id, "e1".into(), Utc::now());
        let eval = evaluator(Arc::new(EngagementTracker::new()));
        let step = flow.step("e1").unwrap();

        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: Utc::now() };
        match eval.evaluate(&ctx, step) {
            StepOutcome::Execute { effect: SideEffect::SendEmail(req), next } => {
                assert_eq!(req.to, "a@example.com");
                assert_eq!(req.step_id, "e1");
                assert_eq!(next.as_deref(), Some("c1"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        enrollment.executed_steps.insert("e1".into());
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: Utc::now() };
        assert_eq!(eval.evaluate(&ctx, step), StepOutcome::Advance { next: Some("c1".into()) });

        enrollment.executed_steps.clear();
        contact.status = ContactStatus::Unsubscribed;
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: Utc::now() };
        assert_eq!(eval.evaluate(&ctx, step), StepOutcome::Advance { next: Some("c1".into()) });
    }

    #[test]
    fn test_split_assignment_is_sticky() {
        let flow = Flow::new(
            "split",
            vec![FlowStep::new("s", StepConfig::SplitTest(SplitTestConfig::new(1))).paths("a", "b")],
        );
        let graph = FlowGraph::new(&flow);
        let contact = Contact::new("a@example.com");
        let mut enrollment = Enrollment::new(flow.id, contact.id, "s".into(), Utc::now());
        enrollment.split_assignments.insert("s".into(), SplitBranch::A);
        let eval = evaluator(Arc::new(EngagementTracker::new()));
        let ctx = StepContext { graph: &graph, enrollment: &enrollment, contact: &contact, now: Utc::now() };
        for _ in 0..20 {
            assert_eq!(
                eval.evaluate(&ctx, flow.step("s").unwrap()),
                StepOutcome::Split { branch: SplitBranch::A, next: Some("a".into()) }
            );
        }
    }

    #[test]
    fn test_split_roll_follows_weights() {
        let cfg = SplitTestConfig::new(80);
        let a = (0..2000).filter(|_| roll_split(&cfg) == SplitBranch::A).count();
        assert!((1400..=1800).contains(&a), "A assigned {a} times");
    }
}
