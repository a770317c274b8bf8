//! Demonstration flows for local development.

use chrono::Utc;
use tracing::info;

use crate::types::{
    ConditionConfig, ConditionType, EmailActionConfig, Flow, FlowStatus, FlowStep,
    MembershipAction, SplitTestConfig, StepConfig, TimeUnit, TriggerConfig, TriggerType,
    UpdateTagConfig, WaitConfig,
};

const WELCOME_HTML: &str = r#"<h1>Welcome aboard</h1>
<p>Start with our <a href="https://mailflow.local/guide">getting started guide</a>
or browse the <a href="https://mailflow.local/shop">shop</a>.</p>
<p><a href="{{unsubscribe_url}}">Unsubscribe</a></p>"#;

/// Welcome series, VIP upgrade, and an A/B re-engagement flow. All active.
pub fn demo_flows() -> Vec<Flow> {
    info!("Seeding demo flows");
    let now = Utc::now();

    let welcome = Flow::new(
        "Welcome Series",
        vec![
            FlowStep::new(
                "trigger",
                StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "newsletter")),
            )
            .labeled("Joined newsletter")
            .then("welcome-email"),
            FlowStep::new(
                "welcome-email",
                StepConfig::Action(EmailActionConfig::with_html("Welcome!", WELCOME_HTML)),
            )
            .then("wait-2d"),
            FlowStep::new("wait-2d", StepConfig::Wait(WaitConfig::new(2, TimeUnit::Days)))
                .then("clicked-guide"),
            FlowStep::new(
                "clicked-guide",
                StepConfig::Condition(
                    ConditionConfig::new(ConditionType::Clicked, 3, TimeUnit::Days)
                        .with_link_targets(["https://mailflow.local/guide"]),
                ),
            )
            .labeled("Read the guide?")
            .branches("tag-engaged", "nudge-email"),
            FlowStep::new(
                "tag-engaged",
                StepConfig::UpdateTag(UpdateTagConfig::new(MembershipAction::Add, ["vip"])),
            ),
            FlowStep::new(
                "nudge-email",
                StepConfig::Action(EmailActionConfig::with_html(
                    "Did you see this?",
                    r#"<p>Your <a href="https://mailflow.local/guide">guide</a> is waiting.</p>"#,
                )),
            ),
        ],
    );

    let vip = Flow::new(
        "VIP Upgrade",
        vec![
            FlowStep::new(
                "trigger",
                StepConfig::Trigger(TriggerConfig::new(TriggerType::Tag, "vip")),
            )
            .then("vip-email"),
            FlowStep::new(
                "vip-email",
                StepConfig::Action(EmailActionConfig::with_html(
                    "You're a VIP",
                    "<p>Thanks for being one of our most engaged readers.</p>",
                )),
            ),
        ],
    );

    let winback = Flow::new(
        "Win-back A/B",
        vec![
            FlowStep::new(
                "trigger",
                StepConfig::Trigger(TriggerConfig::new(TriggerType::CustomEvent, "inactive-90d")),
            )
            .then("split"),
            FlowStep::new("split", StepConfig::SplitTest(SplitTestConfig::new(50)))
                .paths("discount-email", "story-email"),
            FlowStep::new(
                "discount-email",
                StepConfig::Action(EmailActionConfig::with_html(
                    "20% off, just for you",
                    r#"<a href="https://mailflow.local/shop?code=BACK20">Shop now</a>"#,
                )),
            ),
            FlowStep::new(
                "story-email",
                StepConfig::Action(EmailActionConfig::with_html(
                    "What's new",
                    r#"<a href="https://mailflow.local/blog">Read the latest</a>"#,
                )),
            ),
        ],
    );

    [welcome, vip, winback]
        .into_iter()
        .map(|mut flow| {
            flow.status = FlowStatus::Active;
            flow.created_at = now;
            flow.updated_at = now;
            flow
        })
        .collect()
}
