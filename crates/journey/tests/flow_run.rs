use std::sync::Arc;

use chrono::{Duration, Utc};
use mailflow_cdp::ContactStore;
use mailflow_channels::{EngagementTracker, LinkExtractor, OutboxMailer, TemplateLibrary};
use mailflow_core::config::AppConfig;
use mailflow_core::event_bus::capture_sink;
use mailflow_core::services::ContactDirectory;
use mailflow_core::types::{Contact, EngagementKind, FlowEventType};
use mailflow_journey::{
    EnrollmentState, EnrollmentStore, ExecutorServices, Flow, FlowExecutor, FlowGraph, FlowStore,
    TriggerEvent, TriggerMatcher,
};
use mailflow_segmentation::{SegmentBuilder, SegmentationEngine};

const FLOW_JSON: &str = r#"{
  "id": "6f1c2a9e-3b1d-4d8e-9a44-2f6e1c0b7d11",
  "name": "Onboarding",
  "status": "draft",
  "steps": [
    {"id": "t", "type": "trigger", "config": {"triggerType": "list", "targetId": "newsletter"}, "nextStepId": "e1"},
    {"id": "e1", "type": "action",
     "config": {"subject": "Welcome", "html": "<a href=\"https://x.com/guide\">Read the <b>guide</b></a> <a href=\"{{unsubscribe_url}}\">bye</a>"},
     "nextStepId": "w1"},
    {"id": "w1", "type": "wait", "config": {"duration": 30, "unit": "minutes"}, "nextStepId": "c1"},
    {"id": "c1", "type": "condition",
     "config": {"conditionType": "clicked", "waitDuration": 2, "waitUnit": "days"},
     "yesStepId": "tag", "noStepId": "e2"},
    {"id": "tag", "type": "update_tag", "config": {"action": "add", "tags": ["Engaged"]}},
    {"id": "e2", "type": "action", "config": {"subject": "Reminder", "html": "<p>psst</p>"}}
  ]
}"#;

struct World {
    flows: Arc<FlowStore>,
    enrollments: Arc<EnrollmentStore>,
    contacts: Arc<ContactStore>,
    mailer: Arc<OutboxMailer>,
    tracker: Arc<EngagementTracker>,
    templates: Arc<TemplateLibrary>,
    matcher: Arc<TriggerMatcher>,
    executor: FlowExecutor,
}

fn world(segments: Arc<SegmentationEngine>) -> (World, Arc<mailflow_core::event_bus::CaptureSink>) {
    let config = AppConfig::default();
    let sink = capture_sink();
    let flows = Arc::new(FlowStore::new());
    let enrollments = Arc::new(EnrollmentStore::new());
    let contacts = Arc::new(ContactStore::new());
    let mailer = Arc::new(OutboxMailer::new(config.email.clone()));
    let tracker = Arc::new(EngagementTracker::new());
    let templates = Arc::new(TemplateLibrary::new());
    let matcher = Arc::new(
        TriggerMatcher::new(
            Arc::clone(&flows),
            Arc::clone(&enrollments),
            contacts.clone(),
            config.node_id.clone(),
        )
        .with_event_sink(sink.clone()),
    );
    let executor = FlowExecutor::new(
        &config,
        Arc::clone(&flows),
        Arc::clone(&enrollments),
        Arc::clone(&matcher),
        ExecutorServices {
            contacts: contacts.clone(),
            mailer: mailer.clone(),
            engagement: tracker.clone(),
            templates: templates.clone(),
        },
    )
    .with_segments(segments)
    .with_event_sink(sink.clone());
    (
        World {
            flows,
            enrollments,
            contacts,
            mailer,
            tracker,
            templates,
            matcher,
            executor,
        },
        sink,
    )
}

#[test]
fn clicked_contact_is_tagged_and_enters_segment_flow() {
    let segments = Arc::new(SegmentationEngine::new());
    let engaged = SegmentBuilder::new("Engaged").has_tag("engaged").build();
    let engaged_id = engaged.id;
    segments.register_segment(engaged);
    let (w, sink) = world(Arc::clone(&segments));

    let flow: Flow = serde_json::from_str(FLOW_JSON).unwrap();
    let flow_id = w.flows.insert(flow).unwrap();
    let deps = w.executor.activate_flow(&flow_id).unwrap();
    assert!(deps.is_empty());

    let follow_up: Flow = serde_json::from_value(serde_json::json!({
        "id": "0b5a7c1e-8f2d-4c3b-a6e9-1d2c3b4a5f60",
        "name": "Engaged follow-up",
        "status": "active",
        "steps": [
            {"id": "t", "type": "trigger",
             "config": {"triggerType": "segment", "targetId": engaged_id.to_string()},
             "nextStepId": "e1"},
            {"id": "e1", "type": "action", "config": {"subject": "Thanks", "html": "<p>thanks</p>"}}
        ]
    }))
    .unwrap();
    let follow_up_id = w.flows.insert(follow_up).unwrap();

    // Offered click targets exclude the unsubscribe link.
    let stored = w.flows.get(&flow_id).unwrap();
    let links = FlowGraph::new(&stored)
        .link_targets("c1", w.templates.as_ref(), &LinkExtractor::default())
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].label, "Read the guide");

    let contact = Contact::new("grace@example.com").with_list("newsletter");
    w.contacts.upsert(contact.clone()).unwrap();
    let t0 = Utc::now();
    let created = w
        .matcher
        .handle_event(&TriggerEvent::list_added("Grace@Example.com", "newsletter"), t0);
    assert_eq!(created.len(), 1);
    let enrollment_id = created[0].id;

    // Welcome goes out, then the legacy minute wait parks for one hour.
    w.executor.run_pass(t0);
    assert_eq!(w.mailer.sent_count(), 1);
    let parked = w.enrollments.get(&enrollment_id).unwrap();
    assert_eq!(parked.current_step_id, "w1");
    assert_eq!(
        parked.state,
        EnrollmentState::Waiting {
            until: parked.step_entered_at + Duration::hours(1)
        }
    );

    let message_id = w.mailer.sent()[0].message_id.clone();
    w.tracker
        .record_for_message(
            &w.mailer,
            &message_id,
            EngagementKind::Clicked,
            Some("https://x.com/guide".into()),
            t0 + Duration::minutes(20),
        )
        .unwrap();

    let report = w.executor.run_pass(t0 + Duration::hours(1));
    assert_eq!(report.completed, 1);
    assert!(w.contacts.get(&contact.id).unwrap().has_tag("Engaged"));
    assert_eq!(w.mailer.sent_count(), 1);

    // The tag put the contact into the segment, which enrolled them.
    assert!(w.enrollments.find_open(&follow_up_id, &contact.id).is_some());
    w.executor.run_pass(t0 + Duration::hours(1));
    assert_eq!(w.mailer.sent_count(), 2);

    let onboarding = w.flows.get(&flow_id).unwrap();
    assert_eq!(onboarding.stats.enrolled, 1);
    assert_eq!(onboarding.stats.completed, 1);
    assert_eq!(sink.count_type(FlowEventType::EnrollmentCreated), 2);
}

#[test]
fn silent_contact_gets_reminder_after_timeout() {
    let (w, _) = world(Arc::new(SegmentationEngine::new()));
    let flow: Flow = serde_json::from_str(FLOW_JSON).unwrap();
    let flow_id = w.flows.insert(flow).unwrap();
    w.flows.activate(&flow_id).unwrap();

    w.contacts.upsert(Contact::new("quiet@example.com")).unwrap();
    let t0 = Utc::now();
    w.matcher
        .handle_event(&TriggerEvent::list_added("quiet@example.com", "newsletter"), t0);

    w.executor.run_pass(t0);
    w.executor.run_pass(t0 + Duration::hours(1));
    assert_eq!(w.mailer.sent_count(), 1);
    assert_eq!(
        w.executor.run_pass(t0 + Duration::hours(30)).completed,
        0
    );

    let report = w.executor.run_pass(t0 + Duration::hours(1) + Duration::days(2));
    assert_eq!(report.completed, 1);
    let sent = w.mailer.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].request.subject, "Reminder");

    // A finished run frees the slot; the next trigger starts a fresh run.
    let again = w.matcher.handle_event(
        &TriggerEvent::list_added("quiet@example.com", "newsletter"),
        t0 + Duration::days(5),
    );
    assert_eq!(again.len(), 1);
}

#[test]
fn archived_flow_freezes_in_flight_enrollments() {
    let (w, _) = world(Arc::new(SegmentationEngine::new()));
    let flow: Flow = serde_json::from_str(FLOW_JSON).unwrap();
    let flow_id = w.flows.insert(flow).unwrap();
    w.flows.activate(&flow_id).unwrap();
    w.contacts.upsert(Contact::new("arch@example.com")).unwrap();
    let t0 = Utc::now();
    w.matcher
        .handle_event(&TriggerEvent::list_added("arch@example.com", "newsletter"), t0);
    w.executor.run_pass(t0);

    w.flows.archive(&flow_id).unwrap();
    let report = w.executor.run_pass(t0 + Duration::days(10));
    assert_eq!(report.advanced, 0);
    assert_eq!(w.mailer.sent_count(), 1);
    assert!(w
        .matcher
        .handle_event(&TriggerEvent::list_added("arch@example.com", "newsletter"), t0)
        .is_empty());
    assert!(w.contacts.find_by_email("arch@example.com").is_some());
}
