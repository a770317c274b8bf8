//! Inbound-event matching: finds active flows whose trigger matches an event
//! and enrolls the contact, at most once per open (flow, contact) pair.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::event_bus::{noop_sink, EventSink};
use mailflow_core::services::ContactDirectory;
use mailflow_core::types::{Contact, ContactId, FlowEvent, FlowEventType, FlowId};
use tracing::{info, warn};

use crate::store::{EnrollmentStore, FlowStore};
use crate::types::{Enrollment, Flow, FlowStatus, TriggerEvent};

pub struct TriggerMatcher {
    flows: Arc<FlowStore>,
    enrollments: Arc<EnrollmentStore>,
    contacts: Arc<dyn ContactDirectory>,
    event_sink: Arc<dyn EventSink>,
    node_id: String,
}

impl TriggerMatcher {
    pub fn new(
        flows: Arc<FlowStore>,
        enrollments: Arc<EnrollmentStore>,
        contacts: Arc<dyn ContactDirectory>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            flows,
            enrollments,
            contacts,
            event_sink: noop_sink(),
            node_id: node_id.into(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Active flows whose trigger matches the event.
    pub fn matching_flows(&self, event: &TriggerEvent) -> Vec<Flow> {
        self.flows
            .active()
            .into_iter()
            .filter(|f| f.trigger_config().is_some_and(|t| t.matches(event)))
            .collect()
    }

    /// Enrolls the event's contact into every matching flow. Unknown
    /// contacts are skipped. Returns the enrollments that were created.
    pub fn handle_event(&self, event: &TriggerEvent, now: DateTime<Utc>) -> Vec<Enrollment> {
        let Some(contact) = self.contacts.find_by_email(&event.contact_email) else {
            warn!(
                email = %event.contact_email,
                trigger_type = ?event.trigger_type,
                "Trigger event for unknown contact, skipping"
            );
            metrics::counter!("flow.trigger_unknown_contact").increment(1);
            return Vec::new();
        };

        self.matching_flows(event)
            .iter()
            .filter_map(|flow| self.enroll_contact(flow, &contact, now))
            .collect()
    }

    /// Enrolls a contact directly, as a link-flow step does. The target must
    /// be active. Returns `None` when the contact already has an open
    /// enrollment in that flow.
    pub fn enroll(
        &self,
        flow_id: &FlowId,
        contact_id: &ContactId,
        now: DateTime<Utc>,
    ) -> MailflowResult<Option<Enrollment>> {
        let flow = self
            .flows
            .get(flow_id)
            .ok_or_else(|| MailflowError::NotFound(format!("flow {flow_id}")))?;
        if flow.status != FlowStatus::Active {
            return Err(MailflowError::Validation(format!(
                "flow {flow_id} is not active"
            )));
        }
        let contact = self
            .contacts
            .get(contact_id)
            .ok_or_else(|| MailflowError::NotFound(format!("contact {contact_id}")))?;
        Ok(self.enroll_contact(&flow, &contact, now))
    }

    fn enroll_contact(&self, flow: &Flow, contact: &Contact, now: DateTime<Utc>) -> Option<Enrollment> {
        let trigger = flow.trigger()?;
        let enrollment = self
            .enrollments
            .open(flow.id, contact.id, trigger.id.clone(), now)?;
        self.flows.record_enrolled(&flow.id);

        metrics::counter!("flow.enrollments_created").increment(1);
        info!(
            flow_id = %flow.id,
            contact_id = %contact.id,
            enrollment_id = %enrollment.id,
            "Contact enrolled"
        );
        self.event_sink.emit(
            FlowEvent::new(FlowEventType::EnrollmentCreated, Some(flow.id))
                .for_enrollment(enrollment.id, contact.id)
                .with_step(trigger.id.clone())
                .on_node(&self.node_id),
        );
        Some(enrollment)
    }
}
