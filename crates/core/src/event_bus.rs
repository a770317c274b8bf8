//! Flow activity events and the sinks that receive them.
//!
//! The matcher and executor hold an `Arc<dyn EventSink>`. The binary wires a
//! [`TracingSink`] so activity lands in the structured log; tests capture.

use crate::types::{ContactId, FlowEvent, FlowEventType, FlowId};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FlowEvent) {}
}

/// Writes each event to the `mailflow::activity` log target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FlowEvent) {
        info!(
            target: "mailflow::activity",
            event_type = ?event.event_type,
            flow_id = ?event.flow_id,
            enrollment_id = ?event.enrollment_id,
            contact_id = ?event.contact_id,
            step_id = event.step_id.as_deref().unwrap_or(""),
            detail = event.detail.as_deref().unwrap_or(""),
            node_id = %event.node_id,
            "Flow activity"
        );
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: FlowEventType) -> Vec<FlowEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count_type(&self, event_type: FlowEventType) -> usize {
        self.of_type(event_type).len()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FlowEvent) {
        self.events.lock().push(event);
    }
}

impl FlowEvent {
    pub fn new(event_type: FlowEventType, flow_id: Option<FlowId>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            flow_id,
            enrollment_id: None,
            contact_id: None,
            step_id: None,
            detail: None,
            node_id: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_enrollment(mut self, enrollment_id: Uuid, contact_id: ContactId) -> Self {
        self.enrollment_id = Some(enrollment_id);
        self.contact_id = Some(contact_id);
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn tracing_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
