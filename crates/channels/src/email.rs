//! Outbound email and engagement tracking.
//!
//! `OutboxMailer` is the development mail transport: it records every
//! message it accepts and can be switched into a failing mode to exercise
//! retry handling. `EngagementTracker` stores delivered/opened/clicked/replied/
//! unsubscribed signals keyed by the flow step that sent the email.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mailflow_core::config::EmailConfig;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::services::{EmailSender, EngagementSource};
use mailflow_core::types::{ContactId, EmailRequest, EngagementEvent, EngagementKind, FlowId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// A message accepted by the outbox.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub message_id: String,
    pub from: String,
    pub request: EmailRequest,
    pub sent_at: DateTime<Utc>,
}

pub struct OutboxMailer {
    config: EmailConfig,
    sent: Mutex<Vec<SentEmail>>,
    by_message_id: DashMap<String, usize>,
    failing: AtomicBool,
}

impl OutboxMailer {
    pub fn new(config: EmailConfig) -> Self {
        info!(from = %config.from_email, "Outbox mailer initialized");
        Self {
            config,
            sent: Mutex::new(Vec::new()),
            by_message_id: DashMap::new(),
            failing: AtomicBool::new(false),
        }
    }

    /// While set, every send is rejected.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn lookup(&self, message_id: &str) -> Option<SentEmail> {
        let index = *self.by_message_id.get(message_id)?;
        self.sent.lock().get(index).cloned()
    }

    fn sender_for(&self, request: &EmailRequest) -> String {
        request
            .sender
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("{} <{}>", self.config.from_name, self.config.from_email))
    }
}

impl EmailSender for OutboxMailer {
    fn send(&self, request: &EmailRequest) -> MailflowResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            metrics::counter!("mailer.send_failures").increment(1);
            warn!(to = %request.to, step_id = %request.step_id, "Mail transport unavailable");
            return Err(MailflowError::SideEffect(format!(
                "mail transport rejected message to {}",
                request.to
            )));
        }

        let message_id = format!("mf-{}", uuid::Uuid::new_v4());
        let entry = SentEmail {
            message_id: message_id.clone(),
            from: self.sender_for(request),
            request: request.clone(),
            sent_at: Utc::now(),
        };

        debug!(
            to = %request.to,
            subject = %request.subject,
            flow_id = %request.flow_id,
            step_id = %request.step_id,
            "Email accepted"
        );
        metrics::counter!("mailer.emails_sent").increment(1);

        let mut sent = self.sent.lock();
        self.by_message_id.insert(message_id.clone(), sent.len());
        sent.push(entry);
        Ok(message_id)
    }
}

impl Default for OutboxMailer {
    fn default() -> Self {
        Self::new(EmailConfig::default())
    }
}

type EngagementKey = (ContactId, FlowId, String);

#[derive(Default)]
pub struct EngagementTracker {
    events: DashMap<EngagementKey, Vec<EngagementEvent>>,
}

impl EngagementTracker {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
        }
    }

    pub fn record(&self, event: EngagementEvent) {
        metrics::counter!("engagement.events", "kind" => format!("{:?}", event.kind)).increment(1);
        debug!(
            contact_id = %event.contact_id,
            flow_id = %event.flow_id,
            step_id = %event.step_id,
            kind = ?event.kind,
            "Engagement recorded"
        );
        let key = (event.contact_id, event.flow_id, event.step_id.clone());
        self.events.entry(key).or_default().push(event);
    }

    /// Attributes a provider webhook to the email that produced it.
    pub fn record_for_message(
        &self,
        mailer: &OutboxMailer,
        message_id: &str,
        kind: EngagementKind,
        url: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Option<EngagementEvent> {
        let Some(sent) = mailer.lookup(message_id) else {
            warn!(message_id = %message_id, "Engagement for unknown message, skipping");
            return None;
        };
        let event = EngagementEvent {
            contact_id: sent.request.contact_id,
            flow_id: sent.request.flow_id,
            step_id: sent.request.step_id,
            kind,
            url,
            occurred_at,
        };
        self.record(event.clone());
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EngagementSource for EngagementTracker {
    fn events_for(
        &self,
        contact_id: &ContactId,
        flow_id: &FlowId,
        step_id: &str,
    ) -> Vec<EngagementEvent> {
        self.events
            .get(&(*contact_id, *flow_id, step_id.to_string()))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request() -> EmailRequest {
        EmailRequest {
            contact_id: Uuid::new_v4(),
            to: "ada@example.com".into(),
            flow_id: Uuid::new_v4(),
            step_id: "email-1".into(),
            subject: "Welcome".into(),
            sender: None,
            html: "<p>hi</p>".into(),
        }
    }

    #[test]
    fn test_send_records_message_with_default_sender() {
        let mailer = OutboxMailer::default();
        let id = mailer.send(&request()).unwrap();
        let sent = mailer.lookup(&id).unwrap();
        assert_eq!(sent.from, "Mailflow <hello@mailflow.local>");
        assert_eq!(mailer.sent_count(), 1);
    }

    #[test]
    fn test_failing_transport_returns_error() {
        let mailer = OutboxMailer::default();
        mailer.set_failing(true);
        let err = mailer.send(&request()).unwrap_err();
        assert!(matches!(err, MailflowError::SideEffect(_)));
        assert_eq!(mailer.sent_count(), 0);

        mailer.set_failing(false);
        assert!(mailer.send(&request()).is_ok());
    }

    #[test]
    fn test_webhook_attribution() {
        let mailer = OutboxMailer::default();
        let tracker = EngagementTracker::new();
        let req = request();
        let id = mailer.send(&req).unwrap();

        let event = tracker
            .record_for_message(
                &mailer,
                &id,
                EngagementKind::Clicked,
                Some("https://x.com/a".into()),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(event.step_id, "email-1");

        let events = tracker.events_for(&req.contact_id, &req.flow_id, "email-1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].url.as_deref(), Some("https://x.com/a"));
        assert!(tracker
            .record_for_message(&mailer, "missing", EngagementKind::Opened, None, Utc::now())
            .is_none());
    }
}
