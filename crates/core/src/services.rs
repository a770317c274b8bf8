//! Collaborator seams consumed by the flow engine.
//!
//! Every side effect the executor issues goes through one of these traits so
//! that a failure is observable as an `Err` and can be retried on a later pass.

use crate::error::MailflowResult;
use crate::types::{Contact, ContactId, EmailRequest, EngagementEvent, FlowId};

/// Delivers a rendered email. Returns the provider message id.
pub trait EmailSender: Send + Sync {
    fn send(&self, request: &EmailRequest) -> MailflowResult<String>;
}

/// Contact lookup and the mutations a flow may apply to a contact.
pub trait ContactDirectory: Send + Sync {
    fn get(&self, id: &ContactId) -> Option<Contact>;

    /// Email lookup ignores case.
    fn find_by_email(&self, email: &str) -> Option<Contact>;

    /// Returns the tags that were not already present.
    fn add_tags(&self, id: &ContactId, tags: &[String]) -> MailflowResult<Vec<String>>;

    fn remove_tags(&self, id: &ContactId, tags: &[String]) -> MailflowResult<()>;

    /// Returns `true` when the contact was not already on the list.
    fn add_to_list(&self, id: &ContactId, list_id: &str) -> MailflowResult<bool>;

    fn remove_from_list(&self, id: &ContactId, list_id: &str) -> MailflowResult<()>;

    fn unsubscribe(&self, id: &ContactId) -> MailflowResult<()>;

    /// Irreversible.
    fn delete(&self, id: &ContactId) -> MailflowResult<()>;
}

/// Engagement signals recorded against the email a flow step sent.
pub trait EngagementSource: Send + Sync {
    fn events_for(&self, contact_id: &ContactId, flow_id: &FlowId, step_id: &str)
        -> Vec<EngagementEvent>;
}

/// Resolves a template id to its compiled HTML.
pub trait TemplateSource: Send + Sync {
    fn compiled_html(&self, template_id: &str) -> Option<String>;
}
