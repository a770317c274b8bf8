//! Email channel: click-target extraction, outbound mail transport,
//! engagement tracking, and the template library.

pub mod email;
pub mod links;
pub mod templates;

pub use email::{EngagementTracker, OutboxMailer};
pub use links::{EmailLink, LinkExtractor};
pub use templates::{EmailTemplate, TemplateLibrary};
