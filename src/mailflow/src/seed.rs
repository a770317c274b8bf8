//! Startup data: contacts, segments, templates, flows, and trigger events
//! loaded from a JSON file or generated for a local demo.

use std::path::Path;

use anyhow::Context;
use mailflow_cdp::ContactStore;
use mailflow_channels::{EmailTemplate, TemplateLibrary};
use mailflow_core::types::Contact;
use mailflow_journey::demo::demo_flows;
use mailflow_journey::{Flow, FlowStore, TriggerEvent};
use mailflow_segmentation::{Segment, SegmentationEngine};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub templates: Vec<EmailTemplate>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    /// Replayed through the trigger matcher once everything is loaded.
    #[serde(default)]
    pub events: Vec<TriggerEvent>,
}

impl Seed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path.display()))
    }

    pub fn demo() -> Self {
        let contacts = vec![
            Contact::new("ada@example.com").with_list("newsletter"),
            Contact::new("grace@example.com").with_list("newsletter"),
            Contact::new("linus@example.com").with_tag("lapsed"),
        ];
        let events = vec![
            TriggerEvent::list_added("ada@example.com", "newsletter"),
            TriggerEvent::list_added("grace@example.com", "newsletter"),
            TriggerEvent::custom_event("linus@example.com", "inactive-90d"),
        ];
        Self {
            contacts,
            flows: demo_flows(),
            events,
            ..Self::default()
        }
    }

    /// Loads everything except events into the stores. Returns the events.
    pub fn apply(
        self,
        contacts: &ContactStore,
        segments: &SegmentationEngine,
        templates: &TemplateLibrary,
        flows: &FlowStore,
    ) -> Vec<TriggerEvent> {
        contacts.import(self.contacts);
        for segment in self.segments {
            segments.register_segment(segment);
        }
        for template in self.templates {
            templates.upsert(template);
        }
        let mut loaded = 0usize;
        for flow in self.flows {
            let name = flow.name.clone();
            match flows.insert(flow) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(flow = %name, error = %e, "Skipping seeded flow"),
            }
        }
        info!(
            flows = loaded,
            contacts = contacts.len(),
            events = self.events.len(),
            "Seed data loaded"
        );
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_json_with_missing_sections() {
        let seed: Seed = serde_json::from_str(
            r#"{
                "contacts": [{"id": "9a1f0c4e-0a7b-4e44-8d2a-5d1f6c3b2e10", "email": "x@example.com"}],
                "events": [{"contactEmail": "x@example.com", "triggerType": "tag", "targetId": "vip"}]
            }"#,
        )
        .unwrap();
        assert_eq!(seed.contacts.len(), 1);
        assert!(seed.flows.is_empty());
        assert_eq!(seed.events[0], TriggerEvent::tag_added("x@example.com", "vip"));
    }

    #[test]
    fn test_demo_seed_loads_into_stores() {
        let contacts = ContactStore::new();
        let segments = SegmentationEngine::new();
        let templates = TemplateLibrary::new();
        let flows = FlowStore::new();
        let events = Seed::demo().apply(&contacts, &segments, &templates, &flows);
        assert_eq!(events.len(), 3);
        assert_eq!(contacts.len(), 3);
        assert_eq!(flows.active().len(), 3);
    }
}
