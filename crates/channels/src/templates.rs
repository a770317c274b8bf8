//! Email template library: compiled HTML by template id, with a simple
//! lifecycle and version counter.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mailflow_core::services::TemplateSource;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Template lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    #[default]
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub html: String,
    #[serde(default)]
    pub status: TemplateStatus,
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// The template library.
pub struct TemplateLibrary {
    templates: DashMap<String, EmailTemplate>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    /// Inserts or replaces a template, bumping its version on replacement.
    pub fn upsert(&self, mut template: EmailTemplate) -> u32 {
        let version = self
            .templates
            .get(&template.id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        template.version = version;
        template.updated_at = Utc::now();
        info!(template_id = %template.id, version, "Template stored");
        self.templates.insert(template.id.clone(), template);
        version
    }

    pub fn archive(&self, id: &str) -> bool {
        match self.templates.get_mut(id) {
            Some(mut t) => {
                t.status = TemplateStatus::Archived;
                t.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<EmailTemplate> {
        self.templates.get(id).map(|t| t.clone())
    }

    pub fn list(&self) -> Vec<EmailTemplate> {
        let mut all: Vec<EmailTemplate> = self.templates.iter().map(|t| t.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateSource for TemplateLibrary {
    /// Archived templates no longer resolve.
    fn compiled_html(&self, template_id: &str) -> Option<String> {
        self.templates
            .get(template_id)
            .filter(|t| t.status != TemplateStatus::Archived)
            .map(|t| t.html.clone())
    }
}
