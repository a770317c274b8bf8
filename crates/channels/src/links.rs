//! Click-target extraction from compiled email HTML.
//!
//! Condition steps of type `clicked` offer the links of their governing email
//! as selectable targets; this module produces that list.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))[^>]*>(.*?)</a\s*>"#,
    )
    .unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

const MAX_LABEL_CHARS: usize = 50;

/// A trackable link found in an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLink {
    pub id: String,
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct LinkExtractor {
    unsubscribe_placeholder: String,
}

impl LinkExtractor {
    pub fn new(unsubscribe_placeholder: impl Into<String>) -> Self {
        Self {
            unsubscribe_placeholder: unsubscribe_placeholder.into(),
        }
    }

    /// Ordered, de-duplicated links. An empty result means the email has no
    /// trackable links, which is a valid state.
    pub fn extract(&self, html: &str) -> Vec<EmailLink> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for caps in ANCHOR_RE.captures_iter(html) {
            let href = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim())
                .unwrap_or_default();

            if self.is_excluded(href) || !seen.insert(href.to_string()) {
                continue;
            }

            let inner = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
            let mut label = clean_label(inner);
            if label.is_empty() {
                label = href.to_string();
            }

            links.push(EmailLink {
                id: format!("link-{}", links.len() + 1),
                label,
                url: href.to_string(),
            });
        }

        debug!(count = links.len(), "Extracted email links");
        links
    }

    pub fn urls(&self, html: &str) -> Vec<String> {
        self.extract(html).into_iter().map(|l| l.url).collect()
    }

    fn is_excluded(&self, href: &str) -> bool {
        href.is_empty()
            || href == "#"
            || href.to_ascii_lowercase().starts_with("mailto:")
            || (!self.unsubscribe_placeholder.is_empty()
                && href.contains(self.unsubscribe_placeholder.as_str()))
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new("{{unsubscribe_url}}")
    }
}

fn clean_label(inner: &str) -> String {
    let stripped = TAG_RE.replace_all(inner, " ");
    let decoded = stripped.replace("&nbsp;", " ").replace("&amp;", "&");
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate(&collapsed)
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_LABEL_CHARS).collect()
}
