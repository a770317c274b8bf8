//! In-memory contact store backed by DashMap.
//!
//! Keeps the email index and per-list member counts consistent with every
//! mutation, including deletion. Deleted ids are tombstoned and cannot be
//! re-inserted.

use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::services::ContactDirectory;
use mailflow_core::types::{Contact, ContactId, ContactStatus, EngagementEvent, EngagementKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub rejected: usize,
}

/// Thread-safe contact store.
pub struct ContactStore {
    contacts: DashMap<ContactId, Contact>,
    email_index: DashMap<String, ContactId>,
    list_counts: DashMap<String, u64>,
    deleted: DashSet<ContactId>,
}

impl ContactStore {
    pub fn new() -> Self {
        info!("Contact store initialized (in-memory)");
        Self {
            contacts: DashMap::new(),
            email_index: DashMap::new(),
            list_counts: DashMap::new(),
            deleted: DashSet::new(),
        }
    }

    /// Inserts or replaces a contact. Emails must be unique across contacts.
    /// Returns `true` when the contact was newly created.
    pub fn upsert(&self, contact: Contact) -> MailflowResult<bool> {
        if self.deleted.contains(&contact.id) {
            return Err(MailflowError::Validation(format!(
                "contact {} was deleted",
                contact.id
            )));
        }
        let email_key = normalize_email(&contact.email);
        if email_key.is_empty() {
            return Err(MailflowError::Validation("contact email is empty".into()));
        }
        // Claim the email slot atomically; the guard is released before the
        // contact map is touched.
        match self.email_index.entry(email_key.clone()) {
            Entry::Occupied(slot) if *slot.get() != contact.id => {
                return Err(MailflowError::Validation(format!(
                    "email {} already belongs to contact {}",
                    contact.email,
                    slot.get()
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(contact.id);
            }
        }

        let previous = self.contacts.insert(contact.id, contact.clone());
        let created = previous.is_none();
        if let Some(prev) = &previous {
            let prev_key = normalize_email(&prev.email);
            if prev_key != email_key {
                self.email_index
                    .remove_if(&prev_key, |_, owner| *owner == contact.id);
            }
            self.adjust_list_counts(&prev.list_ids, &contact.list_ids);
        } else {
            for list_id in &contact.list_ids {
                self.increment_list(list_id);
            }
        }
        Ok(created)
    }

    /// Bulk import. Rows that violate uniqueness are skipped and counted.
    pub fn import(&self, contacts: impl IntoIterator<Item = Contact>) -> ImportReport {
        let mut report = ImportReport::default();
        for contact in contacts {
            match self.upsert(contact) {
                Ok(true) => report.created += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    warn!(error = %e, "Skipping contact during import");
                    report.rejected += 1;
                }
            }
        }
        info!(
            created = report.created,
            updated = report.updated,
            rejected = report.rejected,
            "Contact import finished"
        );
        report
    }

    /// Folds an engagement signal into the contact's stats.
    pub fn record_engagement(&self, event: &EngagementEvent) {
        let Some(mut contact) = self.contacts.get_mut(&event.contact_id) else {
            return;
        };
        match event.kind {
            EngagementKind::Opened => {
                contact.stats.emails_opened += 1;
                contact.stats.last_open_at = Some(event.occurred_at);
            }
            EngagementKind::Clicked => {
                contact.stats.links_clicked += 1;
                contact.stats.last_click_at = Some(event.occurred_at);
            }
            EngagementKind::Unsubscribed => contact.status = ContactStatus::Unsubscribed,
            EngagementKind::Delivered | EngagementKind::Replied => {}
        }
    }

    pub fn all(&self) -> Vec<Contact> {
        self.contacts.iter().map(|c| c.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn list_member_count(&self, list_id: &str) -> u64 {
        self.list_counts.get(list_id).map(|c| *c).unwrap_or(0)
    }

    fn mutate<R>(
        &self,
        id: &ContactId,
        f: impl FnOnce(&mut Contact) -> R,
    ) -> MailflowResult<R> {
        let mut contact = self
            .contacts
            .get_mut(id)
            .ok_or_else(|| MailflowError::NotFound(format!("contact {id}")))?;
        Ok(f(&mut contact))
    }

    fn adjust_list_counts(&self, before: &BTreeSet<String>, after: &BTreeSet<String>) {
        for removed in before.difference(after) {
            self.decrement_list(removed);
        }
        for added in after.difference(before) {
            self.increment_list(added);
        }
    }

    fn increment_list(&self, list_id: &str) {
        *self.list_counts.entry(list_id.to_string()).or_insert(0) += 1;
    }

    fn decrement_list(&self, list_id: &str) {
        if let Some(mut count) = self.list_counts.get_mut(list_id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Default for ContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactDirectory for ContactStore {
    fn get(&self, id: &ContactId) -> Option<Contact> {
        self.contacts.get(id).map(|c| c.clone())
    }

    fn find_by_email(&self, email: &str) -> Option<Contact> {
        let id = *self.email_index.get(&normalize_email(email))?;
        self.get(&id)
    }

    fn add_tags(&self, id: &ContactId, tags: &[String]) -> MailflowResult<Vec<String>> {
        self.mutate(id, |contact| {
            let mut added = Vec::new();
            for tag in tags {
                let tag = tag.trim();
                if tag.is_empty() || contact.has_tag(tag) {
                    continue;
                }
                contact.tags.insert(tag.to_string());
                added.push(tag.to_string());
            }
            added
        })
    }

    fn remove_tags(&self, id: &ContactId, tags: &[String]) -> MailflowResult<()> {
        self.mutate(id, |contact| {
            contact
                .tags
                .retain(|existing| !tags.iter().any(|t| t.trim().eq_ignore_ascii_case(existing)));
        })
    }

    fn add_to_list(&self, id: &ContactId, list_id: &str) -> MailflowResult<bool> {
        let added = self.mutate(id, |contact| contact.list_ids.insert(list_id.to_string()))?;
        if added {
            self.increment_list(list_id);
        }
        Ok(added)
    }

    fn remove_from_list(&self, id: &ContactId, list_id: &str) -> MailflowResult<()> {
        let removed = self.mutate(id, |contact| contact.list_ids.remove(list_id))?;
        if removed {
            self.decrement_list(list_id);
        }
        Ok(())
    }

    fn unsubscribe(&self, id: &ContactId) -> MailflowResult<()> {
        self.mutate(id, |contact| contact.status = ContactStatus::Unsubscribed)?;
        debug!(contact_id = %id, "Contact unsubscribed");
        Ok(())
    }

    fn delete(&self, id: &ContactId) -> MailflowResult<()> {
        let (_, contact) = self
            .contacts
            .remove(id)
            .ok_or_else(|| MailflowError::NotFound(format!("contact {id}")))?;
        self.email_index.remove(&normalize_email(&contact.email));
        for list_id in &contact.list_ids {
            self.decrement_list(list_id);
        }
        self.deleted.insert(*id);
        info!(contact_id = %id, deleted_at = %Utc::now(), "Contact deleted");
        Ok(())
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
