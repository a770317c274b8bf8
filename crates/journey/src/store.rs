//! In-memory flow definitions and enrollments.
//!
//! Enrollment writes are compare-and-swap on `version`: a writer commits the
//! copy it read, and the commit fails if someone else committed first.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::types::{ContactId, FlowId, StepId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::graph::{FlowGraph, GraphReport};
use crate::types::{Enrollment, Flow, FlowStatus, FlowStep};

pub struct FlowStore {
    flows: DashMap<FlowId, Flow>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    /// Stores a flow as loaded. Persisted flows may predate current
    /// integrity rules, so an invalid active flow is kept and logged; the
    /// executor blocks enrollments that reach a broken step.
    pub fn insert(&self, flow: Flow) -> MailflowResult<FlowId> {
        if flow.name.trim().is_empty() {
            return Err(MailflowError::Validation("flow name is empty".into()));
        }
        if flow.status == FlowStatus::Active {
            let report = FlowGraph::new(&flow).validate();
            if !report.is_valid() {
                warn!(
                    flow_id = %flow.id,
                    errors = report.errors.len(),
                    "Active flow loaded with integrity errors"
                );
            }
        }
        let id = flow.id;
        info!(flow_id = %id, name = %flow.name, status = ?flow.status, "Flow stored");
        self.flows.insert(id, flow);
        Ok(id)
    }

    pub fn get(&self, id: &FlowId) -> Option<Flow> {
        self.flows.get(id).map(|f| f.clone())
    }

    pub fn list(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.flows.iter().map(|f| f.value().clone()).collect();
        flows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        flows
    }

    pub fn active(&self) -> Vec<Flow> {
        self.list().into_iter().filter(Flow::is_active).collect()
    }

    pub fn validate(&self, id: &FlowId) -> MailflowResult<GraphReport> {
        let flow = self.require(id)?;
        Ok(FlowGraph::new(&flow).validate())
    }

    /// draft → active. Refused while the graph has errors.
    pub fn activate(&self, id: &FlowId) -> MailflowResult<()> {
        let mut flow = self.require_mut(id)?;
        match flow.status {
            FlowStatus::Active => return Ok(()),
            FlowStatus::Archived => {
                return Err(MailflowError::Validation(format!("flow {id} is archived")))
            }
            FlowStatus::Draft => {}
        }
        ensure_valid(&flow)?;
        flow.status = FlowStatus::Active;
        flow.updated_at = Utc::now();
        info!(flow_id = %id, "Flow activated");
        Ok(())
    }

    /// active → draft. In-flight enrollments pause until reactivation.
    pub fn deactivate(&self, id: &FlowId) -> MailflowResult<()> {
        let mut flow = self.require_mut(id)?;
        if flow.status == FlowStatus::Archived {
            return Err(MailflowError::Validation(format!("flow {id} is archived")));
        }
        flow.status = FlowStatus::Draft;
        flow.updated_at = Utc::now();
        info!(flow_id = %id, "Flow deactivated");
        Ok(())
    }

    /// Archiving is final.
    pub fn archive(&self, id: &FlowId) -> MailflowResult<()> {
        let mut flow = self.require_mut(id)?;
        flow.status = FlowStatus::Archived;
        flow.updated_at = Utc::now();
        info!(flow_id = %id, "Flow archived");
        Ok(())
    }

    /// Inserts or replaces a step by id. Archived flows are frozen, and the
    /// trigger is fixed once any contact has enrolled. Active flows must
    /// stay valid; a rejected edit leaves the flow untouched.
    pub fn upsert_step(&self, id: &FlowId, step: FlowStep) -> MailflowResult<()> {
        let mut flow = self.require_mut(id)?;
        if flow.status == FlowStatus::Archived {
            return Err(MailflowError::Validation(format!(
                "flow {id} is archived and cannot be edited"
            )));
        }

        let mut candidate = flow.clone();
        match candidate.steps.iter().position(|s| s.id == step.id) {
            Some(i) => candidate.steps[i] = step,
            None => candidate.steps.push(step),
        }

        if flow.stats.enrolled > 0 {
            let before = flow.trigger().map(|t| (&t.id, &t.config));
            let after = candidate.trigger().map(|t| (&t.id, &t.config));
            if before != after {
                return Err(MailflowError::Validation(format!(
                    "trigger of flow {id} cannot change after contacts enrolled"
                )));
            }
        }
        if candidate.status == FlowStatus::Active {
            ensure_valid(&candidate)?;
        }

        candidate.updated_at = Utc::now();
        *flow = candidate;
        Ok(())
    }

    /// Removes a step and clears every edge that pointed at it.
    pub fn remove_step(&self, id: &FlowId, step_id: &str) -> MailflowResult<()> {
        let mut flow = self.require_mut(id)?;
        if flow.status != FlowStatus::Draft {
            return Err(MailflowError::Validation(format!(
                "steps can only be removed from draft flows, flow {id} is {:?}",
                flow.status
            )));
        }
        let before = flow.steps.len();
        flow.steps.retain(|s| s.id != step_id);
        if flow.steps.len() == before {
            return Err(MailflowError::NotFound(format!("step {step_id} in flow {id}")));
        }
        for step in flow.steps.iter_mut() {
            for edge in [
                &mut step.next_step_id,
                &mut step.yes_step_id,
                &mut step.no_step_id,
                &mut step.path_a_step_id,
                &mut step.path_b_step_id,
            ] {
                if edge.as_deref() == Some(step_id) {
                    *edge = None;
                }
            }
        }
        flow.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_enrolled(&self, id: &FlowId) {
        if let Some(mut flow) = self.flows.get_mut(id) {
            flow.stats.enrolled += 1;
        }
    }

    pub fn record_completed(&self, id: &FlowId) {
        if let Some(mut flow) = self.flows.get_mut(id) {
            flow.stats.completed += 1;
        }
    }

    pub fn record_blocked(&self, id: &FlowId) {
        if let Some(mut flow) = self.flows.get_mut(id) {
            flow.stats.blocked += 1;
        }
    }

    fn require(&self, id: &FlowId) -> MailflowResult<Flow> {
        self.get(id)
            .ok_or_else(|| MailflowError::NotFound(format!("flow {id}")))
    }

    fn require_mut(
        &self,
        id: &FlowId,
    ) -> MailflowResult<dashmap::mapref::one::RefMut<'_, FlowId, Flow>> {
        self.flows
            .get_mut(id)
            .ok_or_else(|| MailflowError::NotFound(format!("flow {id}")))
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_valid(flow: &Flow) -> MailflowResult<()> {
    let report = FlowGraph::new(flow).validate();
    if report.is_valid() {
        Ok(())
    } else {
        Err(first_error(flow, &report))
    }
}

fn first_error(flow: &Flow, report: &GraphReport) -> MailflowError {
    let (step_id, message) = report
        .errors
        .first()
        .map(|issue| (issue.step_id.clone().unwrap_or_default(), issue.message.clone()))
        .unwrap_or_default();
    MailflowError::InvalidFlow {
        flow_id: flow.id,
        step_id,
        reason: format!("{message} ({} error(s))", report.errors.len()),
    }
}

// ─── Enrollments ────────────────────────────────────────────────────────

pub struct EnrollmentStore {
    enrollments: DashMap<Uuid, Enrollment>,
    /// (flow, contact) → the enrollment currently holding the slot.
    open: DashMap<(FlowId, ContactId), Uuid>,
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self {
            enrollments: DashMap::new(),
            open: DashMap::new(),
        }
    }

    /// Creates an enrollment at `entry_step` unless the contact already has
    /// an open one in this flow. Concurrent callers cannot both succeed.
    pub fn open(
        &self,
        flow_id: FlowId,
        contact_id: ContactId,
        entry_step: StepId,
        now: DateTime<Utc>,
    ) -> Option<Enrollment> {
        let enrollment = Enrollment::new(flow_id, contact_id, entry_step, now);
        // The slot stays locked until the enrollment row exists.
        match self.open.entry((flow_id, contact_id)) {
            Entry::Occupied(mut slot) => {
                let holder = *slot.get();
                let still_open = self
                    .enrollments
                    .get(&holder)
                    .map(|e| e.state.is_open())
                    .unwrap_or(false);
                if still_open {
                    debug!(flow_id = %flow_id, contact_id = %contact_id, "Already enrolled");
                    return None;
                }
                self.enrollments.insert(enrollment.id, enrollment.clone());
                slot.insert(enrollment.id);
            }
            Entry::Vacant(slot) => {
                self.enrollments.insert(enrollment.id, enrollment.clone());
                slot.insert(enrollment.id);
            }
        }
        Some(enrollment)
    }

    pub fn get(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|e| e.clone())
    }

    pub fn find_open(&self, flow_id: &FlowId, contact_id: &ContactId) -> Option<Enrollment> {
        let id = *self.open.get(&(*flow_id, *contact_id))?;
        self.get(&id).filter(|e| e.state.is_open())
    }

    /// Enrollments ready for the executor that pass `include`, earliest due
    /// time first.
    pub fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include: impl Fn(&Enrollment) -> bool,
    ) -> Vec<Enrollment> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|e| e.is_due(now) && include(e.value()))
            .map(|e| e.value().clone())
            .collect();
        due.sort_by(|a, b| a.due_at().cmp(&b.due_at()).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        due
    }

    /// Writes `updated` if the stored version still equals `updated.version`.
    /// Returns the committed copy with its version bumped.
    pub fn commit(&self, mut updated: Enrollment) -> MailflowResult<Enrollment> {
        let committed = {
            let mut stored = self
                .enrollments
                .get_mut(&updated.id)
                .ok_or_else(|| MailflowError::NotFound(format!("enrollment {}", updated.id)))?;
            if stored.version != updated.version {
                return Err(MailflowError::ClaimConflict {
                    enrollment_id: updated.id,
                    expected: updated.version,
                    found: stored.version,
                });
            }
            updated.version += 1;
            updated.updated_at = Utc::now();
            *stored = updated.clone();
            updated
        };
        // Slot release happens after the row lock is dropped; `open` takes
        // locks in the other order.
        if !committed.state.is_open() {
            self.open
                .remove_if(&(committed.flow_id, committed.contact_id), |_, holder| {
                    *holder == committed.id
                });
        }
        Ok(committed)
    }

    /// Destroys every enrollment of a contact. Returns how many were removed.
    pub fn remove_for_contact(&self, contact_id: &ContactId) -> usize {
        let ids: Vec<Uuid> = self
            .enrollments
            .iter()
            .filter(|e| e.contact_id == *contact_id)
            .map(|e| e.id)
            .collect();
        let flows: HashSet<FlowId> = ids
            .iter()
            .filter_map(|id| self.enrollments.remove(id).map(|(_, e)| e.flow_id))
            .collect();
        for flow_id in flows {
            self.open.remove(&(flow_id, *contact_id));
        }
        ids.len()
    }

    pub fn for_flow(&self, flow_id: &FlowId) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.flow_id == *flow_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn for_contact(&self, contact_id: &ContactId) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.contact_id == *contact_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.enrollments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrollments.is_empty()
    }
}

impl Default for EnrollmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::sync::Arc;

    fn simple_flow() -> Flow {
        Flow::new(
            "welcome",
            vec![
                FlowStep::new(
                    "t",
                    StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "news")),
                )
                .then("e1"),
                FlowStep::new(
                    "e1",
                    StepConfig::Action(EmailActionConfig::with_html("Hi", "<p>hi</p>")),
                ),
            ],
        )
    }

    #[test]
    fn test_activation_requires_valid_graph() {
        let store = FlowStore::new();
        let mut flow = simple_flow();
        flow.steps[0].next_step_id = Some("nowhere".into());
        let id = store.insert(flow).unwrap();
        let err = store.activate(&id).unwrap_err();
        assert!(matches!(err, MailflowError::InvalidFlow { .. }));

        store
            .upsert_step(
                &id,
                FlowStep::new(
                    "t",
                    StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "news")),
                )
                .then("e1"),
            )
            .unwrap();
        store.activate(&id).unwrap();
        assert_eq!(store.active().len(), 1);
    }

    #[test]
    fn test_archived_flow_is_frozen() {
        let store = FlowStore::new();
        let id = store.insert(simple_flow()).unwrap();
        store.archive(&id).unwrap();
        let edit = FlowStep::new("w", StepConfig::Wait(WaitConfig::default()));
        assert!(store.upsert_step(&id, edit).is_err());
        assert!(store.activate(&id).is_err());
        assert!(store.deactivate(&id).is_err());
    }

    #[test]
    fn test_trigger_fixed_after_enrollment() {
        let store = FlowStore::new();
        let id = store.insert(simple_flow()).unwrap();
        store.record_enrolled(&id);

        let retarget = FlowStep::new(
            "t",
            StepConfig::Trigger(TriggerConfig::new(TriggerType::List, "other")),
        )
        .then("e1");
        assert!(store.upsert_step(&id, retarget).is_err());

        let same = store.get(&id).unwrap().steps[0].clone();
        assert!(store.upsert_step(&id, same).is_ok());

        let body = FlowStep::new(
            "e1",
            StepConfig::Action(EmailActionConfig::with_html("Hello", "<p>v2</p>")),
        );
        assert!(store.upsert_step(&id, body).is_ok());
    }

    #[test]
    fn test_active_flow_rejects_breaking_edit() {
        let store = FlowStore::new();
        let mut flow = simple_flow();
        flow.status = FlowStatus::Active;
        let id = store.insert(flow).unwrap();
        let broken = FlowStep::new("e1", StepConfig::Action(EmailActionConfig::default()));
        assert!(store.upsert_step(&id, broken).is_err());
    }

    #[test]
    fn test_remove_step_clears_edges() {
        let store = FlowStore::new();
        let id = store.insert(simple_flow()).unwrap();
        store.remove_step(&id, "e1").unwrap();
        let flow = store.get(&id).unwrap();
        assert_eq!(flow.steps.len(), 1);
        assert!(flow.steps[0].next_step_id.is_none());
        assert!(store.remove_step(&id, "e1").is_err());
    }

    #[test]
    fn test_open_is_idempotent_per_flow_and_contact() {
        let store = EnrollmentStore::new();
        let (flow, contact) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let first = store.open(flow, contact, "t".into(), now).unwrap();
        assert!(store.open(flow, contact, "t".into(), now).is_none());
        assert!(store.open(Uuid::new_v4(), contact, "t".into(), now).is_some());

        let mut done = first.clone();
        done.move_to(None, now).unwrap();
        store.commit(done).unwrap();
        assert!(store.find_open(&flow, &contact).is_none());
        assert!(store.open(flow, contact, "t".into(), now).is_some());
    }

    #[test]
    fn test_concurrent_open_creates_one_enrollment() {
        let store = Arc::new(EnrollmentStore::new());
        let (flow, contact) = (Uuid::new_v4(), Uuid::new_v4());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.open(flow, contact, "t".into(), Utc::now()).is_some())
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_commit_detects_stale_version() {
        let store = EnrollmentStore::new();
        let e = store
            .open(Uuid::new_v4(), Uuid::new_v4(), "t".into(), Utc::now())
            .unwrap();
        let committed = store.commit(e.clone()).unwrap();
        assert_eq!(committed.version, 1);

        let err = store.commit(e).unwrap_err();
        assert!(err.is_claim_conflict());
        assert!(store.commit(committed).is_ok());
    }

    #[test]
    fn test_due_and_remove_for_contact() {
        let store = EnrollmentStore::new();
        let now = Utc::now();
        let contact = Uuid::new_v4();
        let a = store.open(Uuid::new_v4(), contact, "t".into(), now).unwrap();
        store.open(Uuid::new_v4(), contact, "t".into(), now).unwrap();
        store.open(Uuid::new_v4(), Uuid::new_v4(), "t".into(), now).unwrap();

        let mut waiting = a;
        waiting
            .set_state(EnrollmentState::Waiting {
                until: now + chrono::Duration::hours(1),
            })
            .unwrap();
        store.commit(waiting).unwrap();

        assert_eq!(store.due(now, 10, |_| true).len(), 2);
        assert_eq!(store.due(now, 1, |_| true).len(), 1);
        assert_eq!(store.due(now, 10, |e| e.contact_id != contact).len(), 1);
        assert_eq!(store.remove_for_contact(&contact), 2);
        assert_eq!(store.len(), 1);
        assert!(store.for_contact(&contact).is_empty());
    }
}
