use std::sync::LazyLock;

use mailflow_core::error::{MailflowError, MailflowResult};
use serde::{Deserialize, Serialize};

use crate::types::EnrollmentPhase;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentPhase,
    pub to: EnrollmentPhase,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions. `Completed` and `Blocked` have no way out.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub transitions: Vec<StateTransition>,
}

static TABLE: LazyLock<EnrollmentStateMachine> = LazyLock::new(EnrollmentStateMachine::new);

fn transition(from: EnrollmentPhase, to: EnrollmentPhase, trigger: &str) -> StateTransition {
    StateTransition {
        from,
        to,
        trigger: trigger.to_string(),
    }
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        use EnrollmentPhase::*;
        let transitions = vec![
            // Running ->
            transition(Running, Running, "advance"),
            transition(Running, Waiting, "wait_step"),
            transition(Running, BranchPending, "condition_step"),
            transition(Running, Completed, "flow_end"),
            transition(Running, Blocked, "configuration_error"),
            // Waiting ->
            transition(Waiting, Running, "wait_elapsed"),
            transition(Waiting, Completed, "wait_elapsed_at_end"),
            transition(Waiting, Blocked, "step_missing"),
            // BranchPending ->
            transition(BranchPending, Running, "branch_resolved"),
            transition(BranchPending, Completed, "branch_resolved_at_end"),
            transition(BranchPending, Blocked, "step_missing"),
        ];
        Self { transitions }
    }

    pub fn can_transition(&self, from: EnrollmentPhase, to: EnrollmentPhase) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Checks a transition against the shared table.
    pub fn check(from: EnrollmentPhase, to: EnrollmentPhase) -> MailflowResult<()> {
        if TABLE.can_transition(from, to) {
            Ok(())
        } else {
            Err(MailflowError::Validation(format!(
                "invalid enrollment transition from {from:?} to {to:?}"
            )))
        }
    }

    /// Phases an enrollment can move to from `from`.
    pub fn successors(&self, from: EnrollmentPhase) -> Vec<EnrollmentPhase> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases_have_no_successors() {
        let sm = EnrollmentStateMachine::new();
        assert!(sm.successors(EnrollmentPhase::Completed).is_empty());
        assert!(sm.successors(EnrollmentPhase::Blocked).is_empty());
    }

    #[test]
    fn test_waiting_cannot_wait_again_without_running() {
        let sm = EnrollmentStateMachine::new();
        assert!(!sm.can_transition(EnrollmentPhase::Waiting, EnrollmentPhase::Waiting));
        assert!(!sm.can_transition(EnrollmentPhase::Waiting, EnrollmentPhase::BranchPending));
        assert!(sm.can_transition(EnrollmentPhase::Waiting, EnrollmentPhase::Running));
    }

    #[test]
    fn test_check_reports_invalid_transition() {
        assert!(EnrollmentStateMachine::check(
            EnrollmentPhase::Running,
            EnrollmentPhase::BranchPending
        )
        .is_ok());
        let err =
            EnrollmentStateMachine::check(EnrollmentPhase::Completed, EnrollmentPhase::Running)
                .unwrap_err();
        assert!(err.to_string().contains("invalid enrollment transition"));
    }
}
