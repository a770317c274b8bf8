//! Automation flows: the step graph model, trigger matching, and the
//! polling executor that moves contacts through flows.

pub mod demo;
pub mod evaluator;
pub mod executor;
pub mod graph;
pub mod state_machine;
pub mod store;
pub mod triggers;
pub mod types;
pub mod worker;

pub use evaluator::{SideEffect, StepEvaluator, StepOutcome};
pub use executor::{ExecutorServices, FlowExecutor, PassReport};
pub use graph::{CrossFlowDependency, FlowGraph, GraphIssue, GraphReport};
pub use state_machine::EnrollmentStateMachine;
pub use store::{EnrollmentStore, FlowStore};
pub use triggers::TriggerMatcher;
pub use types::{Enrollment, EnrollmentState, Flow, FlowStatus, FlowStep, StepConfig, StepType, TriggerEvent};
pub use worker::FlowWorker;
