//! Segment rule engine: boolean criteria trees evaluated against contacts,
//! a concurrent segment registry, and a fluent segment builder.

pub mod builder;
pub mod criteria;
pub mod engine;
pub mod predicates;

pub use builder::SegmentBuilder;
pub use criteria::{Condition, Criteria, Group, Operator};
pub use engine::{RuleEngine, Segment, SegmentationEngine};
