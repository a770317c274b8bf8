use thiserror::Error;
use uuid::Uuid;

pub type MailflowResult<T> = Result<T, MailflowError>;

#[derive(Error, Debug)]
pub enum MailflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Flow {flow_id} is misconfigured at step {step_id}: {reason}")]
    InvalidFlow {
        flow_id: Uuid,
        step_id: String,
        reason: String,
    },

    #[error("Enrollment {enrollment_id} was claimed by another pass (expected version {expected}, found {found})")]
    ClaimConflict {
        enrollment_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("Side effect failed: {0}")]
    SideEffect(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MailflowError {
    /// Claim conflicts are an expected outcome of overlapping worker passes.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, MailflowError::ClaimConflict { .. })
    }
}
