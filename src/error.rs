use uuid::Uuid;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no eligible node for job type {0}")]
    NoEligibleNode(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("data reference not found: {0}")]
    DataRefNotFound(Uuid),

    #[error("aggregation failed: {0}")]
    Aggregation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
