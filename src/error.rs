use thiserror::Error;

#[derive(Error, Debug)]
pub enum SoulError {
    #[error("Schema violation: {detail}")]
    SchemaViolation { detail: String },

    #[error("Invalid job id: {job_id}")]
    InvalidJobId { job_id: String },

    #[error("Integrator input invalid: {0}")]
    IntegratorInput(String),

    #[error("Turn timed out after {elapsed_ms}ms")]
    TurnTimeout { elapsed_ms: u64 },

    #[error("Model backend error: {0}")]
    Model(String),

    #[error("Turn aborted")]
    Aborted,

    #[error("Event log error: {0}")]
    Log(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SoulResult<T> = Result<T, SoulError>;
