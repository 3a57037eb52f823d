use crate::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Job key must not be empty")]
    EmptyKey,

    #[error("Invalid status transition for job {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unknown job status code: {0}")]
    UnknownStatus(u8),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;
