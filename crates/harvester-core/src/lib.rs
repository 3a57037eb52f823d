mod error;
mod identity;
mod job;

pub use error::{JobError, Result};
pub use identity::WorkerIdentity;
pub use job::{Job, JobId, JobKey, JobOutcome, JobStatus, MAX_ATTEMPTS};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
