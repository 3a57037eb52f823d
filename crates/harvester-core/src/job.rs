use crate::{JobError, Result, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally unique job identifier (monotonic, assigned by the store)
pub type JobId = u64;

/// Business identifier being processed (e.g. a phone number)
pub type JobKey = String;

/// Number of processing attempts a job gets before it is parked in `Error`.
/// The first failure demotes to `SecondCheck`, the second one is final.
pub const MAX_ATTEMPTS: u32 = 2;

/// Job status in the local queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobStatus {
    /// Received from the server, waiting for the scan loop
    Created,
    /// Currently handed to the processor
    InWork,
    /// Processed successfully, waiting to be shipped
    Completed,
    /// Failed once, waiting for its single retry
    SecondCheck,
    /// Failed twice, waiting to be shipped as a failure
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Created,
        JobStatus::InWork,
        JobStatus::Completed,
        JobStatus::SecondCheck,
        JobStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::InWork => "in_work",
            JobStatus::Completed => "completed",
            JobStatus::SecondCheck => "second_check",
            JobStatus::Error => "error",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            JobStatus::Created => 0,
            JobStatus::InWork => 1,
            JobStatus::Completed => 2,
            JobStatus::SecondCheck => 3,
            JobStatus::Error => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(JobStatus::Created),
            1 => Ok(JobStatus::InWork),
            2 => Ok(JobStatus::Completed),
            3 => Ok(JobStatus::SecondCheck),
            4 => Ok(JobStatus::Error),
            other => Err(JobError::UnknownStatus(other)),
        }
    }

    /// Statuses the scan loop picks up
    pub fn is_actionable(&self) -> bool {
        matches!(self, JobStatus::Created | JobStatus::SecondCheck)
    }

    /// Statuses only the result sender consumes
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one processor run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { payload: Option<Vec<u8>> },
    Failure { reason: String },
}

impl JobOutcome {
    pub fn success(payload: Option<Vec<u8>>) -> Self {
        JobOutcome::Success { payload }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        JobOutcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

/// A persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// Server-side correlation id; `None` for keys uploaded locally
    pub external_id: Option<u64>,

    /// Unique business key
    pub key: JobKey,

    pub status: JobStatus,

    /// Result blob, only set once the job is `Completed`
    pub payload: Option<Vec<u8>>,

    /// Number of times the job entered `InWork`
    pub attempts: u32,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, external_id: Option<u64>, key: impl Into<JobKey>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(JobError::EmptyKey);
        }

        let now = Utc::now();
        Ok(Job {
            id,
            external_id,
            key,
            status: JobStatus::Created,
            payload: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(JobError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(JobError::from)
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Hand the job to the processor (`Created | SecondCheck -> InWork`)
    pub fn start(&mut self) -> Result<()> {
        if !self.status.is_actionable() {
            return Err(self.invalid(JobStatus::InWork));
        }

        self.status = JobStatus::InWork;
        self.attempts += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the processor outcome for an `InWork` job
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<()> {
        if self.status != JobStatus::InWork {
            let target = match outcome {
                JobOutcome::Success { .. } => JobStatus::Completed,
                JobOutcome::Failure { .. } => self.failure_status(),
            };
            return Err(self.invalid(target));
        }

        match outcome {
            JobOutcome::Success { payload } => {
                if let Some(bytes) = &payload {
                    if bytes.len() > MAX_PAYLOAD_SIZE {
                        return Err(JobError::PayloadTooLarge {
                            max: MAX_PAYLOAD_SIZE,
                            actual: bytes.len(),
                        });
                    }
                }
                self.status = JobStatus::Completed;
                self.payload = payload;
                self.last_error = None;
            }
            JobOutcome::Failure { reason } => {
                self.status = self.failure_status();
                self.payload = None;
                self.last_error = Some(reason);
            }
        }

        self.updated_at = Utc::now();
        Ok(())
    }

    /// Put an `InWork` job back where it was picked from (crash recovery)
    pub fn release(&mut self) -> Result<()> {
        if self.status != JobStatus::InWork {
            return Err(self.invalid(JobStatus::Created));
        }

        self.attempts = self.attempts.saturating_sub(1);
        self.status = if self.attempts == 0 {
            JobStatus::Created
        } else {
            JobStatus::SecondCheck
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    fn failure_status(&self) -> JobStatus {
        if self.attempts >= MAX_ATTEMPTS {
            JobStatus::Error
        } else {
            JobStatus::SecondCheck
        }
    }

    fn invalid(&self, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            key: self.key.clone(),
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation() {
        let job = Job::new(1, Some(42), "79990001122").unwrap();

        assert_eq!(job.key, "79990001122");
        assert_eq!(job.external_id, Some(42));
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.attempts, 0);
        assert!(!job.has_payload());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(Job::new(1, None, ""), Err(JobError::EmptyKey)));
    }

    #[test]
    fn test_success_path() {
        let mut job = Job::new(1, None, "79990001122").unwrap();
        job.start().unwrap();
        assert_eq!(job.status, JobStatus::InWork);

        job.finish(JobOutcome::success(Some(b"png".to_vec()))).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.payload.as_deref(), Some(&b"png"[..]));
    }

    #[test]
    fn test_one_shot_retry() {
        let mut job = Job::new(1, None, "79990001122").unwrap();

        job.start().unwrap();
        job.finish(JobOutcome::failure("not found")).unwrap();
        assert_eq!(job.status, JobStatus::SecondCheck);

        job.start().unwrap();
        assert_eq!(job.attempts, 2);
        job.finish(JobOutcome::failure("still not found")).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.last_error.as_deref(), Some("still not found"));

        // terminal: cannot be picked again
        assert!(job.start().is_err());
    }

    #[test]
    fn test_second_check_can_still_succeed() {
        let mut job = Job::new(1, None, "79990001122").unwrap();
        job.start().unwrap();
        job.finish(JobOutcome::failure("timeout")).unwrap();
        job.start().unwrap();
        job.finish(JobOutcome::success(None)).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_finish_requires_in_work() {
        let mut job = Job::new(1, None, "79990001122").unwrap();
        let err = job.finish(JobOutcome::success(None)).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { from: JobStatus::Created, .. }));
    }

    #[test]
    fn test_release_restores_pick_up_status() {
        let mut job = Job::new(1, None, "79990001122").unwrap();
        job.start().unwrap();
        job.release().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.attempts, 0);

        job.start().unwrap();
        job.finish(JobOutcome::failure("x")).unwrap();
        job.start().unwrap();
        job.release().unwrap();
        assert_eq!(job.status, JobStatus::SecondCheck);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_status_codes() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(JobStatus::from_code(9).is_err());
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new(7, Some(3), "79990001122").unwrap();
        let bytes = job.to_bytes().unwrap();
        let decoded = Job::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, job);
    }
}
