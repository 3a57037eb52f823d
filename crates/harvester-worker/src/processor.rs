use crate::config::ProcessorConfig;
use async_trait::async_trait;
use harvester_core::{Job, JobOutcome};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Payload on success, reason on failure
pub type ProcessResult = Result<Option<Vec<u8>>, String>;

/// The lookup capability the scan loop drives
#[async_trait]
pub trait Processor: Send + Sync {
    /// Whether the processor is ready to take jobs
    async fn login(&self, timeout: Duration) -> bool;

    async fn process(&self, job: &Job) -> ProcessResult;
}

/// Runs a processor with timeout and panic recovery
pub struct ProcessExecutor {
    processor: Arc<dyn Processor>,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(processor: Arc<dyn Processor>, timeout: Duration) -> Self {
        ProcessExecutor { processor, timeout }
    }

    /// Process one job; timeouts and panics become failures
    pub async fn execute(&self, job: &Job) -> JobOutcome {
        let processor = self.processor.clone();
        let job_clone = job.clone();
        let limit = self.timeout;

        let handle = tokio::spawn(async move { timeout(limit, processor.process(&job_clone)).await });

        match handle.await {
            Ok(Ok(Ok(payload))) => {
                info!(key = %job.key, attempt = job.attempts, "Job processed");
                JobOutcome::success(payload)
            }
            Ok(Ok(Err(reason))) => {
                warn!(key = %job.key, attempt = job.attempts, "Job failed: {}", reason);
                JobOutcome::failure(reason)
            }
            Ok(Err(_)) => {
                error!(key = %job.key, "Job timed out after {:?}", limit);
                JobOutcome::failure(format!("processing timed out after {:?}", limit))
            }
            Err(e) if e.is_panic() => {
                error!(key = %job.key, "Processor panicked: {:?}", e);
                JobOutcome::failure("processor panicked")
            }
            Err(_) => {
                error!(key = %job.key, "Processing was cancelled");
                JobOutcome::failure("processing was cancelled")
            }
        }
    }
}

/// Processor backed by an external program.
///
/// Runs `program args... <key>`; stdout of a zero exit is the payload.
pub struct CommandProcessor {
    config: ProcessorConfig,
}

impl CommandProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        CommandProcessor { config }
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn login(&self, limit: Duration) -> bool {
        let Some(program) = &self.config.login_program else {
            return true;
        };

        let status = Command::new(program)
            .args(&self.config.login_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status();

        match timeout(limit, status).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!("Login command exited with {}", status);
                false
            }
            Ok(Err(e)) => {
                warn!("Login command could not start: {}", e);
                false
            }
            Err(_) => {
                warn!("Login command timed out after {:?}", limit);
                false
            }
        }
    }

    async fn process(&self, job: &Job) -> ProcessResult {
        let program = self
            .config
            .program
            .as_ref()
            .ok_or_else(|| "no processor program configured".to_string())?;

        let output = Command::new(program)
            .args(&self.config.args)
            .arg(&job.key)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to start {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()));
        }

        if output.stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(output.stdout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted;

    #[async_trait]
    impl Processor for Scripted {
        async fn login(&self, _timeout: Duration) -> bool {
            true
        }

        async fn process(&self, job: &Job) -> ProcessResult {
            match job.key.as_str() {
                "ok" => Ok(Some(b"image".to_vec())),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(None)
                }
                "panic" => panic!("processor bug"),
                _ => Err("not found".to_string()),
            }
        }
    }

    fn job(key: &str) -> Job {
        Job::new(1, None, key).unwrap()
    }

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(Arc::new(Scripted), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_executor_outcomes() {
        let executor = executor();

        assert_eq!(
            executor.execute(&job("ok")).await,
            JobOutcome::success(Some(b"image".to_vec()))
        );
        assert!(!executor.execute(&job("missing")).await.is_success());
        assert!(!executor.execute(&job("panic")).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_timeout() {
        let outcome = executor().execute(&job("slow")).await;
        match outcome {
            JobOutcome::Failure { reason } => assert!(reason.contains("timed out")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_processor() {
        let processor = CommandProcessor::new(ProcessorConfig {
            program: Some("sh".to_string()),
            args: vec!["-c".to_string(), "printf %s \"$0\"".to_string()],
            login_program: Some("true".to_string()),
            login_args: vec![],
        });

        assert!(processor.login(Duration::from_secs(5)).await);
        let payload = processor.process(&job("79990001122")).await.unwrap();
        assert_eq!(payload, Some(b"79990001122".to_vec()));
    }

    #[tokio::test]
    async fn test_command_processor_failure() {
        let processor = CommandProcessor::new(ProcessorConfig {
            program: Some("false".to_string()),
            args: vec![],
            login_program: Some("false".to_string()),
            login_args: vec![],
        });

        assert!(!processor.login(Duration::from_secs(5)).await);
        assert!(processor.process(&job("79990001122")).await.is_err());

        let unconfigured = CommandProcessor::new(ProcessorConfig::default());
        assert!(unconfigured.login(Duration::from_secs(1)).await);
        assert!(unconfigured.process(&job("1")).await.is_err());
    }
}
