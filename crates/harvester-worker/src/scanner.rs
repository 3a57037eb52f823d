use crate::config::ScanConfig;
use crate::error::Result;
use crate::processor::{ProcessExecutor, Processor};
use harvester_persistence::JobStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Feeds queued jobs to the processor and records their outcome
pub struct ScanLoop {
    store: Arc<JobStore>,
    processor: Arc<dyn Processor>,
    executor: ProcessExecutor,
    config: ScanConfig,
}

impl ScanLoop {
    pub fn new(store: Arc<JobStore>, processor: Arc<dyn Processor>, config: ScanConfig) -> Self {
        let executor = ProcessExecutor::new(processor.clone(), config.process_timeout());
        ScanLoop {
            store,
            processor,
            executor,
            config,
        }
    }

    /// Wait for the processor, then scan forever
    pub async fn run(&self) -> Result<()> {
        self.wait_for_login().await;

        loop {
            match self.scan_once().await {
                Ok(0) => tokio::time::sleep(self.config.wait_interval()).await,
                Ok(_) => {}
                Err(e) => {
                    error!("Scan failed: {}", e);
                    tokio::time::sleep(self.config.wait_interval()).await;
                }
            }
        }
    }

    async fn wait_for_login(&self) {
        loop {
            if self.processor.login(self.config.login_timeout()).await {
                info!("Processor ready");
                return;
            }
            warn!("Processor not ready, retrying in {:?}", self.config.login_retry());
            tokio::time::sleep(self.config.login_retry()).await;
        }
    }

    /// Process one batch of actionable jobs, returning how many ran
    pub async fn scan_once(&self) -> Result<usize> {
        let candidates = self.store.next_actionable(self.config.batch_size)?;
        let mut processed = 0;

        for candidate in candidates {
            // a concurrent pick may have claimed it since the scan
            let Some(job) = self.store.mark_in_work(&candidate.key)? else {
                continue;
            };

            let outcome = self.executor.execute(&job).await;
            match self.store.mark_outcome(&job.key, outcome) {
                Ok(Some(status)) => {
                    info!(key = %job.key, %status, attempt = job.attempts, "Job finished");
                }
                Ok(None) => {}
                Err(e) => {
                    self.release(&job.key);
                    return Err(e.into());
                }
            }
            processed += 1;
        }

        Ok(processed)
    }

    /// Keep a job whose outcome could not be recorded from staying `InWork`
    fn release(&self, key: &str) {
        match self.store.release(key) {
            Ok(true) => warn!(key, "Outcome not recorded, job released for another attempt"),
            Ok(false) => {}
            Err(e) => error!(key, "Failed to release job: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ProcessResult;
    use async_trait::async_trait;
    use harvester_core::{Job, JobOutcome, JobStatus};
    use harvester_persistence::{JobStoreConfig, NewJob};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Succeeds for keys starting with `7`, logs in after `logins_needed` attempts
    struct Scripted {
        logins_needed: usize,
        login_attempts: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Scripted {
        async fn login(&self, _timeout: Duration) -> bool {
            self.login_attempts.fetch_add(1, Ordering::SeqCst) + 1 >= self.logins_needed
        }

        async fn process(&self, job: &Job) -> ProcessResult {
            if job.key.starts_with('7') {
                Ok(Some(job.key.as_bytes().to_vec()))
            } else {
                Err("no such subscriber".to_string())
            }
        }
    }

    fn setup(dir: &TempDir, logins_needed: usize) -> (Arc<JobStore>, Arc<Scripted>, ScanLoop) {
        let store = Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: dir.path().to_path_buf(),
            })
            .unwrap(),
        );
        let processor = Arc::new(Scripted {
            logins_needed,
            login_attempts: AtomicUsize::new(0),
        });
        let config = ScanConfig {
            batch_size: 10,
            ..ScanConfig::default()
        };
        let scan = ScanLoop::new(store.clone(), processor.clone(), config);
        (store, processor, scan)
    }

    #[tokio::test]
    async fn test_scan_applies_one_shot_retry() {
        let temp_dir = TempDir::new().unwrap();
        let (store, _, scan) = setup(&temp_dir, 1);
        store
            .insert_tasks(&[NewJob::local("79990001122"), NewJob::local("1234")])
            .unwrap();

        assert_eq!(scan.scan_once().await.unwrap(), 2);
        assert_eq!(store.get("79990001122").unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(store.get("1234").unwrap().unwrap().status, JobStatus::SecondCheck);

        assert_eq!(scan.scan_once().await.unwrap(), 1);
        assert_eq!(store.get("1234").unwrap().unwrap().status, JobStatus::Error);

        assert_eq!(scan.scan_once().await.unwrap(), 0);
    }

    /// Records an outcome behind the scanner's back on the first attempt
    struct Interfering {
        store: Arc<JobStore>,
        interfered: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Interfering {
        async fn login(&self, _timeout: Duration) -> bool {
            true
        }

        async fn process(&self, job: &Job) -> ProcessResult {
            if self.interfered.fetch_add(1, Ordering::SeqCst) == 0 {
                self.store
                    .mark_outcome(&job.key, JobOutcome::failure("elsewhere"))
                    .unwrap();
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_unrecorded_outcome_does_not_strand_job() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: temp_dir.path().to_path_buf(),
            })
            .unwrap(),
        );
        store.insert_tasks(&[NewJob::local("a"), NewJob::local("b")]).unwrap();
        let processor = Arc::new(Interfering {
            store: store.clone(),
            interfered: AtomicUsize::new(0),
        });
        let scan = ScanLoop::new(store.clone(), processor, ScanConfig::default());

        assert!(scan.scan_once().await.is_err());
        assert_eq!(store.count_by_status(JobStatus::InWork).unwrap(), 0);

        assert_eq!(store.get("a").unwrap().unwrap().status, JobStatus::SecondCheck);

        assert_eq!(scan.scan_once().await.unwrap(), 2);
        assert_eq!(store.count_by_status(JobStatus::Completed).unwrap(), 2);
        assert_eq!(store.count_by_status(JobStatus::InWork).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_for_login() {
        let temp_dir = TempDir::new().unwrap();
        let (store, processor, scan) = setup(&temp_dir, 3);
        store.insert_tasks(&[NewJob::local("79990001122")]).unwrap();

        let running = tokio::spawn(async move { scan.run().await });

        while store.count_by_status(JobStatus::Completed).unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(processor.login_attempts.load(Ordering::SeqCst) >= 3);
        running.abort();
    }
}
