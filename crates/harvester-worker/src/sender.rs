use crate::broker::{BrokerClient, BrokerResult};
use crate::config::SenderConfig;
use crate::error::{BrokerError, Result};
use crate::handlers::Session;
use async_trait::async_trait;
use harvester_core::Job;
use harvester_persistence::JobStore;
use harvester_protocol::{envelope, ResultEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ships finished jobs back to the server
#[async_trait]
pub trait ResultSender: Send + Sync {
    /// Ship one batch, returning how many jobs were removed locally
    async fn send_batch(&self, session: &Session) -> Result<usize>;
}

/// Sends results through the broker: payloads into the object bucket,
/// one event per job on the result subject.
///
/// A batch is deleted locally only when every job in it was shipped;
/// otherwise the whole batch stays queued and is sent again next cycle.
pub struct BrokerResultSender {
    store: Arc<JobStore>,
    config: SenderConfig,
    result_subject: String,
}

impl BrokerResultSender {
    pub fn new(store: Arc<JobStore>, config: SenderConfig, result_subject: impl Into<String>) -> Self {
        BrokerResultSender {
            store,
            config,
            result_subject: result_subject.into(),
        }
    }

    async fn ship(&self, session: &Session, job: &Job) -> BrokerResult<()> {
        let client = session.client.as_ref();

        if let Some(payload) = &job.payload {
            if let Err(e) = self.upsert(client, &job.key, payload.clone()).await {
                if !matches!(e, BrokerError::ConnectionClosed) {
                    // a half-written object must not be mistaken for the result
                    if let Err(cleanup) = client.kv_delete(&self.config.object_bucket, &job.key).await {
                        debug!(key = %job.key, "Payload cleanup skipped: {}", cleanup);
                    }
                }
                return Err(e);
            }
        }

        let event = ResultEvent {
            worker_id: session.identity.id,
            external_id: job.external_id,
            key: job.key.clone(),
            has_payload: job.has_payload(),
        };
        client
            .publish_durable(&self.result_subject, envelope::pack(&event)?)
            .await
    }

    /// Create the object, or overwrite it when an earlier attempt already stored it
    async fn upsert(&self, client: &dyn BrokerClient, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        let bucket = &self.config.object_bucket;

        match client.kv_get(bucket, key).await? {
            Some(_) => client.kv_put(bucket, key, value).await,
            None => match client.kv_create(bucket, key, value.clone()).await {
                Err(BrokerError::KeyExists) => client.kv_put(bucket, key, value).await,
                other => other,
            },
        }
    }
}

#[async_trait]
impl ResultSender for BrokerResultSender {
    async fn send_batch(&self, session: &Session) -> Result<usize> {
        let batch = self.store.completed_batch(self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut failures = 0;
        for job in &batch {
            match self.ship(session, job).await {
                Ok(()) => {}
                Err(BrokerError::ConnectionClosed) => {
                    return Err(BrokerError::ConnectionClosed.into());
                }
                Err(e) => {
                    failures += 1;
                    error!(key = %job.key, "Failed to ship result: {}", e);
                }
            }
        }

        if failures > 0 {
            warn!(failures, batch = batch.len(), "Batch kept for the next cycle");
            return Ok(0);
        }

        let keys: Vec<String> = batch.iter().map(|job| job.key.clone()).collect();
        let deleted = self.store.delete_shipped(&keys)?;
        info!(shipped = deleted, "Results shipped");

        Ok(deleted)
    }
}

/// Ship a batch every `interval` until the session is lost
pub async fn run_sender(
    sender: Arc<dyn ResultSender>,
    session: Session,
    interval: Duration,
) -> Result<()> {
    loop {
        match sender.send_batch(&session).await {
            Ok(_) => {}
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => error!("Result sender cycle failed: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
}
