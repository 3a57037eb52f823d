use super::{MessageHandler, Session};
use crate::broker::Delivery;
use crate::error::Result;
use async_trait::async_trait;
use harvester_core::WorkerIdentity;
use harvester_persistence::{JobStore, NewJob};
use harvester_protocol::{envelope, TaskMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queues the identifiers the server assigns to this worker
pub struct TaskHandler {
    store: Arc<JobStore>,
    subject_prefix: String,
}

impl TaskHandler {
    pub fn new(store: Arc<JobStore>, subject_prefix: impl Into<String>) -> Self {
        TaskHandler {
            store,
            subject_prefix: subject_prefix.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for TaskHandler {
    fn name(&self) -> &'static str {
        "task"
    }

    fn subject(&self, identity: &WorkerIdentity) -> String {
        format!("{}.{}", self.subject_prefix, identity.id)
    }

    fn durable(&self, identity: &WorkerIdentity) -> Option<String> {
        Some(format!("worker-{}-tasks", identity.id))
    }

    async fn handle(&self, delivery: &Delivery, _session: &Session) -> Result<()> {
        let message: TaskMessage = match envelope::unpack_valid(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(subject = %delivery.subject, "Dropping malformed task message: {}", e);
                return Ok(());
            }
        };

        if message.is_empty() {
            debug!(subject = %delivery.subject, "Empty task batch");
            return Ok(());
        }

        let received = message.len();
        let items: Vec<NewJob> = message
            .into_items()
            .into_iter()
            .map(|item| NewJob::remote(item.external_id, item.key))
            .collect();

        let blank = received - items.len();
        if blank > 0 {
            warn!(blank, "Dropped task items with a blank key");
        }

        let inserted = self.store.insert_tasks(&items)?;
        info!(received, inserted, "Queued tasks");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use harvester_core::JobStatus;
    use harvester_persistence::JobStoreConfig;
    use harvester_protocol::TaskItem;
    use tempfile::TempDir;

    fn delivery(payload: Vec<u8>) -> Delivery {
        Delivery {
            message_id: 1,
            subject: "task.3".to_string(),
            reply_to: None,
            payload,
        }
    }

    #[tokio::test]
    async fn test_batch_with_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: temp_dir.path().to_path_buf(),
            })
            .unwrap(),
        );
        let handler = TaskHandler::new(store.clone(), "task");
        let session = Session {
            client: MemoryBroker::new().connection(),
            identity: WorkerIdentity::new(3, "node"),
        };
        assert_eq!(handler.subject(&session.identity), "task.3");

        let batch = TaskMessage::Batch(vec![
            TaskItem {
                external_id: 1,
                key: "79990001122".to_string(),
            },
            TaskItem {
                external_id: 2,
                key: "79990003344".to_string(),
            },
        ]);
        let payload = envelope::pack(&batch).unwrap();

        handler.handle(&delivery(payload.clone()), &session).await.unwrap();
        handler.handle(&delivery(payload), &session).await.unwrap();

        assert_eq!(store.count_by_status(JobStatus::Created).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blank_single_item_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: temp_dir.path().to_path_buf(),
            })
            .unwrap(),
        );
        let handler = TaskHandler::new(store.clone(), "task");
        let session = Session {
            client: MemoryBroker::new().connection(),
            identity: WorkerIdentity::new(3, "node"),
        };

        let batch = TaskMessage::Single(TaskItem {
            external_id: 1,
            key: " ".to_string(),
        });
        let payload = envelope::pack(&batch).unwrap();

        handler.handle(&delivery(payload), &session).await.unwrap();
        assert_eq!(store.stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_blank_item_does_not_sink_its_batch() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            JobStore::open(JobStoreConfig {
                data_dir: temp_dir.path().to_path_buf(),
            })
            .unwrap(),
        );
        let handler = TaskHandler::new(store.clone(), "task");
        let session = Session {
            client: MemoryBroker::new().connection(),
            identity: WorkerIdentity::new(3, "node"),
        };

        let batch = TaskMessage::Batch(vec![
            TaskItem {
                external_id: 1,
                key: "79990001122".to_string(),
            },
            TaskItem {
                external_id: 2,
                key: "".to_string(),
            },
            TaskItem {
                external_id: 3,
                key: "79990003344".to_string(),
            },
        ]);
        let payload = envelope::pack(&batch).unwrap();

        handler.handle(&delivery(payload), &session).await.unwrap();
        assert_eq!(store.count_by_status(JobStatus::Created).unwrap(), 2);
        assert_eq!(store.get("79990003344").unwrap().unwrap().external_id, Some(3));
    }
}
