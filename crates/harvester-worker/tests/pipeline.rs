use async_trait::async_trait;
use harvester_core::Job;
use harvester_persistence::{JobStore, JobStoreConfig};
use harvester_protocol::{envelope, InitAnswer, Ping, ResultEvent, TaskItem, TaskMessage};
use harvester_worker::broker::MemoryBroker;
use harvester_worker::processor::{ProcessResult, Processor};
use harvester_worker::{Supervisor, SupervisorState, WorkerConfig, WorkerContext};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Finds numbers starting with 7, fails everything else
struct Lookup;

#[async_trait]
impl Processor for Lookup {
    async fn login(&self, _timeout: Duration) -> bool {
        true
    }

    async fn process(&self, job: &Job) -> ProcessResult {
        if job.key.starts_with('7') {
            Ok(Some(format!("avatar-{}", job.key).into_bytes()))
        } else {
            Err("subscriber not found".to_string())
        }
    }
}

fn task_batch(items: &[(u64, &str)]) -> Vec<u8> {
    let message = TaskMessage::Batch(
        items
            .iter()
            .map(|(external_id, key)| TaskItem {
                external_id: *external_id,
                key: key.to_string(),
            })
            .collect(),
    );
    envelope::pack(&message).unwrap()
}

fn result_events(broker: &MemoryBroker) -> Vec<ResultEvent> {
    broker
        .published("result.server")
        .iter()
        .map(|bytes| envelope::unpack(bytes).unwrap())
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_tasks_flow_from_broker_to_results() {
    let temp_dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    broker.respond("server.init", |_| {
        envelope::pack(&InitAnswer {
            id: 7,
            name: "node-a".to_string(),
        })
        .ok()
    });

    let mut config = WorkerConfig::default();
    config.worker.name = "node-a".to_string();
    config.scan.wait_interval_secs = 1;
    config.sender.interval_secs = 1;

    let store = Arc::new(
        JobStore::open(JobStoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
        })
        .unwrap(),
    );
    let context = WorkerContext::new(config, store.clone(), Arc::new(broker.clone()), Arc::new(Lookup));
    let supervisor = Arc::new(Supervisor::new(Arc::new(context)));
    let mut state = supervisor.state();

    let running = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run().await }
    });

    state
        .wait_for(|s| *s == SupervisorState::Running)
        .await
        .unwrap();
    broker.wait_for_subscriber("task.7").await;
    broker.wait_for_subscriber("heartbeat.7").await;

    // malformed envelope first, then a real batch with a duplicate
    broker.deliver("task.7", None, b"junk".to_vec());
    broker.deliver(
        "task.7",
        None,
        task_batch(&[(1, "79990001122"), (2, "1234567890"), (3, "79990001122")]),
    );

    wait_until(|| result_events(&broker).len() >= 2).await;
    wait_until(|| store.stats().unwrap().total == 0).await;

    let events = result_events(&broker);
    assert_eq!(events.len(), 2);

    let found = events.iter().find(|e| e.key == "79990001122").unwrap();
    assert_eq!(found.worker_id, 7);
    assert_eq!(found.external_id, Some(1));
    assert!(found.has_payload);
    assert_eq!(
        broker.kv_value("data_store", "79990001122"),
        Some(b"avatar-79990001122".to_vec())
    );

    let missing = events.iter().find(|e| e.key == "1234567890").unwrap();
    assert!(!missing.has_payload);

    // liveness record and ping/pong
    wait_until(|| broker.kv_value("connected_users", "7").is_some()).await;
    broker.deliver(
        "heartbeat.7",
        Some("_inbox.ping"),
        envelope::pack(&Ping { id: 7 }).unwrap(),
    );
    wait_until(|| !broker.published("_inbox.ping").is_empty()).await;

    // the session survives a broker drop
    broker.close();
    wait_until(|| broker.dials() >= 2).await;
    state
        .wait_for(|s| *s == SupervisorState::Running)
        .await
        .unwrap();
    broker.wait_for_subscriber("task.7").await;

    broker.deliver("task.7", None, task_batch(&[(4, "79990009999")]));
    wait_until(|| result_events(&broker).len() >= 3).await;
    assert_eq!(result_events(&broker)[2].key, "79990009999");

    running.abort();
}
