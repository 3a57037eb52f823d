use super::{BrokerClient, BrokerResult, Connector, Delivery, Subscription};
use crate::error::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct State {
    /// Bumped on `close`; connections from older generations are dead
    generation: u64,
    dials: usize,
    failing_dials: usize,
    responders: HashMap<String, Responder>,
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    next_message_id: u64,
    published: Vec<(String, Vec<u8>)>,
    publish_attempts: usize,
    failing_publishes: HashSet<usize>,
    acked: Vec<u64>,
    kv: HashMap<(String, String), Vec<u8>>,
    kv_revision: u64,
    kv_writes: usize,
    kv_deletes: Vec<(String, String)>,
    kv_timeouts: usize,
    failing_kv_writes: usize,
}

/// In-process broker with fault injection.
///
/// Cloning shares the same state; every connection dialed from it sees the
/// same subjects and buckets.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live connection without going through `dial`
    pub fn connection(&self) -> Arc<dyn BrokerClient> {
        let generation = self.state.lock().generation;
        Arc::new(MemoryConnection {
            broker: self.clone(),
            generation,
        })
    }

    /// Answer requests on `subject`; returning `None` leaves the caller to time out
    pub fn respond<F>(&self, subject: &str, responder: F)
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .responders
            .insert(subject.to_string(), Arc::new(responder));
    }

    /// Push a message to every subscriber of `subject`, returning its message id
    pub fn deliver(&self, subject: &str, reply_to: Option<&str>, payload: Vec<u8>) -> u64 {
        let mut state = self.state.lock();
        state.next_message_id += 1;
        let message_id = state.next_message_id;

        if let Some(senders) = state.subscriptions.get_mut(subject) {
            senders.retain(|sender| {
                sender
                    .send(Delivery {
                        message_id,
                        subject: subject.to_string(),
                        reply_to: reply_to.map(str::to_string),
                        payload: payload.clone(),
                    })
                    .is_ok()
            });
        }

        message_id
    }

    pub fn has_subscriber(&self, subject: &str) -> bool {
        self.state
            .lock()
            .subscriptions
            .get(subject)
            .map(|senders| senders.iter().any(|sender| !sender.is_closed()))
            .unwrap_or(false)
    }

    /// Wait until something subscribes to `subject`
    pub async fn wait_for_subscriber(&self, subject: &str) {
        while !self.has_subscriber(subject) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drop every live connection and end all subscriptions
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.subscriptions.clear();
    }

    pub fn fail_dials(&self, count: usize) {
        self.state.lock().failing_dials = count;
    }

    pub fn dials(&self) -> usize {
        self.state.lock().dials
    }

    /// Make the `nth` publish from now (1-based) fail
    pub fn fail_publish(&self, nth: usize) {
        let mut state = self.state.lock();
        let attempt = state.publish_attempts + nth;
        state.failing_publishes.insert(attempt);
    }

    /// Make the next `count` kv writes fail
    pub fn fail_kv_writes(&self, count: usize) {
        self.state.lock().failing_kv_writes = count;
    }

    /// Make the next `count` kv operations time out
    pub fn time_out_kv(&self, count: usize) {
        self.state.lock().kv_timeouts = count;
    }

    pub fn published(&self, subject: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(published, _)| published == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().acked.clone()
    }

    pub fn kv_value(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .kv
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn set_kv(&self, bucket: &str, key: &str, value: Vec<u8>) {
        self.state
            .lock()
            .kv
            .insert((bucket.to_string(), key.to_string()), value);
    }

    /// Successful kv writes so far
    pub fn kv_writes(&self) -> usize {
        self.state.lock().kv_writes
    }

    pub fn kv_deletes(&self) -> Vec<(String, String)> {
        self.state.lock().kv_deletes.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn dial(&self, _url: &str) -> BrokerResult<Arc<dyn BrokerClient>> {
        {
            let mut state = self.state.lock();
            state.dials += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                return Err(BrokerError::Unreachable("connection refused".to_string()));
            }
        }
        Ok(self.connection())
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    generation: u64,
}

impl MemoryConnection {
    fn live(&self) -> BrokerResult<parking_lot::MutexGuard<'_, State>> {
        let state = self.broker.state.lock();
        if state.generation != self.generation {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(state)
    }

    fn kv_op(&self) -> BrokerResult<parking_lot::MutexGuard<'_, State>> {
        let mut state = self.live()?;
        if state.kv_timeouts > 0 {
            state.kv_timeouts -= 1;
            return Err(BrokerError::Timeout);
        }
        Ok(state)
    }

    fn kv_write(&self, bucket: &str, key: &str, value: Vec<u8>, create: bool) -> BrokerResult<u64> {
        let mut state = self.kv_op()?;
        if state.failing_kv_writes > 0 {
            state.failing_kv_writes -= 1;
            return Err(BrokerError::Rejected("injected kv failure".to_string()));
        }

        let entry = (bucket.to_string(), key.to_string());
        if create && state.kv.contains_key(&entry) {
            return Err(BrokerError::KeyExists);
        }

        state.kv.insert(entry, value);
        state.kv_revision += 1;
        state.kv_writes += 1;
        Ok(state.kv_revision)
    }
}

#[async_trait]
impl BrokerClient for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()> {
        let mut state = self.live()?;
        state.publish_attempts += 1;
        let attempt = state.publish_attempts;
        if state.failing_publishes.remove(&attempt) {
            return Err(BrokerError::Rejected("injected publish failure".to_string()));
        }

        state.published.push((subject.to_string(), payload));
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()> {
        self.publish(subject, payload).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BrokerResult<Vec<u8>> {
        let responder = self.live()?.responders.get(subject).cloned();

        if let Some(reply) = responder.and_then(|responder| responder(&payload)) {
            return Ok(reply);
        }

        tokio::time::sleep(timeout).await;
        Err(BrokerError::Timeout)
    }

    async fn subscribe(&self, subject: &str, _durable: Option<&str>) -> BrokerResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.live()?
            .subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject, rx))
    }

    async fn ack(&self, message_id: u64) -> BrokerResult<()> {
        self.live()?.acked.push(message_id);
        Ok(())
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let state = self.kv_op()?;
        Ok(state.kv.get(&(bucket.to_string(), key.to_string())).cloned())
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        self.kv_write(bucket, key, value, false)
    }

    async fn kv_create(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        self.kv_write(bucket, key, value, true)
    }

    async fn kv_delete(&self, bucket: &str, key: &str) -> BrokerResult<()> {
        let mut state = self.kv_op()?;
        let entry = (bucket.to_string(), key.to_string());
        state.kv_deletes.push(entry.clone());
        match state.kv.remove(&entry) {
            Some(_) => Ok(()),
            None => Err(BrokerError::KeyNotFound),
        }
    }

    fn is_closed(&self) -> bool {
        self.broker.state.lock().generation != self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_create_and_put() {
        let broker = MemoryBroker::new();
        let client = broker.connection();

        client.kv_create("bucket", "k", vec![1]).await.unwrap();
        assert!(matches!(
            client.kv_create("bucket", "k", vec![2]).await,
            Err(BrokerError::KeyExists)
        ));
        client.kv_put("bucket", "k", vec![3]).await.unwrap();
        assert_eq!(client.kv_get("bucket", "k").await.unwrap(), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_close_ends_connection() {
        let broker = MemoryBroker::new();
        let client = broker.connection();
        let mut subscription = client.subscribe("task.1", None).await.unwrap();

        broker.close();

        assert!(client.is_closed());
        assert!(subscription.next().await.is_none());
        assert!(matches!(
            client.publish("x", vec![]).await,
            Err(BrokerError::ConnectionClosed)
        ));

        let fresh = broker.dial("memory").await.unwrap();
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn test_undrained_subscription_keeps_its_messages() {
        let broker = MemoryBroker::new();
        let client = broker.connection();
        let mut subscription = client.subscribe("task.1", None).await.unwrap();

        for i in 0..300u32 {
            broker.deliver("task.1", None, i.to_be_bytes().to_vec());
        }
        client.publish("result.server", vec![1]).await.unwrap();

        assert!(broker.has_subscriber("task.1"));
        let mut received = 0;
        while received < 300 {
            subscription.next().await.unwrap();
            received += 1;
        }
    }

    #[tokio::test]
    async fn test_injected_publish_failure() {
        let broker = MemoryBroker::new();
        let client = broker.connection();
        broker.fail_publish(2);

        assert!(client.publish("s", vec![1]).await.is_ok());
        assert!(client.publish("s", vec![2]).await.is_err());
        assert!(client.publish("s", vec![3]).await.is_ok());
        assert_eq!(broker.published("s"), vec![vec![1], vec![3]]);
    }
}
