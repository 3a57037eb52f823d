use super::{BrokerClient, BrokerResult, Connector, Delivery, Subscription};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use async_nats::jetstream::{self, consumer, kv, stream};
use async_nats::{ConnectErrorKind, ConnectOptions, Event, RequestErrorKind};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Stream backing the durable per-worker task subjects
#[derive(Debug, Clone)]
pub struct TaskStream {
    pub name: String,
    pub subjects: Vec<String>,
}

/// JetStream messages handed to a subscriber and not acknowledged yet
#[derive(Default)]
struct Inflight {
    next_id: AtomicU64,
    messages: DashMap<u64, jetstream::Message>,
}

impl Inflight {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Broker client over NATS.
///
/// Plain subscriptions and request/reply use core NATS. Durable
/// subscriptions are JetStream pull consumers with explicit ack, and the
/// key-value buckets are JetStream KV stores.
///
/// The client does not ride through a server disconnect: the first
/// `Disconnected` event closes it, ends its subscriptions and makes every
/// further call fail with `ConnectionClosed`.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    task_stream: TaskStream,
    buckets: DashMap<String, kv::Store>,
    inflight: Arc<Inflight>,
    closed: Arc<watch::Sender<bool>>,
    forwarders: Mutex<Vec<AbortHandle>>,
}

impl NatsBroker {
    pub async fn connect(
        url: &str,
        client_name: &str,
        timeout: Duration,
        task_stream: TaskStream,
    ) -> BrokerResult<Self> {
        let closed = Arc::new(watch::Sender::new(false));
        let flag = closed.clone();

        let client = ConnectOptions::new()
            .name(client_name)
            .connection_timeout(timeout)
            .event_callback(move |event| {
                let flag = flag.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            warn!("NATS connection lost");
                            flag.send_replace(true);
                        }
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(url)
            .await
            .map_err(|e| connect_error(e.kind(), e))?;

        info!(url, "NATS connection established");

        Ok(NatsBroker {
            jetstream: jetstream::new(client.clone()),
            client,
            task_stream,
            buckets: DashMap::new(),
            inflight: Arc::new(Inflight::default()),
            closed,
            forwarders: Mutex::new(Vec::new()),
        })
    }

    fn live(&self) -> BrokerResult<()> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Error for a failed call: a dropped connection wins over the cause
    fn failure(&self, cause: impl Display) -> BrokerError {
        if self.is_closed() {
            BrokerError::ConnectionClosed
        } else {
            BrokerError::Rejected(cause.to_string())
        }
    }

    async fn bucket(&self, name: &str) -> BrokerResult<kv::Store> {
        self.live()?;
        if let Some(store) = self.buckets.get(name) {
            return Ok(store.clone());
        }

        let store = match self.jetstream.get_key_value(name).await {
            Ok(store) => store,
            Err(_) => {
                info!(bucket = name, "Creating key-value bucket");
                self.jetstream
                    .create_key_value(kv::Config {
                        bucket: name.to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| self.failure(e))?
            }
        };

        self.buckets.insert(name.to_string(), store.clone());
        Ok(store)
    }

    async fn pull_consumer(&self, subject: &str, durable: &str) -> BrokerResult<consumer::PullConsumer> {
        let stream = self
            .jetstream
            .get_or_create_stream(stream::Config {
                name: self.task_stream.name.clone(),
                subjects: self.task_stream.subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| self.failure(e))?;

        stream
            .get_or_create_consumer(
                durable,
                consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| self.failure(e))
    }

    fn track(&self, task: tokio::task::JoinHandle<()>) {
        let mut forwarders = self.forwarders.lock();
        forwarders.retain(|handle| !handle.is_finished());
        forwarders.push(task.abort_handle());
    }
}

impl Drop for NatsBroker {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()> {
        self.live()?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| self.failure(e))
    }

    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()> {
        self.live()?;
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| self.failure(e))?;

        match ack.await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), jetstream::context::PublishErrorKind::TimedOut) => {
                Err(BrokerError::Timeout)
            }
            Err(e) => Err(self.failure(e)),
        }
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BrokerResult<Vec<u8>> {
        self.live()?;
        let reply = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        .map_err(|_| BrokerError::Timeout)?;

        match reply {
            Ok(message) => Ok(message.payload.to_vec()),
            Err(e) if matches!(e.kind(), RequestErrorKind::TimedOut) => Err(BrokerError::Timeout),
            Err(e) => Err(self.failure(e)),
        }
    }

    async fn subscribe(&self, subject: &str, durable: Option<&str>) -> BrokerResult<Subscription> {
        self.live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = self.closed.subscribe();

        let task = match durable {
            Some(durable) => {
                let messages = self
                    .pull_consumer(subject, durable)
                    .await?
                    .messages()
                    .await
                    .map_err(|e| self.failure(e))?;

                let inflight = self.inflight.clone();
                tokio::spawn(forward(subject.to_string(), messages, closed, tx, move |message| {
                    let delivery = delivery(inflight.next_id(), &message.message);
                    inflight.messages.insert(delivery.message_id, message);
                    delivery
                }))
            }
            None => {
                let subscriber = self
                    .client
                    .subscribe(subject.to_string())
                    .await
                    .map_err(|e| self.failure(e))?;

                let inflight = self.inflight.clone();
                let messages = subscriber.map(Ok::<_, BrokerError>);
                tokio::spawn(forward(subject.to_string(), messages, closed, tx, move |message| {
                    delivery(inflight.next_id(), &message)
                }))
            }
        };

        self.track(task);
        info!(subject, durable = durable.unwrap_or("-"), "Subscribed");
        Ok(Subscription::new(subject, rx))
    }

    async fn ack(&self, message_id: u64) -> BrokerResult<()> {
        // core NATS deliveries carry no ack
        let Some((_, message)) = self.inflight.messages.remove(&message_id) else {
            return Ok(());
        };
        self.live()?;
        message.ack().await.map_err(|e| self.failure(e))
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let store = self.bucket(bucket).await?;
        match store.get(key).await {
            Ok(value) => Ok(value.map(|bytes| bytes.to_vec())),
            Err(e) if matches!(e.kind(), kv::EntryErrorKind::TimedOut) => Err(BrokerError::Timeout),
            Err(e) => Err(self.failure(e)),
        }
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        let store = self.bucket(bucket).await?;
        store.put(key, value.into()).await.map_err(|e| self.failure(e))
    }

    async fn kv_create(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64> {
        let store = self.bucket(bucket).await?;
        match store.create(key, value.into()).await {
            Ok(revision) => Ok(revision),
            Err(e) if matches!(e.kind(), kv::CreateErrorKind::AlreadyExists) => {
                Err(BrokerError::KeyExists)
            }
            Err(e) => Err(self.failure(e)),
        }
    }

    async fn kv_delete(&self, bucket: &str, key: &str) -> BrokerResult<()> {
        let store = self.bucket(bucket).await?;
        store.delete(key).await.map_err(|e| self.failure(e))
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn delivery(message_id: u64, message: &async_nats::Message) -> Delivery {
    Delivery {
        message_id,
        subject: message.subject.to_string(),
        reply_to: message.reply.as_ref().map(|reply| reply.to_string()),
        payload: message.payload.to_vec(),
    }
}

/// Move messages from a NATS stream into a subscription until either side
/// goes away or the connection closes.
///
/// The subscription channel is unbounded: a slow handler on one subject
/// must never hold up replies, acks or other subscriptions.
async fn forward<S, M, E, F>(
    subject: String,
    messages: S,
    mut closed: watch::Receiver<bool>,
    sender: mpsc::UnboundedSender<Delivery>,
    mut admit: F,
) where
    S: Stream<Item = Result<M, E>>,
    E: Display,
    F: FnMut(M) -> Delivery,
{
    let mut messages = std::pin::pin!(messages);

    loop {
        let next = tokio::select! {
            next = messages.next() => next,
            _ = closed.wait_for(|closed| *closed) => {
                debug!(subject = %subject, "Connection closed, ending subscription");
                return;
            }
        };

        match next {
            Some(Ok(message)) => {
                if sender.send(admit(message)).is_err() {
                    debug!(subject = %subject, "Subscriber dropped");
                    return;
                }
            }
            Some(Err(e)) => warn!(subject = %subject, "Receive failed: {}", e),
            None => {
                debug!(subject = %subject, "Subscription ended by the server");
                return;
            }
        }
    }
}

fn connect_error(kind: ConnectErrorKind, cause: impl Display) -> BrokerError {
    match kind {
        ConnectErrorKind::TimedOut => BrokerError::Timeout,
        ConnectErrorKind::Io | ConnectErrorKind::Dns | ConnectErrorKind::MaxReconnects => {
            BrokerError::Unreachable(cause.to_string())
        }
        _ => BrokerError::Rejected(cause.to_string()),
    }
}

/// Dials [`NatsBroker`] connections
pub struct NatsConnector {
    client_name: String,
    connect_timeout: Duration,
    task_stream: TaskStream,
}

impl NatsConnector {
    pub fn new(client_name: impl Into<String>, config: &BrokerConfig) -> Self {
        NatsConnector {
            client_name: client_name.into(),
            connect_timeout: config.connect_timeout(),
            task_stream: TaskStream {
                name: config.task_stream.clone(),
                subjects: vec![format!("{}.*", config.task_subject_prefix)],
            },
        }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn dial(&self, url: &str) -> BrokerResult<Arc<dyn BrokerClient>> {
        let broker = NatsBroker::connect(
            url,
            &self.client_name,
            self.connect_timeout,
            self.task_stream.clone(),
        )
        .await?;
        Ok(Arc::new(broker))
    }
}
