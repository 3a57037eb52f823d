//! Broker client capability.
//!
//! Components talk to the broker only through [`BrokerClient`], so the
//! runtime can run over NATS in production and over an in-process broker
//! in tests.

#[cfg(any(test, feature = "test-util"))]
mod memory;
mod nats;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryBroker;
pub use nats::{NatsBroker, NatsConnector, TaskStream};

use crate::error::BrokerError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// One inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Connection-local id used to acknowledge the message
    pub message_id: u64,
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Stream of messages delivered for one subscription
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Subscription {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivery, or `None` once the connection behind it is gone
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fire-and-forget publish, used for replies
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()>;

    /// Publish into a persistent stream and wait for the store acknowledgement
    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()>;

    /// Request/reply with a bounded wait
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BrokerResult<Vec<u8>>;

    /// Open a subscription; `durable` names a consumer that survives reconnects
    async fn subscribe(&self, subject: &str, durable: Option<&str>) -> BrokerResult<Subscription>;

    /// Acknowledge a delivery; a no-op for non-durable subscriptions
    async fn ack(&self, message_id: u64) -> BrokerResult<()>;

    async fn kv_get(&self, bucket: &str, key: &str) -> BrokerResult<Option<Vec<u8>>>;

    /// Unconditional write, returns the new revision
    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64>;

    /// Write only if absent; `KeyExists` otherwise
    async fn kv_create(&self, bucket: &str, key: &str, value: Vec<u8>) -> BrokerResult<u64>;

    async fn kv_delete(&self, bucket: &str, key: &str) -> BrokerResult<()>;

    fn is_closed(&self) -> bool;
}

/// Dials new broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &str) -> BrokerResult<Arc<dyn BrokerClient>>;
}
