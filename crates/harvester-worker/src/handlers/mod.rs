//! Inbound message handlers and the dispatcher that feeds them.

mod ping;
mod task;

pub use ping::PingHandler;
pub use task::TaskHandler;

use crate::broker::{BrokerClient, Delivery};
use crate::error::{BrokerError, Result, WorkerError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use harvester_core::WorkerIdentity;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connection and identity of one authenticated session
#[derive(Clone)]
pub struct Session {
    pub client: Arc<dyn BrokerClient>,
    pub identity: WorkerIdentity,
}

/// Handles the messages delivered on one per-worker subject
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn subject(&self, identity: &WorkerIdentity) -> String;

    /// Durable consumer name, if deliveries should survive reconnects
    fn durable(&self, _identity: &WorkerIdentity) -> Option<String> {
        None
    }

    async fn handle(&self, delivery: &Delivery, session: &Session) -> Result<()>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MessageHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn handlers(&self) -> &[Arc<dyn MessageHandler>] {
        &self.handlers
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }
}

type Routed = (Arc<dyn MessageHandler>, String, Option<Delivery>);

/// Subscribes every registered handler and routes deliveries to them
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Dispatcher { registry }
    }

    /// Pump deliveries until a subscription ends.
    ///
    /// Returns `WorkerError::Disconnected` when the connection goes away.
    pub async fn run(&self, session: Session) -> Result<()> {
        let mut streams: Vec<BoxStream<'static, Routed>> = Vec::new();

        for handler in self.registry.handlers() {
            let subject = handler.subject(&session.identity);
            let durable = handler.durable(&session.identity);
            let subscription = session.client.subscribe(&subject, durable.as_deref()).await?;
            let subject = subscription.subject().to_string();
            info!(handler = handler.name(), subject = %subject, "Handler subscribed");

            let deliveries = stream::unfold(subscription, |mut subscription| async move {
                subscription
                    .next()
                    .await
                    .map(|delivery| (delivery, subscription))
            });

            let handler = handler.clone();
            let routed = deliveries
                .map(Some)
                .chain(stream::once(async { None }))
                .map(move |delivery| (handler.clone(), subject.clone(), delivery));
            streams.push(routed.boxed());
        }

        if streams.is_empty() {
            warn!("No message handlers registered");
            return Ok(());
        }

        let mut merged = stream::select_all(streams);
        while let Some((handler, subject, delivery)) = merged.next().await {
            match delivery {
                Some(delivery) => self.dispatch(&handler, delivery, &session).await?,
                None => {
                    return Err(WorkerError::Disconnected(format!(
                        "subscription {} ended",
                        subject
                    )))
                }
            }
        }

        Ok(())
    }

    /// Run one handler and acknowledge the message whatever happened
    async fn dispatch(
        &self,
        handler: &Arc<dyn MessageHandler>,
        delivery: Delivery,
        session: &Session,
    ) -> Result<()> {
        let message_id = delivery.message_id;

        let outcome = AssertUnwindSafe(handler.handle(&delivery, session))
            .catch_unwind()
            .await;

        let disconnect = match outcome {
            Ok(Ok(())) => {
                debug!(handler = handler.name(), message_id, "Message handled");
                None
            }
            Ok(Err(e)) => {
                error!(
                    handler = handler.name(),
                    subject = %delivery.subject,
                    "Handler failed: {}",
                    e
                );
                e.is_disconnect().then_some(e)
            }
            Err(_) => {
                error!(handler = handler.name(), subject = %delivery.subject, "Handler panicked");
                None
            }
        };

        match session.client.ack(message_id).await {
            Ok(()) => {}
            Err(BrokerError::ConnectionClosed) => {
                return Err(BrokerError::ConnectionClosed.into());
            }
            Err(e) => warn!(message_id, "Failed to acknowledge message: {}", e),
        }

        match disconnect {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
