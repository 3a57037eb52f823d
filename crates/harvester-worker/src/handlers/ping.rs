use super::{MessageHandler, Session};
use crate::broker::Delivery;
use crate::error::Result;
use async_trait::async_trait;
use harvester_core::WorkerIdentity;
use harvester_protocol::{envelope, Ping};
use tracing::{debug, error, warn};

/// Answers server liveness pings with a pong carrying this worker's id
pub struct PingHandler {
    subject_prefix: String,
}

impl PingHandler {
    pub fn new(subject_prefix: impl Into<String>) -> Self {
        PingHandler {
            subject_prefix: subject_prefix.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn subject(&self, identity: &WorkerIdentity) -> String {
        format!("{}.{}", self.subject_prefix, identity.id)
    }

    async fn handle(&self, delivery: &Delivery, session: &Session) -> Result<()> {
        let ping: Ping = match envelope::unpack_valid(&delivery.payload) {
            Ok(ping) => ping,
            Err(e) => {
                warn!(subject = %delivery.subject, "Dropping malformed ping: {}", e);
                return Ok(());
            }
        };

        let own_id = session.identity.id;
        if ping.id != own_id {
            error!(received = ping.id, expected = own_id, "Ping addressed to another worker");
        }

        let Some(reply_to) = delivery.reply_to.as_deref() else {
            warn!("Ping without a reply address");
            return Ok(());
        };

        let pong = envelope::pack(&Ping { id: own_id })?;
        session.client.publish(reply_to, pong).await?;
        debug!(reply_to, "Pong sent");

        Ok(())
    }
}
