use crate::broker::{BrokerClient, Connector};
use crate::config::{BrokerConfig, IdentityConfig};
use crate::error::{BrokerError, Result, WorkerError};
use harvester_core::WorkerIdentity;
use harvester_protocol::{envelope, InitAnswer, InitRequest};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Owns the broker connection and negotiates the worker identity on it
pub struct ConnectionManager {
    config: BrokerConfig,
    worker: IdentityConfig,
    connector: Arc<dyn Connector>,
    client: RwLock<Option<Arc<dyn BrokerClient>>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig, worker: IdentityConfig, connector: Arc<dyn Connector>) -> Self {
        ConnectionManager {
            config,
            worker,
            connector,
            client: RwLock::new(None),
        }
    }

    /// Dial the broker once.
    ///
    /// Returns `Ok(false)` when the broker is unreachable or the dial timed
    /// out; those are expected while the broker is down.
    pub async fn connect(&self) -> Result<bool> {
        match self.connector.dial(&self.config.url).await {
            Ok(client) => {
                *self.client.write() = Some(client);
                info!("Connected to broker {}", self.config.url);
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                warn!("Broker {} not reachable: {}", self.config.url, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current live connection, dialing until one is established
    pub async fn ensure_connected(&self) -> Arc<dyn BrokerClient> {
        loop {
            if let Some(client) = self.current() {
                return client;
            }

            match self.connect().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("Broker connect failed: {}", e),
            }

            tokio::time::sleep(self.config.reconnect_delay()).await;
        }
    }

    /// Run the init handshake on the current connection.
    ///
    /// Any failure, including a timeout or a malformed answer, is reported
    /// as `WorkerError::Disconnected`.
    pub async fn authenticate(&self) -> Result<WorkerIdentity> {
        let client = self.ensure_connected().await;

        let request = InitRequest {
            id: self.worker.id,
            name: self.worker.name.clone(),
        };
        let payload = envelope::pack(&request)?;
        let timeout = self.config.auth_timeout();

        let reply = client
            .request(&self.config.init_subject, payload, timeout)
            .await
            .map_err(|e| match e {
                BrokerError::Timeout => WorkerError::Disconnected(format!(
                    "no init answer within {:?}",
                    timeout
                )),
                other => WorkerError::Disconnected(format!("init request failed: {}", other)),
            })?;

        let answer: InitAnswer = envelope::unpack_valid(&reply)
            .map_err(|e| WorkerError::Disconnected(format!("malformed init answer: {}", e)))?;

        if answer.name != self.worker.name {
            return Err(WorkerError::Disconnected(format!(
                "init answer for {} while registering as {}",
                answer.name, self.worker.name
            )));
        }
        if let Some(requested) = self.worker.id {
            if answer.id != requested {
                return Err(WorkerError::Disconnected(format!(
                    "server assigned id {} instead of {}",
                    answer.id, requested
                )));
            }
        }

        let identity = WorkerIdentity::new(answer.id, answer.name);
        info!(worker = %identity, "Authenticated with broker");

        Ok(identity)
    }

    /// The connection if it is still open
    pub fn current(&self) -> Option<Arc<dyn BrokerClient>> {
        self.client
            .read()
            .as_ref()
            .filter(|client| !client.is_closed())
            .cloned()
    }

    /// Forget the connection so the next authentication dials a fresh one
    pub fn reset(&self) {
        let had_client = self.client.write().take().is_some();
        if had_client {
            info!("Dropped broker session");
        }
    }
}
