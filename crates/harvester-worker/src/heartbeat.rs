use crate::broker::{BrokerClient, BrokerResult};
use crate::config::HeartbeatConfig;
use crate::error::{BrokerError, Result};
use crate::handlers::Session;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Marker the server writes when it considers a worker gone
pub const NOT_CONNECTED: &str = "not connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Written,
    Skipped,
}

/// Whether the liveness record must be rewritten at `now`
pub fn needs_write(record: Option<&[u8]>, now: DateTime<Utc>, staleness: Duration) -> bool {
    let Some(bytes) = record else {
        return true;
    };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return true;
    };

    let text = text.trim();
    if text == NOT_CONNECTED {
        return true;
    }

    match DateTime::parse_from_rfc3339(text) {
        // a timestamp ahead of our clock counts as fresh
        Ok(written) => now
            .signed_duration_since(written.with_timezone(&Utc))
            .to_std()
            .map(|age| age >= staleness)
            .unwrap_or(false),
        Err(_) => true,
    }
}

/// Keeps this worker's timestamp in the shared liveness bucket fresh
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        HeartbeatMonitor { config }
    }

    pub async fn tick(
        &self,
        client: &dyn BrokerClient,
        worker_id: u64,
        now: DateTime<Utc>,
    ) -> BrokerResult<Tick> {
        let key = worker_id.to_string();
        let record = client.kv_get(&self.config.bucket, &key).await?;

        if !needs_write(record.as_deref(), now, self.config.staleness()) {
            return Ok(Tick::Skipped);
        }

        let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        client
            .kv_put(&self.config.bucket, &key, stamp.into_bytes())
            .await?;
        Ok(Tick::Written)
    }

    /// Tick until the connection closes; timeouts are retried
    pub async fn run(&self, session: Session) -> Result<()> {
        let worker_id = session.identity.id;

        loop {
            match self.tick(session.client.as_ref(), worker_id, Utc::now()).await {
                Ok(Tick::Written) => debug!(worker_id, "Liveness record refreshed"),
                Ok(Tick::Skipped) => {}
                Err(BrokerError::Timeout) => debug!(worker_id, "Heartbeat timed out"),
                Err(BrokerError::ConnectionClosed) => {
                    return Err(BrokerError::ConnectionClosed.into());
                }
                Err(e) => warn!(worker_id, "Heartbeat failed: {}", e),
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use harvester_core::WorkerIdentity;

    fn staleness() -> Duration {
        Duration::from_millis(1000)
    }

    #[test]
    fn test_needs_write_rules() {
        let now = Utc::now();
        assert!(needs_write(None, now, staleness()));
        assert!(needs_write(Some(b"not connected"), now, staleness()));
        assert!(needs_write(Some(b"garbage"), now, staleness()));

        let fresh = now.to_rfc3339();
        assert!(!needs_write(Some(fresh.as_bytes()), now, staleness()));

        let ahead = (now + chrono::Duration::seconds(5)).to_rfc3339();
        assert!(!needs_write(Some(ahead.as_bytes()), now, staleness()));
    }

    #[tokio::test]
    async fn test_tick_is_throttled() {
        let broker = MemoryBroker::new();
        let client = broker.connection();
        let monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
        let start = Utc::now();

        assert_eq!(monitor.tick(client.as_ref(), 3, start).await.unwrap(), Tick::Written);

        let early = start + chrono::Duration::milliseconds(500);
        assert_eq!(monitor.tick(client.as_ref(), 3, early).await.unwrap(), Tick::Skipped);

        let late = start + chrono::Duration::milliseconds(1500);
        assert_eq!(monitor.tick(client.as_ref(), 3, late).await.unwrap(), Tick::Written);
        assert_eq!(broker.kv_writes(), 2);

        broker.set_kv("connected_users", "3", NOT_CONNECTED.as_bytes().to_vec());
        assert_eq!(monitor.tick(client.as_ref(), 3, late).await.unwrap(), Tick::Written);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_timeouts_and_stops_on_close() {
        let broker = MemoryBroker::new();
        let session = Session {
            client: broker.connection(),
            identity: WorkerIdentity::new(3, "node"),
        };
        broker.time_out_kv(2);

        let monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
        let running = tokio::spawn(async move { monitor.run(session).await });

        while broker.kv_value("connected_users", "3").is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        broker.close();
        let result = running.await.unwrap();
        assert!(result.unwrap_err().is_disconnect());
    }
}
