use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use harvester_persistence::JobStoreConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker: IdentityConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub scan: ScanConfig,
    pub sender: SenderConfig,
    pub heartbeat: HeartbeatConfig,
    pub supervisor: SupervisorConfig,
    pub admin: AdminConfig,
    pub processor: ProcessorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Id from a previous registration; the server assigns one when absent
    pub id: Option<u64>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub auth_timeout_secs: u64,
    pub init_subject: String,
    /// JetStream stream holding the per-worker task subjects
    pub task_stream: String,
    pub task_subject_prefix: String,
    pub heartbeat_subject_prefix: String,
    pub result_subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    pub wait_interval_secs: u64,
    pub login_timeout_secs: u64,
    pub login_retry_secs: u64,
    pub process_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub batch_size: usize,
    pub interval_secs: u64,
    pub object_bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub bucket: String,
    pub staleness_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
    pub port_file: PathBuf,
}

/// External command backing the bundled processor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub login_program: Option<String>,
    pub login_args: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "worker".to_string());

        IdentityConfig { id: None, name }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            url: "nats://127.0.0.1:4222".to_string(),
            connect_timeout_ms: 2000,
            reconnect_delay_ms: 500,
            auth_timeout_secs: 10,
            init_subject: "server.init".to_string(),
            task_stream: "tasks".to_string(),
            task_subject_prefix: "task".to_string(),
            heartbeat_subject_prefix: "heartbeat".to_string(),
            result_subject: "result.server".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            batch_size: 10,
            wait_interval_secs: 5,
            login_timeout_secs: 60,
            login_retry_secs: 5,
            process_timeout_secs: 120,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            batch_size: 5,
            interval_secs: 10,
            object_bucket: "data_store".to_string(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            bucket: "connected_users".to_string(),
            staleness_ms: 1000,
            poll_interval_ms: 250,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig { backoff_secs: 10 }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            enabled: true,
            port: 5555,
            port_file: PathBuf::from("comm/port"),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.name.trim().is_empty() {
            anyhow::bail!("worker.name must not be empty");
        }
        if self.broker.url.trim().is_empty() {
            anyhow::bail!("broker.url must not be empty");
        }
        if self.broker.task_stream.trim().is_empty() {
            anyhow::bail!("broker.task_stream must not be empty");
        }
        if self.scan.batch_size == 0 || self.sender.batch_size == 0 {
            anyhow::bail!("batch sizes must be greater than zero");
        }

        let intervals = [
            ("broker.connect_timeout_ms", self.broker.connect_timeout_ms),
            ("broker.auth_timeout_secs", self.broker.auth_timeout_secs),
            ("scan.wait_interval_secs", self.scan.wait_interval_secs),
            ("scan.login_timeout_secs", self.scan.login_timeout_secs),
            ("scan.login_retry_secs", self.scan.login_retry_secs),
            ("scan.process_timeout_secs", self.scan.process_timeout_secs),
            ("sender.interval_secs", self.sender.interval_secs),
            ("heartbeat.staleness_ms", self.heartbeat.staleness_ms),
            ("heartbeat.poll_interval_ms", self.heartbeat.poll_interval_ms),
            ("supervisor.backoff_secs", self.supervisor.backoff_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("{} must be greater than zero", name);
        }

        Ok(())
    }

    pub fn to_job_store_config(&self) -> JobStoreConfig {
        JobStoreConfig {
            data_dir: self.store.data_dir.clone(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn task_subject(&self, worker_id: u64) -> String {
        format!("{}.{}", self.task_subject_prefix, worker_id)
    }

    pub fn heartbeat_subject(&self, worker_id: u64) -> String {
        format!("{}.{}", self.heartbeat_subject_prefix, worker_id)
    }
}

impl ScanConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn login_retry(&self) -> Duration {
        Duration::from_secs(self.login_retry_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

impl SenderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl HeartbeatConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SupervisorConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}
