use harvester_persistence::PersistenceError;
use harvester_protocol::ProtocolError;
use thiserror::Error;

/// Failures reported by a broker client
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker operation timed out")]
    Timeout,

    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker connection closed")]
    ConnectionClosed,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already exists")]
    KeyExists,

    #[error("Broker rejected request: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl BrokerError {
    /// Transport failures that a reconnect attempt may resolve
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Timeout | BrokerError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    /// The session is no longer usable and the worker must authenticate again
    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Broker error: {0}")]
    Broker(BrokerError),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0} loop panicked")]
    Panicked(String),
}

impl WorkerError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WorkerError::Disconnected(_))
    }
}

impl From<BrokerError> for WorkerError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ConnectionClosed => {
                WorkerError::Disconnected("broker connection closed".to_string())
            }
            other => WorkerError::Broker(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
