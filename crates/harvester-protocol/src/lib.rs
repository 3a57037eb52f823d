//! Message bodies exchanged with the server over NATS and with the local
//! admin CLI.

mod admin;
pub mod envelope;
mod payload;

pub use admin::{AdminCommand, AdminResponse, StatusReport};
pub use payload::{InitAnswer, InitRequest, Ping, ResultEvent, TaskItem, TaskMessage, Validate};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Largest decoded body accepted: 11MB (a 10MB result payload plus overhead)
pub const MAX_MESSAGE_SIZE: usize = 11 * 1024 * 1024;
