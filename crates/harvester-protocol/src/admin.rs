use crate::Result;
use serde::{Deserialize, Serialize};

/// Commands accepted on the local administrative socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    Status,
    /// Queue raw keys for processing
    Upload { keys: Vec<String> },
    /// Export every stored payload into an archive at `filename`
    Download {
        filename: String,
        password: Option<String>,
    },
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Status => "status",
            AdminCommand::Upload { .. } => "upload",
            AdminCommand::Download { .. } => "download",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Job counts reported by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub total: u64,
    /// Jobs uploaded locally (no server correlation id)
    pub local: u64,
    /// Jobs received from the server
    pub remote: u64,
    pub created: u64,
    pub in_work: u64,
    pub completed: u64,
    pub second_check: u64,
    pub error: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminResponse {
    Status(StatusReport),
    Done { command: String, affected: u64 },
    Failed { command: String, message: String },
}

impl AdminResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
