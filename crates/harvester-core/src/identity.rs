use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity assigned by the broker during the init handshake.
///
/// Valid only for the connection it was negotiated on; a reconnect
/// discards it and negotiates a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub id: u64,
    pub name: String,
}

impl WorkerIdentity {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        WorkerIdentity {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}
