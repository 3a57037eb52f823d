use serde::{Deserialize, Serialize};

/// Schema checks applied after a body has been decoded
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Worker -> server handshake request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Previously assigned id, if the worker has one configured
    pub id: Option<u64>,
    pub name: String,
}

/// Server -> worker handshake answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAnswer {
    pub id: u64,
    pub name: String,
}

impl Validate for InitAnswer {
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("init answer carries an empty worker name".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Server-side correlation id
    pub external_id: u64,
    pub key: String,
}

/// Task ingestion body; the server may send one item or a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskMessage {
    Single(TaskItem),
    Batch(Vec<TaskItem>),
}

impl TaskMessage {
    /// Items carrying a usable key; blank keys are dropped one by one
    pub fn into_items(self) -> Vec<TaskItem> {
        let items = match self {
            TaskMessage::Single(item) => vec![item],
            TaskMessage::Batch(items) => items,
        };
        items
            .into_iter()
            .filter(|item| !item.key.trim().is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        match self {
            TaskMessage::Single(_) => 1,
            TaskMessage::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Validate for TaskMessage {
    /// Only a lone item is rejected for a blank key; batches are filtered
    /// item by item in `into_items`
    fn validate(&self) -> Result<(), String> {
        match self {
            TaskMessage::Single(item) if item.key.trim().is_empty() => {
                Err("task item with an empty key".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Heartbeat ping from the server, echoed back as the pong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub id: u64,
}

impl Validate for Ping {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// One shipped job, published to the result subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub worker_id: u64,
    pub external_id: Option<u64>,
    pub key: String,
    /// Whether the payload was stored in the object bucket under `key`
    pub has_payload: bool,
}
