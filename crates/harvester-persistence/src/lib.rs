mod store;

pub use store::{JobStore, JobStoreConfig, NewJob, StoreStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Job error: {0}")]
    JobError(#[from] harvester_core::JobError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt key index entry for {0}")]
    CorruptIndex(String),

    #[error("Column family {0} not found")]
    MissingColumnFamily(&'static str),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
