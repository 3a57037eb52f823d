pub mod admin;
pub mod broker;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod processor;
pub mod scanner;
pub mod sender;
pub mod supervisor;

pub use config::WorkerConfig;
pub use connection::ConnectionManager;
pub use context::WorkerContext;
pub use error::{BrokerError, Result, WorkerError};
pub use handlers::{Dispatcher, HandlerRegistry, MessageHandler, Session};
pub use processor::{CommandProcessor, ProcessExecutor, Processor};
pub use supervisor::{Supervisor, SupervisorState};
