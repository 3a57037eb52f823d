use crate::broker::Connector;
use crate::config::WorkerConfig;
use crate::connection::ConnectionManager;
use crate::processor::Processor;
use harvester_persistence::JobStore;
use std::sync::Arc;

/// Everything the long-running loops share, built once at startup
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub store: Arc<JobStore>,
    pub connection: Arc<ConnectionManager>,
    pub processor: Arc<dyn Processor>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        store: Arc<JobStore>,
        connector: Arc<dyn Connector>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            config.broker.clone(),
            config.worker.clone(),
            connector,
        ));

        WorkerContext {
            config,
            store,
            connection,
            processor,
        }
    }
}
