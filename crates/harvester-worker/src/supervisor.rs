use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};
use crate::handlers::{Dispatcher, HandlerRegistry, PingHandler, Session, TaskHandler};
use crate::heartbeat::HeartbeatMonitor;
use crate::scanner::ScanLoop;
use crate::sender::{run_sender, BrokerResultSender, ResultSender};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Authenticating,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Scan,
    Dispatcher,
    Sender,
    Heartbeat,
}

impl LoopKind {
    fn as_str(&self) -> &'static str {
        match self {
            LoopKind::Scan => "scan",
            LoopKind::Dispatcher => "dispatcher",
            LoopKind::Sender => "sender",
            LoopKind::Heartbeat => "heartbeat",
        }
    }
}

struct LoopExit {
    kind: LoopKind,
    /// Session the loop was started for; the scan loop is not tied to one
    generation: u64,
    result: Result<()>,
}

/// Runs the worker loops and keeps a broker session alive underneath them.
///
/// The scan loop runs for the whole cycle. The dispatcher, result sender and
/// heartbeat loops are bound to one authenticated session: when any of them
/// exits, the remaining ones are aborted, the session is re-established and
/// all three are started again. Failures that escape a cycle are followed by
/// a fixed backoff before the next one.
pub struct Supervisor {
    context: Arc<WorkerContext>,
    registry: Arc<HandlerRegistry>,
    sender: Arc<dyn ResultSender>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(context: Arc<WorkerContext>) -> Self {
        let broker = &context.config.broker;

        let mut registry = HandlerRegistry::new();
        registry.register(TaskHandler::new(
            context.store.clone(),
            broker.task_subject_prefix.clone(),
        ));
        registry.register(PingHandler::new(broker.heartbeat_subject_prefix.clone()));

        let sender = Arc::new(BrokerResultSender::new(
            context.store.clone(),
            context.config.sender.clone(),
            broker.result_subject.clone(),
        ));

        let (state, _) = watch::channel(SupervisorState::Disconnected);

        Supervisor {
            context,
            registry: Arc::new(registry),
            sender,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Run cycles forever
    pub async fn run(&self) {
        let backoff = self.context.config.supervisor.backoff();
        info!(handlers = ?self.registry.names(), "Supervisor starting");

        loop {
            match self.cycle().await {
                Ok(()) => warn!("Worker cycle ended"),
                Err(e) => error!("Worker cycle failed: {}", e),
            }

            self.context.connection.reset();
            self.set_state(SupervisorState::Disconnected);
            info!("Restarting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
        }
    }

    async fn cycle(&self) -> Result<()> {
        let recovered = self.context.store.recover_in_work()?;
        if recovered > 0 {
            warn!(recovered, "Released jobs interrupted by the previous cycle");
        }

        let mut tasks = JoinSet::new();
        let mut generation = 0;

        let session = self.authenticate().await?;
        self.spawn_scan(&mut tasks, None);
        let mut broker_loops = self.spawn_broker_loops(&mut tasks, session, generation);
        self.set_state(SupervisorState::Running);

        while let Some(joined) = tasks.join_next().await {
            let exit = match joined {
                Ok(exit) => exit,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!("Worker loop task failed: {}", e);
                    continue;
                }
            };

            let name = exit.kind.as_str();
            match exit.kind {
                LoopKind::Scan => {
                    match exit.result {
                        Ok(()) => warn!("Scan loop stopped"),
                        Err(e) => error!("Scan loop failed: {}", e),
                    }
                    let backoff = self.context.config.supervisor.backoff();
                    self.spawn_scan(&mut tasks, Some(backoff));
                }
                _ if exit.generation != generation => {
                    debug!(worker_loop = name, "Ignoring exit of a replaced loop");
                }
                _ => {
                    match &exit.result {
                        Err(e) if e.is_disconnect() => {
                            warn!(worker_loop = name, "Broker session lost: {}", e)
                        }
                        Err(e) => error!(worker_loop = name, "Loop failed: {}", e),
                        Ok(()) => warn!(worker_loop = name, "Loop stopped"),
                    }

                    for handle in broker_loops.drain(..) {
                        handle.abort();
                    }
                    self.context.connection.reset();
                    generation += 1;

                    let session = self.authenticate().await?;
                    broker_loops = self.spawn_broker_loops(&mut tasks, session, generation);
                    self.set_state(SupervisorState::Running);
                }
            }
        }

        Ok(())
    }

    async fn authenticate(&self) -> Result<Session> {
        self.set_state(SupervisorState::Authenticating);

        let identity = self.context.connection.authenticate().await?;
        let client = self.context.connection.current().ok_or_else(|| {
            WorkerError::Disconnected("connection lost right after authentication".to_string())
        })?;

        Ok(Session { client, identity })
    }

    fn spawn_scan(&self, tasks: &mut JoinSet<LoopExit>, delay: Option<Duration>) {
        let scan = ScanLoop::new(
            self.context.store.clone(),
            self.context.processor.clone(),
            self.context.config.scan.clone(),
        );

        spawn_loop(tasks, LoopKind::Scan, 0, async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            scan.run().await
        });
    }

    fn spawn_broker_loops(
        &self,
        tasks: &mut JoinSet<LoopExit>,
        session: Session,
        generation: u64,
    ) -> Vec<AbortHandle> {
        info!(worker = %session.identity, generation, "Starting session loops");

        let dispatcher = Dispatcher::new(self.registry.clone());
        let dispatch_session = session.clone();

        let sender = self.sender.clone();
        let sender_session = session.clone();
        let interval = self.context.config.sender.interval();

        let heartbeat = HeartbeatMonitor::new(self.context.config.heartbeat.clone());

        vec![
            spawn_loop(tasks, LoopKind::Dispatcher, generation, async move {
                dispatcher.run(dispatch_session).await
            }),
            spawn_loop(
                tasks,
                LoopKind::Sender,
                generation,
                run_sender(sender, sender_session, interval),
            ),
            spawn_loop(tasks, LoopKind::Heartbeat, generation, async move {
                heartbeat.run(session).await
            }),
        ]
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(?state, "Supervisor state changed");
        }
    }
}

/// Spawn a loop so that a panic is reported as its exit instead of a join error
fn spawn_loop<F>(
    tasks: &mut JoinSet<LoopExit>,
    kind: LoopKind,
    generation: u64,
    future: F,
) -> AbortHandle
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move {
        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(WorkerError::Panicked(kind.as_str().to_string())));

        LoopExit {
            kind,
            generation,
            result,
        }
    })
}
