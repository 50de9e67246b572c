//! The supervisor process (§4.9): spawns API and task worker pools,
//! handshakes readiness, routes offloaded task invocations round-robin,
//! restarts crashed workers, and drives graceful shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use neemata_core::error::RuntimeError;
use neemata_core::protocol::{ExecuteOutcome, WorkerMessage, WorkerType};

use crate::pool::Pool;
use crate::worker::{spawn, WorkerEvent, WorkerHandle, WorkerState};

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub api_workers: usize,
    pub task_workers: usize,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub offload_timeout: Duration,
    /// Defaults to `std::env::current_exe()` — the watch-mode re-exec
    /// shape §9 attributes to the CLI, reused here for worker bootstrap.
    pub program: Option<PathBuf>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        SupervisorOptions {
            api_workers: 1,
            task_workers: 1,
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            offload_timeout: Duration::from_secs(60),
            program: None,
        }
    }
}

#[derive(Debug)]
pub enum SupervisorError {
    Spawn(std::io::Error),
    WorkerFailedBeforeReady { id: u32, worker_type: WorkerType },
    StartupTimeout,
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn(e) => write!(f, "failed to spawn worker: {e}"),
            SupervisorError::WorkerFailedBeforeReady { id, worker_type } => {
                write!(f, "{worker_type} worker {id} exited before reporting ready")
            }
            SupervisorError::StartupTimeout => write!(f, "timed out waiting for workers to become ready"),
        }
    }
}

impl std::error::Error for SupervisorError {}

struct PendingCorrelation {
    api_worker_id: u32,
    task_worker_id: u32,
}

/// Routes an `ExecuteInvoke`/`ExecuteResult` pair, §4.9 point 3 and §4.5's
/// "In-flight bookkeeping".
pub struct Supervisor {
    options: SupervisorOptions,
    program: PathBuf,
    workers: DashMap<u32, WorkerHandle>,
    task_pool: Pool<u32>,
    pending: DashMap<String, PendingCorrelation>,
    events_tx: mpsc::UnboundedSender<(u32, WorkerEvent)>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<(u32, WorkerEvent)>>>,
    next_api_id: AtomicU32,
    next_task_id: AtomicU32,
    exiting: AtomicBool,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Result<Arc<Self>, SupervisorError> {
        let program = match &options.program {
            Some(p) => p.clone(),
            None => std::env::current_exe().map_err(SupervisorError::Spawn)?,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Supervisor {
            options,
            program,
            workers: DashMap::new(),
            task_pool: Pool::new(Vec::new()),
            pending: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            next_api_id: AtomicU32::new(0),
            next_task_id: AtomicU32::new(0),
            exiting: AtomicBool::new(false),
        }))
    }

    /// §4.9 steps 1-2: fork every configured worker, await each one's
    /// `Ready`. Any worker that exits before reporting ready is fatal:
    /// log, signal the already-started ones to stop, and return an
    /// error (the caller is expected to exit non-zero).
    pub async fn boot(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let api_count = self.options.api_workers;
        let task_count = self.options.task_workers;
        let has_task_runners = task_count > 0;

        let mut awaiting_ready: std::collections::HashSet<u32> = std::collections::HashSet::new();

        for _ in 0..api_count {
            let id = self.next_api_id.fetch_add(1, Ordering::SeqCst);
            self.spawn_one(id, WorkerType::Api, has_task_runners)?;
            awaiting_ready.insert(id);
        }
        for _ in 0..task_count {
            let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
            self.spawn_one(id, WorkerType::Task, false)?;
            awaiting_ready.insert(id);
        }

        let mut rx = self.events_rx.lock().await.take().expect("events_rx taken once");
        let deadline = tokio::time::sleep(self.options.startup_timeout);
        tokio::pin!(deadline);

        let result = loop {
            if awaiting_ready.is_empty() {
                break Ok(());
            }
            tokio::select! {
                _ = &mut deadline => break Err(SupervisorError::StartupTimeout),
                event = rx.recv() => {
                    let Some((id, event)) = event else { break Err(SupervisorError::StartupTimeout) };
                    match event {
                        WorkerEvent::Message(WorkerMessage::Ready) => {
                            if let Some(w) = self.workers.get(&id) {
                                w.set_state(WorkerState::Ready);
                                if w.worker_type == WorkerType::Task {
                                    self.task_pool.push(id);
                                }
                            }
                            awaiting_ready.remove(&id);
                        }
                        WorkerEvent::Exited(_) => {
                            let worker_type = self.workers.get(&id).map(|w| w.worker_type).unwrap_or(WorkerType::Api);
                            break Err(SupervisorError::WorkerFailedBeforeReady { id, worker_type });
                        }
                        WorkerEvent::Message(_) => {}
                    }
                }
            }
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "startup failed, stopping already-started workers");
            for entry in self.workers.iter() {
                entry.value().post(WorkerMessage::Stop);
            }
            *self.events_rx.lock().await = Some(rx);
            return Err(e);
        }

        for entry in self.workers.iter() {
            entry.value().post(WorkerMessage::Start);
        }
        tracing::info!(api = api_count, task = task_count, "all workers ready, posted Start");

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run(rx).await });

        Ok(())
    }

    fn spawn_one(self: &Arc<Self>, id: u32, worker_type: WorkerType, has_task_runners: bool) -> Result<(), SupervisorError> {
        let handle = spawn(id, worker_type, has_task_runners, &self.program, self.events_tx.clone())
            .map_err(SupervisorError::Spawn)?;
        tracing::info!(worker = id, worker_type = %worker_type, "worker spawned");
        self.workers.insert(id, handle);
        Ok(())
    }

    /// The supervisor's main loop, running for the process's lifetime
    /// once `boot` hands off to it: routes `ExecuteInvoke`/`ExecuteResult`
    /// and reacts to worker exits.
    async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<(u32, WorkerEvent)>) {
        while let Some((id, event)) = events.recv().await {
            match event {
                WorkerEvent::Message(WorkerMessage::Ready) => {
                    if let Some(w) = self.workers.get(&id) {
                        w.set_state(WorkerState::Ready);
                        if w.worker_type == WorkerType::Task {
                            self.task_pool.push(id);
                        }
                    }
                }
                WorkerEvent::Message(WorkerMessage::ExecuteInvoke { correlation_id, task_name, args }) => {
                    self.route_invoke(id, correlation_id, task_name, args);
                }
                WorkerEvent::Message(WorkerMessage::ExecuteResult { correlation_id, outcome }) => {
                    self.route_result(correlation_id, outcome);
                }
                WorkerEvent::Message(WorkerMessage::Start) | WorkerEvent::Message(WorkerMessage::Stop) => {
                    // sup -> worker only; a worker never sends these.
                }
                WorkerEvent::Exited(status) => {
                    self.on_exit(id, status).await;
                }
            }
        }
    }

    fn route_invoke(self: &Arc<Self>, api_worker_id: u32, correlation_id: String, task_name: String, args: serde_json::Value) {
        let Some(task_worker_id) = self.task_pool.next() else {
            tracing::error!(correlation = %correlation_id, "no task workers available to route to");
            if let Some(api) = self.workers.get(&api_worker_id) {
                api.post(WorkerMessage::ExecuteResult {
                    correlation_id,
                    outcome: ExecuteOutcome::Err { error: RuntimeError::TaskWorkerLost { worker_id: 0 }.to_wire() },
                });
            }
            return;
        };

        self.pending.insert(correlation_id.clone(), PendingCorrelation { api_worker_id, task_worker_id });

        if let Some(task) = self.workers.get(&task_worker_id) {
            task.post(WorkerMessage::ExecuteInvoke { correlation_id: correlation_id.clone(), task_name, args });
        }

        let supervisor = self.clone();
        let timeout = self.options.offload_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, pending)) = supervisor.pending.remove(&correlation_id) {
                tracing::warn!(correlation = %correlation_id, task_worker = pending.task_worker_id, "offload deadline expired");
                if let Some(api) = supervisor.workers.get(&pending.api_worker_id) {
                    api.post(WorkerMessage::ExecuteResult {
                        correlation_id,
                        outcome: ExecuteOutcome::Err { error: RuntimeError::TaskTimeout.to_wire() },
                    });
                }
                // Best-effort cancellation of the task worker: the
                // closed protocol set (§6) has no Cancel frame, so
                // there's nothing further to send — the task worker
                // finishes or not on its own and its eventual
                // ExecuteResult for this id is simply dropped since
                // `pending` no longer has an entry for it.
            }
        });
    }

    fn route_result(&self, correlation_id: String, outcome: ExecuteOutcome) {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return;
        };
        if let Some(api) = self.workers.get(&pending.api_worker_id) {
            api.post(WorkerMessage::ExecuteResult { correlation_id, outcome });
        }
    }

    async fn on_exit(self: &Arc<Self>, id: u32, status: Option<std::process::ExitStatus>) {
        let Some((_, handle)) = self.workers.remove(&id) else { return };
        let was_exiting = self.exiting.load(Ordering::SeqCst);
        let requested_stop = handle.state() == WorkerState::Stopping;
        self.task_pool.remove(&id);

        self.fail_pending_for(id);

        let clean = status.map(|s| s.success()).unwrap_or(false);
        if was_exiting || requested_stop {
            tracing::info!(worker = id, worker_type = %handle.worker_type, "worker exited during shutdown");
            return;
        }
        if clean {
            tracing::info!(worker = id, worker_type = %handle.worker_type, "worker exited cleanly");
            return;
        }

        tracing::error!(worker = id, worker_type = %handle.worker_type, "worker crashed, spawning replacement");
        if let Err(e) = self.spawn_one(id, handle.worker_type, handle.has_task_runners) {
            tracing::error!(worker = id, error = %e, "failed to respawn crashed worker");
            return;
        }
        if let Some(replacement) = self.workers.get(&id) {
            replacement.post(WorkerMessage::Start);
        }
    }

    fn fail_pending_for(&self, crashed_worker_id: u32) {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().task_worker_id == crashed_worker_id)
            .map(|e| e.key().clone())
            .collect();
        for correlation_id in stale {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                if let Some(api) = self.workers.get(&pending.api_worker_id) {
                    api.post(WorkerMessage::ExecuteResult {
                        correlation_id,
                        outcome: ExecuteOutcome::Err {
                            error: RuntimeError::TaskWorkerLost { worker_id: crashed_worker_id }.to_wire(),
                        },
                    });
                }
            }
        }
    }

    /// Graceful stop (§4.9): mark `#exiting`, post `Stop` to every
    /// worker, wait up to `shutdown_timeout` for them all to exit, then
    /// force-kill stragglers.
    pub async fn stop(self: &Arc<Self>) {
        self.exiting.store(true, Ordering::SeqCst);
        let ids: Vec<u32> = self.workers.iter().map(|e| *e.key()).collect();
        for id in &ids {
            if let Some(w) = self.workers.get(id) {
                w.set_state(WorkerState::Stopping);
                w.post(WorkerMessage::Stop);
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.workers.is_empty() {
                tracing::info!("all workers exited gracefully");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for entry in self.workers.iter() {
            tracing::warn!(worker = *entry.key(), "worker did not exit in time, force-killing");
            entry.value().force_kill();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
