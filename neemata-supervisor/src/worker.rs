//! Supervisor-side worker process management: spawning a child,
//! running its stdin/stdout IPC as three small tasks (writer, reader,
//! waiter), and exposing a handle the [`crate::supervisor::Supervisor`]
//! drives.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::process::Command;
use tokio::sync::mpsc;

use neemata_core::protocol::{WorkerData, WorkerMessage, WorkerType};

use crate::ipc;

/// `(process-handle, worker-type, numeric id, state)` from §3's Worker
/// descriptor, state as an atomic so the supervisor's event loop and
/// readiness-await can both observe it without a lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
    Crashed,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Ready,
            2 => WorkerState::Stopping,
            _ => WorkerState::Crashed,
        }
    }
}

/// An event surfacing out of a worker's background tasks, tagged with
/// the worker's id by the caller's shared channel.
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// The worker process exited. `None` if it had to be force-killed
    /// without ever reporting a status (should not normally happen).
    Exited(Option<ExitStatus>),
}

/// The supervisor's handle onto one spawned worker process.
pub struct WorkerHandle {
    pub id: u32,
    pub worker_type: WorkerType,
    pub has_task_runners: bool,
    state: AtomicU8,
    to_worker: mpsc::UnboundedSender<WorkerMessage>,
    kill: mpsc::UnboundedSender<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Post a message to the worker's stdin. Fails silently (logged) if
    /// the worker's writer task has already shut down.
    pub fn post(&self, msg: WorkerMessage) {
        if self.to_worker.send(msg).is_err() {
            tracing::warn!(worker = self.id, worker_type = %self.worker_type, "post to dead worker writer");
        }
    }

    /// Force-terminate the underlying process, used when a worker
    /// doesn't exit within the shutdown timeout.
    pub fn force_kill(&self) {
        let _ = self.kill.send(());
    }
}

/// Spawn one worker process: `current_exe --neemata-worker <id> <type>`,
/// piping stdin/stdout for the IPC protocol and inheriting stderr so
/// worker logs reach the same terminal/log sink as the supervisor's.
///
/// Returns the [`WorkerHandle`] immediately; `Ready`/exit events arrive
/// later on `events_tx`, tagged `(id, event)`.
pub fn spawn(
    id: u32,
    worker_type: WorkerType,
    has_task_runners: bool,
    program: &std::path::Path,
    events_tx: mpsc::UnboundedSender<(u32, WorkerEvent)>,
) -> std::io::Result<WorkerHandle> {
    let mut child = Command::new(program)
        .args(["--neemata-worker", &id.to_string(), &worker_type.to_string()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");

    let (to_worker_tx, mut to_worker_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

    // Writer: forwards queued messages onto the child's stdin, starting
    // with the WorkerData frame every worker expects first.
    tokio::spawn(async move {
        let mut framed = ipc::writer(stdin);
        let data = WorkerData { id, worker_type, has_task_runners };
        if ipc::send_json(&mut framed, &data).await.is_err() {
            return;
        }
        while let Some(msg) = to_worker_rx.recv().await {
            if ipc::send(&mut framed, &msg).await.is_err() {
                break;
            }
        }
    });

    // Reader: decodes frames off the child's stdout and republishes them
    // tagged with this worker's id.
    let reader_events = events_tx.clone();
    tokio::spawn(async move {
        let mut framed = ipc::reader(stdout);
        while let Some(result) = ipc::recv(&mut framed).await {
            match result {
                Ok(msg) => {
                    if reader_events.send((id, WorkerEvent::Message(msg))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = id, error = %e, "worker IPC decode error");
                    break;
                }
            }
        }
    });

    // Waiter: owns the remaining `Child` (stdin/stdout already taken)
    // and reports its exit, or force-kills it on request.
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status.ok(),
            _ = kill_rx.recv() => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        let _ = events_tx.send((id, WorkerEvent::Exited(status)));
    });

    Ok(WorkerHandle {
        id,
        worker_type,
        has_task_runners,
        state: AtomicU8::new(WorkerState::Starting as u8),
        to_worker: to_worker_tx,
        kill: kill_tx,
    })
}
