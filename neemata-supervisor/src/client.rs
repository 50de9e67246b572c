//! The worker-side half of the protocol: parses `--neemata-worker <id>
//! <type>` off `argv`, reads the `WorkerData` frame the supervisor sends
//! first, and drives the `Ready` → (await `Start`) → serve → (await
//! `Stop`) → exit sequence described in §4.9, including implementing
//! [`TaskOffload`] over the same stdin/stdout pipes so `TaskEngine` can
//! cross to the supervisor without knowing this is a subprocess.

use std::sync::Arc;

use tokio::io::{Stdin, Stdout};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use neemata_core::error::RuntimeError;
use neemata_core::protocol::{ExecuteOutcome, WorkerData, WorkerMessage, WorkerType};
use neemata_core::task_engine::{TaskEngine, TaskOffload};

use crate::ipc;

pub const WORKER_FLAG: &str = "--neemata-worker";

/// What this process was told to be, decoded from `argv`.
#[derive(Copy, Clone, Debug)]
pub struct WorkerLaunch {
    pub id: u32,
    pub worker_type: WorkerType,
}

/// Scan `std::env::args()` for `--neemata-worker <id> <type>`. Returns
/// `None` when the process was launched normally (not as a spawned
/// worker) — the caller's `main` should fall through to its usual
/// supervisor-boot path in that case.
pub fn parse_launch_args() -> Option<WorkerLaunch> {
    let args: Vec<String> = std::env::args().collect();
    let pos = args.iter().position(|a| a == WORKER_FLAG)?;
    let id: u32 = args.get(pos + 1)?.parse().ok()?;
    let worker_type = match args.get(pos + 2)?.as_str() {
        "api" => WorkerType::Api,
        "task" => WorkerType::Task,
        _ => return None,
    };
    Some(WorkerLaunch { id, worker_type })
}

/// Sends `ExecuteInvoke` to the supervisor over this process's own
/// stdout; `TaskEngine::complete` is fed the matching `ExecuteResult` by
/// [`serve`]'s message loop.
pub struct WorkerClient {
    writer: AsyncMutex<FramedWrite<Stdout, LengthDelimitedCodec>>,
}

impl WorkerClient {
    fn new(stdout: Stdout) -> Arc<Self> {
        Arc::new(WorkerClient { writer: AsyncMutex::new(ipc::writer(stdout)) })
    }

    async fn send(&self, msg: &WorkerMessage) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        ipc::send(&mut w, msg).await
    }
}

#[async_trait::async_trait]
impl TaskOffload for WorkerClient {
    async fn send_invoke(&self, correlation_id: String, task_name: String, args: serde_json::Value) -> Result<(), RuntimeError> {
        self.send(&WorkerMessage::ExecuteInvoke { correlation_id, task_name, args })
            .await
            .map_err(RuntimeError::internal)
    }
}

/// What [`serve`] needs from its caller: an already-initialized
/// `TaskEngine` (for `Task` workers and for `Api` workers that offload)
/// and the `Application` to drive through `start`/`stop`.
pub struct WorkerRuntime {
    pub application: Arc<neemata_core::lifecycle::Application>,
    pub task_engine: Arc<TaskEngine>,
}

/// Read the `WorkerData` frame the supervisor sends immediately after
/// spawning this process, before any other protocol traffic.
pub async fn read_worker_data(stdin: &mut FramedRead<Stdin, LengthDelimitedCodec>) -> std::io::Result<WorkerData> {
    match ipc::recv_json(stdin).await {
        Some(Ok(data)) => Ok(data),
        Some(Err(e)) => Err(e),
        None => Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "supervisor closed pipe before sending WorkerData")),
    }
}

/// Drive this worker process end to end: send `Ready`, wait for `Start`,
/// run `application.start()`, then loop handling `ExecuteInvoke` (if this
/// is a Task worker), `ExecuteResult` (if this is an Api worker that
/// offloaded), and `Stop` (triggers `application.stop()` and returns).
pub async fn serve(
    client: Arc<WorkerClient>,
    runtime: WorkerRuntime,
    is_task_worker: bool,
    mut reader: FramedRead<Stdin, LengthDelimitedCodec>,
) -> Result<(), RuntimeError> {
    client.send(&WorkerMessage::Ready).await.map_err(RuntimeError::internal)?;
    tracing::info!("sent Ready, awaiting Start");

    loop {
        match ipc::recv(&mut reader).await {
            Some(Ok(WorkerMessage::Start)) => break,
            Some(Ok(other)) => {
                tracing::warn!(?other, "unexpected message before Start");
            }
            Some(Err(e)) => return Err(RuntimeError::internal(e)),
            None => return Err(RuntimeError::internal(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "supervisor closed pipe before Start"))),
        }
    }

    runtime.application.start().await?;
    tracing::info!("application running, entering message loop");

    loop {
        match ipc::recv(&mut reader).await {
            Some(Ok(WorkerMessage::Stop)) => {
                tracing::info!("received Stop, shutting down");
                break;
            }
            Some(Ok(WorkerMessage::ExecuteInvoke { correlation_id, task_name, args })) if is_task_worker => {
                let client = client.clone();
                let task_engine = runtime.task_engine.clone();
                tokio::spawn(async move {
                    let result = task_engine.execute(&task_name, args).await;
                    let outcome = match result {
                        Ok(value) => ExecuteOutcome::Ok { result: value },
                        Err(e) => ExecuteOutcome::Err { error: e.to_wire() },
                    };
                    let _ = client.send(&WorkerMessage::ExecuteResult { correlation_id, outcome }).await;
                });
            }
            Some(Ok(WorkerMessage::ExecuteResult { correlation_id, outcome })) if !is_task_worker => {
                let result = match outcome {
                    ExecuteOutcome::Ok { result } => Ok(result),
                    ExecuteOutcome::Err { error } => Err(RuntimeError::from_wire(error)),
                };
                runtime.task_engine.complete(&correlation_id, result);
            }
            Some(Ok(other)) => {
                tracing::debug!(?other, "ignoring message not applicable to this worker role");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "IPC decode error, stopping");
                break;
            }
            None => {
                tracing::warn!("supervisor pipe closed unexpectedly");
                break;
            }
        }
    }

    runtime.application.stop().await?;
    Ok(())
}

pub fn worker_client_from_stdout() -> Arc<WorkerClient> {
    WorkerClient::new(tokio::io::stdout())
}

pub fn stdin_reader() -> FramedRead<Stdin, LengthDelimitedCodec> {
    ipc::reader(tokio::io::stdin())
}
