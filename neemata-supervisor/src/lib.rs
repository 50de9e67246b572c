//! `neemata-supervisor`: the parent process that spawns API-worker and
//! task-worker process pools, handshakes their readiness, restarts
//! crashes, routes offloaded task invocations round-robin, and drives
//! graceful shutdown (§4.9).
//!
//! `neemata-core` never depends on this crate — `TaskOffload` is the
//! narrow interface [`client::WorkerClient`] implements so the
//! dependency arrow points supervisor → core, not the reverse.

pub mod client;
pub mod ipc;
pub mod pool;
pub mod supervisor;
pub mod worker;

pub use client::{
    parse_launch_args, read_worker_data, serve, stdin_reader, worker_client_from_stdout, WorkerClient, WorkerLaunch,
    WorkerRuntime, WORKER_FLAG,
};
pub use pool::Pool;
pub use supervisor::{Supervisor, SupervisorError, SupervisorOptions};
pub use worker::{WorkerEvent, WorkerHandle, WorkerState};
