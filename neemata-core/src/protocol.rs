//! Worker message protocol (§6): the length-prefixed, JSON-encoded
//! envelope exchanged between the supervisor and a worker process.
//!
//! JSON over `tokio_util::codec::LengthDelimitedCodec` rather than a
//! binary codec, per the SPEC_FULL §3 note: keeps the reference
//! implementation inspectable and reuses the same `serde_json` the rest
//! of the core already depends on.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// `(id, type)` pair identifying a worker slot, echoed on every message so
/// the supervisor doesn't need a side-table to know who's talking.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerType {
    Api,
    Task,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Api => write!(f, "api"),
            WorkerType::Task => write!(f, "task"),
        }
    }
}

/// The worker data a spawned process receives at startup, serialized as
/// the first frame on its stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerData {
    pub id: u32,
    pub worker_type: WorkerType,
    pub has_task_runners: bool,
}

/// The closed set of frame kinds from §6's protocol table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum WorkerMessage {
    /// worker → sup
    Ready,
    /// sup → worker
    Start,
    /// sup → worker
    Stop,
    /// api-worker → sup → task-worker
    ExecuteInvoke {
        correlation_id: String,
        task_name: String,
        args: serde_json::Value,
    },
    /// task-worker → sup → api-worker
    ExecuteResult {
        correlation_id: String,
        #[serde(flatten)]
        outcome: ExecuteOutcome,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum ExecuteOutcome {
    Ok { result: serde_json::Value },
    Err { error: WireError },
}
