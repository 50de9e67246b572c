//! The error taxonomy a dispatcher, task engine, or supervisor can raise.
//!
//! Every variant maps to one row of the kind table: some are surfaced to
//! clients over the wire (`is_surfaced()` is `true`), others are
//! programmer/startup errors that are only ever logged.

use std::fmt;

/// A single field-level validation failure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// The closed taxonomy from the error handling design.
pub enum RuntimeError {
    NotFound(String),
    ValidationError(Vec<FieldError>),
    InvalidPayload(String),
    Forbidden(String),
    Timeout,
    TaskTimeout,
    TaskWorkerLost { worker_id: u32 },
    StreamAborted(String),
    InvalidState(String),
    ScopeMismatch(String),
    DuplicateName(String),
    Internal {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RuntimeError {
    /// The wire `code` for this error (stable, used by clients to branch on kind).
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::NotFound(_) => "NotFound",
            RuntimeError::ValidationError(_) => "ValidationError",
            RuntimeError::InvalidPayload(_) => "InvalidPayload",
            RuntimeError::Forbidden(_) => "Forbidden",
            RuntimeError::Timeout => "Timeout",
            RuntimeError::TaskTimeout => "TaskTimeout",
            RuntimeError::TaskWorkerLost { .. } => "TaskWorkerLost",
            RuntimeError::StreamAborted(_) => "StreamAborted",
            RuntimeError::InvalidState(_) => "InvalidState",
            RuntimeError::ScopeMismatch(_) => "ScopeMismatch",
            RuntimeError::DuplicateName(_) => "DuplicateName",
            RuntimeError::Internal { .. } => "Internal",
        }
    }

    /// Whether this kind is ever written back to a client, per the
    /// "surfaced?" column of the error taxonomy. `InvalidState`,
    /// `ScopeMismatch`, and `DuplicateName` are startup/programmer errors
    /// that are logged but never make it to the wire.
    pub fn is_surfaced(&self) -> bool {
        !matches!(
            self,
            RuntimeError::InvalidState(_)
                | RuntimeError::ScopeMismatch(_)
                | RuntimeError::DuplicateName(_)
        )
    }

    /// Render as the wire error envelope `{code, message, data}`. Internal
    /// errors have their message sanitized — detail goes to the log, not
    /// the client.
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            RuntimeError::Internal { .. } => format!("{}: internal error", self.code()),
            other => format!("{}: {}", other.code(), other),
        };
        WireError {
            code: self.code().to_string(),
            message,
            data: self.wire_data(),
        }
    }

    fn wire_data(&self) -> Option<serde_json::Value> {
        match self {
            RuntimeError::ValidationError(fields) => Some(serde_json::json!(fields)),
            RuntimeError::TaskWorkerLost { worker_id } => Some(serde_json::json!({ "workerId": worker_id })),
            _ => None,
        }
    }

    /// Build an `Internal` error from an opaque handler error, matching the
    /// propagation policy: unrecognized errors become `Internal` and are
    /// logged with their source chain.
    pub fn internal<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = err.to_string();
        RuntimeError::Internal {
            message,
            source: Some(Box::new(err)),
        }
    }

    /// Reconstruct an approximate `RuntimeError` from a [`WireError`]
    /// that crossed a process boundary (the task-offload reply path) —
    /// used by a worker's `ExecuteResult` handling to hand `TaskEngine`
    /// something richer than a bare string. Unknown codes, or ones
    /// `RuntimeError` itself never surfaces, collapse to `Internal`.
    pub fn from_wire(wire: WireError) -> Self {
        match wire.code.as_str() {
            "NotFound" => RuntimeError::NotFound(wire.message),
            "InvalidPayload" => RuntimeError::InvalidPayload(wire.message),
            "Forbidden" => RuntimeError::Forbidden(wire.message),
            "Timeout" => RuntimeError::Timeout,
            "TaskTimeout" => RuntimeError::TaskTimeout,
            "TaskWorkerLost" => {
                let worker_id = wire.data.as_ref().and_then(|d| d.get("workerId")).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                RuntimeError::TaskWorkerLost { worker_id }
            }
            "StreamAborted" => RuntimeError::StreamAborted(wire.message),
            _ => RuntimeError::Internal { message: wire.message, source: None },
        }
    }
}

/// The shape handed to a client: `code` identifies the kind, `message` is
/// human text, `data` is format-defined extra detail.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotFound(name) => write!(f, "not found: {name}"),
            RuntimeError::ValidationError(fields) => {
                write!(f, "validation failed ({} field(s))", fields.len())
            }
            RuntimeError::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            RuntimeError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            RuntimeError::Timeout => write!(f, "procedure timed out"),
            RuntimeError::TaskTimeout => write!(f, "offloaded task timed out"),
            RuntimeError::TaskWorkerLost { worker_id } => {
                write!(f, "task worker {worker_id} was lost mid-call")
            }
            RuntimeError::StreamAborted(msg) => write!(f, "stream aborted: {msg}"),
            RuntimeError::InvalidState(msg) => write!(f, "invalid lifecycle state: {msg}"),
            RuntimeError::ScopeMismatch(msg) => write!(f, "scope mismatch: {msg}"),
            RuntimeError::DuplicateName(msg) => write!(f, "duplicate registration: {msg}"),
            RuntimeError::Internal { message, .. } => write!(f, "internal error: {message}"),
        }
    }
}

impl fmt::Debug for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuntimeError({})", self)?;
        if let RuntimeError::Internal { source: Some(src), .. } = self {
            write!(f, " <- {src}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Internal { source, .. } => {
                source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// Generate `From<E> for RuntimeError` mapping a user error type to a
/// specific, named variant — the `Internal`/opaque-error equivalent of
/// `r2e_core::map_error!`, for handler authors who want typed `?`
/// conversion instead of calling `RuntimeError::internal` by hand.
#[macro_export]
macro_rules! map_error {
    ( $( $err_ty:ty => $variant:ident ),* $(,)? ) => {
        $(
            impl From<$err_ty> for $crate::error::RuntimeError {
                fn from(err: $err_ty) -> Self {
                    $crate::error::RuntimeError::$variant(err.to_string())
                }
            }
        )*
    };
}
