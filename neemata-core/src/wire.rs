//! The frame shape exchanged between a [`crate::transport::Transport`] and
//! the runtime, and the trait a transport implements to plug into it.
//!
//! Concrete transports (HTTP/WebSocket/TCP framings) are out of scope per
//! spec.md §1 — this module only specifies the interface they meet.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::ConnectionId;
use crate::error::RuntimeError;

/// The kind tag carried by every frame, per §6's transport interface table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FrameKind {
    Rpc,
    StreamOpen,
    StreamData,
    StreamEnd,
    StreamAbort,
    SubscriptionEvent,
    Error,
}

/// A single frame crossing the transport boundary in either direction.
/// `payload` is `Bytes` rather than `Vec<u8>` so fan-out (subscription
/// publish to many subscribers, stream data re-sent on retry) clones a
/// reference rather than the bytes themselves.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Frame { kind, payload: payload.into() }
    }
}

#[derive(Debug)]
pub struct SendError(pub String);

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SendError {}

/// The narrow per-connection handle the runtime uses to push frames back
/// out over the transport — subscription fan-out, stream data, and RPC
/// responses all go through this rather than the transport needing to
/// expose anything wider. Implemented by whatever the concrete transport
/// uses for its per-connection write half.
pub trait ConnectionSink: Send + Sync {
    /// Best-effort, non-blocking send. Per §4.6, a full send buffer drops
    /// the payload for this subscriber rather than blocking or erroring.
    fn try_send(&self, frame: Frame) -> Result<(), SendError>;
}

/// The transport plugin interface (§6). A transport owns accept/listen
/// machinery external to this crate; it calls back into the runtime via
/// these three entry points and the runtime calls `start`/`stop` on it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), RuntimeError>;
    async fn stop(&self) -> Result<(), RuntimeError>;
    fn name(&self) -> &str;
}

/// Callbacks a [`Transport`] invokes on the host application. Kept as a
/// trait object (rather than hardcoding `Application`) so a transport
/// depends only on this narrow surface — the `ExtensionHost` shape called
/// for in spec.md §9's design notes.
#[async_trait::async_trait]
pub trait TransportHost: Send + Sync {
    async fn on_connection(&self, id: ConnectionId, sink: Arc<dyn ConnectionSink>);
    async fn on_frame(&self, id: ConnectionId, frame: Frame);
    async fn on_disconnection(&self, id: ConnectionId);
}
