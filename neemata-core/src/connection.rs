//! Connections and per-call context.
//!
//! A [`Connection`] is the opaque, transport-agnostic identity a client
//! keeps for the lifetime of its transport session (§3); a [`CallContext`]
//! is the shorter-lived record threaded through a single RPC (§4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::{Container, ScopeTag};
use crate::wire::ConnectionSink;

/// Opaque connection identifier (§3). `Uuid` rather than a counter so
/// multi-worker deployments never collide.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live client session: transport reference, content-type, and the
/// connection-scope container created on accept and disposed on close.
pub struct Connection {
    id: ConnectionId,
    content_type: String,
    sink: Arc<dyn ConnectionSink>,
    container: Arc<Container>,
    closed: AtomicBool,
}

impl Connection {
    /// Build a connection for a freshly-generated id — used by tests and
    /// by transports that don't care about choosing the id themselves.
    pub fn new(content_type: impl Into<String>, sink: Arc<dyn ConnectionSink>, global: &Arc<Container>) -> Self {
        Self::with_id(ConnectionId::new(), content_type, sink, global)
    }

    /// Build a connection for an id chosen by the transport on accept
    /// (§3: "created on transport accept"), so the id the transport
    /// handed to `TransportHost::on_connection` is the same one the
    /// resulting `Connection` carries.
    pub fn with_id(id: ConnectionId, content_type: impl Into<String>, sink: Arc<dyn ConnectionSink>, global: &Arc<Container>) -> Self {
        Connection {
            id,
            content_type: content_type.into(),
            sink,
            container: global.create_scope(ScopeTag::Connection),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn sink(&self) -> &Arc<dyn ConnectionSink> {
        &self.sink
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Dispose the connection-scope container. Idempotent via
    /// `Container::dispose`; the `closed` flag additionally lets callers
    /// (the subscription manager, stream registry) short-circuit without
    /// an await.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.container.dispose().await;
    }
}

/// Per-invocation record (§3). Disposed when the dispatcher finishes
/// handling the call, whichever way it exits.
pub struct CallContext {
    pub connection: ConnectionId,
    pub procedure: String,
    pub container: Arc<Container>,
    started: Instant,
    cancellation: CancellationToken,
}

impl CallContext {
    pub fn new(connection: ConnectionId, procedure: impl Into<String>, connection_container: &Arc<Container>) -> Self {
        CallContext {
            connection,
            procedure: procedure.into(),
            container: connection_container.create_scope(ScopeTag::Call),
            started: Instant::now(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Dispose the Call-scope container. Always invoked by the dispatcher
    /// on every exit path (success, error, timeout), per §4.4 step 10.
    pub async fn dispose(&self) {
        self.container.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl ConnectionSink for NullSink {
        fn try_send(&self, _frame: crate::wire::Frame) -> Result<(), crate::wire::SendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn connection_close_disposes_its_container() {
        let root = Container::root();
        let conn = Connection::new("application/json", Arc::new(NullSink), &root);
        assert!(!conn.container().is_disposed());
        conn.close().await;
        assert!(conn.container().is_disposed());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn call_context_scope_is_child_of_connection_scope() {
        let root = Container::root();
        let conn = Connection::new("application/json", Arc::new(NullSink), &root);
        let call = CallContext::new(conn.id(), "orders.create", conn.container());
        assert_eq!(call.container.scope(), ScopeTag::Call);
        call.dispose().await;
        assert!(call.container.is_disposed());
        // Disposing the call scope must not disturb the connection scope.
        assert!(!conn.container().is_disposed());
    }

    #[test]
    fn cancellation_starts_unset() {
        let root = Container::root();
        let conn = Connection::new("application/json", Arc::new(NullSink), &root);
        let call = CallContext::new(conn.id(), "p", conn.container());
        assert!(!call.is_cancelled());
        call.cancel();
        assert!(call.is_cancelled());
    }
}
