//! The glue that turns a [`crate::wire::Transport`]'s raw frame callbacks
//! into calls against the [`ApiDispatcher`], [`SubscriptionManager`], and
//! [`StreamRegistry`] — the piece the component design leaves implicit by
//! specifying each of those in isolation and the transport interface
//! separately (§4.4, §4.6, §4.7, §6). [`ApiHost`] is the
//! [`crate::wire::TransportHost`] every reference transport is built
//! against.
//!
//! The per-frame envelope this module defines (`RpcRequest`/`RpcResponse`,
//! carrying a client-chosen `request_id` alongside the procedure name) is
//! this reference wiring's own multiplexing scheme, not part of the
//! closed wire-format contract in §6 — a concrete transport is free to
//! frame requests differently as long as it still drives `ApiDispatcher`
//! the same way.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::{Connection, ConnectionId};
use crate::container::Container;
use crate::dispatch::ApiDispatcher;
use crate::hooks::{CallOptions, HookEngine, HookKind};
use crate::stream::{StreamMeta, StreamRegistry};
use crate::subscription::SubscriptionManager;
use crate::wire::{ConnectionSink, Frame, FrameKind, TransportHost};

/// One multiplexed RPC call over a connection: `request_id` lets the
/// client match the eventual [`RpcResponse`] back to its caller.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct RpcRequest {
    pub request_id: String,
    pub procedure: String,
    pub payload: serde_json::Value,
    pub timeout_ms: Option<u64>,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct RpcResponse {
    pub request_id: String,
    pub payload: serde_json::Value,
}

/// Client-originated stream control frames. `StreamOpen`'s payload is
/// this; `StreamData`'s carries `{id, chunk}`; `StreamEnd`/`StreamAbort`
/// carry just `{id}`.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct StreamOpenRequest {
    pub id: u32,
    #[serde(default)]
    pub meta: StreamMeta,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct StreamDataFrame {
    pub id: u32,
    pub chunk: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct StreamIdFrame {
    pub id: u32,
}

/// Per-connection bookkeeping `ApiHost` keeps alongside the `Connection`
/// itself: its private `StreamRegistry` (§4.7 is explicit that stream ids
/// are scoped per connection, not global).
struct ConnectionState {
    connection: Arc<Connection>,
    streams: StreamRegistry,
}

/// Implements [`TransportHost`] by routing `Rpc` frames through an
/// [`ApiDispatcher`], subscription housekeeping through a
/// [`SubscriptionManager`], and stream control frames through each
/// connection's own [`StreamRegistry`]. One `ApiHost` is shared by every
/// transport an `Application` runs (§4.8: "Api workers only" start
/// transports, but all of them share one dispatch pipeline).
pub struct ApiHost {
    dispatcher: Arc<ApiDispatcher>,
    subscriptions: Arc<SubscriptionManager>,
    hooks: Arc<HookEngine>,
    global: Arc<Container>,
    stream_window_bytes: u32,
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl ApiHost {
    pub fn new(
        dispatcher: Arc<ApiDispatcher>,
        subscriptions: Arc<SubscriptionManager>,
        hooks: Arc<HookEngine>,
        global: Arc<Container>,
        stream_window_bytes: u32,
    ) -> Arc<Self> {
        Arc::new(ApiHost {
            dispatcher,
            subscriptions,
            hooks,
            global,
            stream_window_bytes,
            connections: DashMap::new(),
        })
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    async fn handle_rpc(&self, connection: &Arc<Connection>, frame: Frame) {
        let request: RpcRequest = match serde_json::from_slice(&frame.payload) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(connection = %connection.id(), error = %e, "malformed RPC envelope");
                return;
            }
        };

        let raw_payload = request.payload.to_string().into_bytes();
        let timeout_override = request.timeout_ms.map(std::time::Duration::from_millis);
        let encoded = self
            .dispatcher
            .dispatch(connection, &request.procedure, &raw_payload, timeout_override)
            .await;

        let payload: serde_json::Value = serde_json::from_slice(&encoded).unwrap_or(serde_json::Value::Null);
        let response = RpcResponse { request_id: request.request_id, payload };
        let Ok(bytes) = serde_json::to_vec(&response) else { return };
        let _ = connection.sink().try_send(Frame::new(FrameKind::Rpc, bytes));
    }

    fn handle_stream_open(&self, connection: &Arc<Connection>, frame: Frame) {
        let Ok(req) = serde_json::from_slice::<StreamOpenRequest>(&frame.payload) else { return };
        let Some(entry) = self.connections.get(&connection.id()) else { return };
        let ack = match entry.streams.open_upstream(req.id, req.meta) {
            Ok(stream) => {
                stream.mark_open();
                serde_json::json!({"id": req.id, "ok": true})
            }
            Err(id) => serde_json::json!({"id": id, "ok": false, "error": "duplicate stream id"}),
        };
        let _ = connection.sink().try_send(Frame::new(FrameKind::StreamOpen, ack.to_string().into_bytes()));
    }

    fn handle_stream_data(&self, connection: &Arc<Connection>, frame: Frame) {
        let Ok(chunk) = serde_json::from_slice::<StreamDataFrame>(&frame.payload) else { return };
        let Some(entry) = self.connections.get(&connection.id()) else { return };
        let Some(stream) = entry.streams.get(crate::stream::Direction::Up, chunk.id) else { return };
        if stream.consume_credit(chunk.chunk.len() as u32).is_err() {
            stream.mark_errored();
            let abort = serde_json::json!({"id": chunk.id});
            let _ = connection.sink().try_send(Frame::new(FrameKind::StreamAbort, abort.to_string().into_bytes()));
        }
    }

    fn handle_stream_end(&self, connection: &Arc<Connection>, frame: Frame) {
        let Ok(req) = serde_json::from_slice::<StreamIdFrame>(&frame.payload) else { return };
        if let Some(entry) = self.connections.get(&connection.id()) {
            if let Some(stream) = entry.streams.get(crate::stream::Direction::Up, req.id) {
                stream.mark_closed();
            }
        }
    }

    fn handle_stream_abort(&self, connection: &Arc<Connection>, frame: Frame) {
        let Ok(req) = serde_json::from_slice::<StreamIdFrame>(&frame.payload) else { return };
        if let Some(entry) = self.connections.get(&connection.id()) {
            if let Some(stream) = entry.streams.get(crate::stream::Direction::Up, req.id) {
                stream.mark_errored();
            }
        }
    }
}

#[async_trait::async_trait]
impl TransportHost for ApiHost {
    async fn on_connection(&self, id: ConnectionId, sink: Arc<dyn ConnectionSink>) {
        let connection = Arc::new(Connection::with_id(id, "application/json", sink, &self.global));
        self.connections.insert(id, ConnectionState { connection, streams: StreamRegistry::new(self.stream_window_bytes) });
        if let Err(e) = self.hooks.call(HookKind::OnConnection, CallOptions::sequential()).await {
            tracing::error!(connection = %id, error = %e, "OnConnection hook failed");
        }
    }

    async fn on_frame(&self, id: ConnectionId, frame: Frame) {
        let Some(connection) = self.connections.get(&id).map(|e| e.connection.clone()) else {
            tracing::warn!(connection = %id, "frame for unknown connection");
            return;
        };
        match frame.kind {
            FrameKind::Rpc => self.handle_rpc(&connection, frame).await,
            FrameKind::StreamOpen => self.handle_stream_open(&connection, frame),
            FrameKind::StreamData => self.handle_stream_data(&connection, frame),
            FrameKind::StreamEnd => self.handle_stream_end(&connection, frame),
            FrameKind::StreamAbort => self.handle_stream_abort(&connection, frame),
            FrameKind::SubscriptionEvent | FrameKind::Error => {
                tracing::debug!(connection = %id, kind = ?frame.kind, "ignoring server-originated frame kind from client");
            }
        }
    }

    async fn on_disconnection(&self, id: ConnectionId) {
        self.subscriptions.remove_connection(id);
        if let Some((_, state)) = self.connections.remove(&id) {
            state.streams.abort_all();
            state.connection.close().await;
        }
        if let Err(e) = self.hooks.call(HookKind::OnDisconnection, CallOptions::sequential()).await {
            tracing::error!(connection = %id, error = %e, "OnDisconnection hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatSelector;
    use crate::registry::{ModuleBuilder, ProcedureBuilder, Registry};
    use crate::wire::SendError;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
    }

    impl ConnectionSink for RecordingSink {
        fn try_send(&self, frame: Frame) -> Result<(), SendError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct TestJsonFormat;
    impl crate::format::Format for TestJsonFormat {
        fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, crate::format::FormatError> {
            Ok(value.to_string().into_bytes())
        }
        fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, crate::format::FormatError> {
            serde_json::from_slice(bytes).map_err(|e| crate::format::FormatError(e.to_string()))
        }
        fn supports(&self, content_type: &str) -> bool {
            content_type == "application/json"
        }
        fn content_type(&self) -> &str {
            "application/json"
        }
    }

    fn host_with_echo() -> Arc<ApiHost> {
        let registry = Registry::new();
        registry.register_module(
            ModuleBuilder::new("echo")
                .procedure(ProcedureBuilder::new("call", Arc::new(|_ctx, input| Box::pin(async move { Ok(input) }))).build())
                .build(),
        );
        registry.load().unwrap();
        let mut formats = FormatSelector::new();
        formats.register(Arc::new(TestJsonFormat));
        let dispatcher = Arc::new(ApiDispatcher::new(Arc::new(registry), formats, Duration::from_secs(1)));
        ApiHost::new(dispatcher, Arc::new(SubscriptionManager::new()), Arc::new(HookEngine::new()), Container::root(), 1024)
    }

    #[tokio::test]
    async fn rpc_round_trip_delivers_matching_request_id() {
        let host = host_with_echo();
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let id = ConnectionId::new();
        host.on_connection(id, sink.clone()).await;

        let request = RpcRequest { request_id: "r1".into(), procedure: "echo.call".into(), payload: serde_json::json!({"x": 1}), timeout_ms: None };
        let bytes = serde_json::to_vec(&request).unwrap();
        host.on_frame(id, Frame::new(FrameKind::Rpc, bytes)).await;

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let response: RpcResponse = serde_json::from_slice(&frames[0].payload).unwrap();
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.payload, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn disconnection_clears_subscriptions_and_aborts_open_streams() {
        let host = host_with_echo();
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let id = ConnectionId::new();
        host.on_connection(id, sink.clone()).await;
        host.subscriptions.subscribe(id, "orders", sink.clone(), None);
        assert_eq!(host.subscriptions.subscriber_count("orders"), 1);

        let open = StreamOpenRequest { id: 1, meta: StreamMeta::default() };
        host.on_frame(id, Frame::new(FrameKind::StreamOpen, serde_json::to_vec(&open).unwrap())).await;

        host.on_disconnection(id).await;
        assert_eq!(host.subscriptions.subscriber_count("orders"), 0);
        assert_eq!(host.connection_count(), 0);
    }
}
