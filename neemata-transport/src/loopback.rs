//! The reference `Transport` implementation: an in-process loopback over
//! `tokio::sync::mpsc`, for tests and the demo binary. No networking, no
//! framing beyond `Frame` itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use neemata_core::connection::ConnectionId;
use neemata_core::wire::{ConnectionSink, Frame, SendError, Transport, TransportHost};
use tokio::sync::mpsc;

struct LoopbackSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ConnectionSink for LoopbackSink {
    fn try_send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.send(frame).map_err(|_| SendError("loopback peer gone".into()))
    }
}

/// The server-side half: implements `Transport` by doing nothing on
/// `start`/`stop` beyond bookkeeping — connections are created explicitly
/// via [`LoopbackTransport::connect`] rather than by accepting on a
/// socket.
pub struct LoopbackTransport {
    name: String,
    host: Arc<dyn TransportHost>,
    running: AtomicBool,
}

impl LoopbackTransport {
    pub fn new(name: impl Into<String>, host: Arc<dyn TransportHost>) -> Self {
        LoopbackTransport { name: name.into(), host, running: AtomicBool::new(false) }
    }

    /// Simulate a client connecting: allocates a connection id, hands the
    /// host a sink it can push frames through, and returns a
    /// [`LoopbackClient`] the test/demo drives from the other end.
    pub async fn connect(&self) -> LoopbackClient {
        let id = ConnectionId::new();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.host.on_connection(id, Arc::new(LoopbackSink { tx: to_client })).await;
        LoopbackClient { id, host: self.host.clone(), inbound: from_server }
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self) -> Result<(), neemata_core::error::RuntimeError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(transport = %self.name, "loopback transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), neemata_core::error::RuntimeError> {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(transport = %self.name, "loopback transport stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The client-side half of a loopback connection: sends frames straight
/// into the host's `on_frame`, and receives frames the host pushes back
/// through the sink it was handed.
pub struct LoopbackClient {
    pub id: ConnectionId,
    host: Arc<dyn TransportHost>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackClient {
    pub async fn send(&self, frame: Frame) {
        self.host.on_frame(self.id, frame).await;
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub async fn disconnect(&self) {
        self.host.on_disconnection(self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neemata_core::wire::FrameKind;
    use std::sync::Mutex;

    struct RecordingHost {
        frames: Mutex<Vec<(ConnectionId, Frame)>>,
        disconnected: Mutex<Vec<ConnectionId>>,
    }

    #[async_trait::async_trait]
    impl TransportHost for RecordingHost {
        async fn on_connection(&self, _id: ConnectionId, _sink: Arc<dyn ConnectionSink>) {}
        async fn on_frame(&self, id: ConnectionId, frame: Frame) {
            self.frames.lock().unwrap().push((id, frame));
        }
        async fn on_disconnection(&self, id: ConnectionId) {
            self.disconnected.lock().unwrap().push(id);
        }
    }

    #[tokio::test]
    async fn client_frames_reach_the_host() {
        let host = Arc::new(RecordingHost { frames: Mutex::new(Vec::new()), disconnected: Mutex::new(Vec::new()) });
        let transport = LoopbackTransport::new("loopback", host.clone());
        let client = transport.connect().await;
        client.send(Frame::new(FrameKind::Rpc, b"hello".to_vec())).await;
        assert_eq!(host.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_notifies_host() {
        let host = Arc::new(RecordingHost { frames: Mutex::new(Vec::new()), disconnected: Mutex::new(Vec::new()) });
        let transport = LoopbackTransport::new("loopback", host.clone());
        let client = transport.connect().await;
        client.disconnect().await;
        assert_eq!(host.disconnected.lock().unwrap(), vec![client.id]);
    }

    #[tokio::test]
    async fn sink_pushes_frames_back_to_client() {
        struct EchoHost;
        #[async_trait::async_trait]
        impl TransportHost for EchoHost {
            async fn on_connection(&self, _id: ConnectionId, sink: Arc<dyn ConnectionSink>) {
                let _ = sink.try_send(Frame::new(FrameKind::SubscriptionEvent, b"push".to_vec()));
            }
            async fn on_frame(&self, _id: ConnectionId, _frame: Frame) {}
            async fn on_disconnection(&self, _id: ConnectionId) {}
        }
        let transport = LoopbackTransport::new("loopback", Arc::new(EchoHost));
        let mut client = transport.connect().await;
        let frame = client.recv().await.unwrap();
        assert_eq!(&frame.payload[..], b"push");
    }
}
