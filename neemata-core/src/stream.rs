//! Binary stream tracking and credit-based flow control (§4.7).
//!
//! Streams ride the same `tokio_util::codec::LengthDelimitedCodec` framing
//! the worker message protocol uses (see `protocol.rs`); this module only
//! tracks stream identity, state, and flow-control credit — chunk framing
//! itself is a transport concern.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Opened by the client, read by the server.
    Up,
    /// Opened by the server, read by the client.
    Down,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Open,
    Closed,
    Errored,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StreamMeta {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug)]
pub struct StreamAbortedError(pub u32);

impl fmt::Display for StreamAbortedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} aborted", self.0)
    }
}

impl std::error::Error for StreamAbortedError {}

/// A single bidirectional-or-unidirectional binary stream within one
/// connection. `id` is unique per (connection, direction) for the life of
/// the connection — ids are never reused (§3 invariant).
pub struct Stream {
    pub id: u32,
    pub direction: Direction,
    pub meta: StreamMeta,
    state_tx: watch::Sender<StreamState>,
    /// Remaining credit, in bytes, the sender may write before waiting for
    /// an acknowledgement. Replenished per acknowledged chunk.
    credit: AtomicU32,
}

impl Stream {
    fn new(id: u32, direction: Direction, meta: StreamMeta, window: u32) -> Arc<Self> {
        let (tx, _rx) = watch::channel(StreamState::Pending);
        Arc::new(Stream { id, direction, meta, state_tx: tx, credit: AtomicU32::new(window) })
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: StreamState) {
        let _ = self.state_tx.send_if_modified(|cur| {
            if *cur == state {
                false
            } else {
                *cur = state;
                true
            }
        });
    }

    pub fn mark_open(&self) {
        self.set_state(StreamState::Open);
    }

    pub fn mark_closed(&self) {
        self.set_state(StreamState::Closed);
    }

    pub fn mark_errored(&self) {
        self.set_state(StreamState::Errored);
    }

    pub fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    /// Consume `bytes` of credit before a write; fails if insufficient
    /// credit is available (the writer must wait for an ack first).
    pub fn consume_credit(&self, bytes: u32) -> Result<(), u32> {
        let current = self.credit.load(Ordering::SeqCst);
        if bytes > current {
            return Err(current);
        }
        self.credit.fetch_sub(bytes, Ordering::SeqCst);
        Ok(())
    }

    /// Replenish credit on receipt of a chunk acknowledgement.
    pub fn acknowledge(&self, bytes: u32) {
        self.credit.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Wait until this stream leaves `Pending`/`Open`. Used by consumers
    /// that need to observe an abort promptly rather than polling.
    pub async fn wait_terminal(&self) -> StreamState {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow();
            if matches!(state, StreamState::Closed | StreamState::Errored) {
                return state;
            }
            if rx.changed().await.is_err() {
                return StreamState::Errored;
            }
        }
    }
}

/// Per-connection stream tracking: separate id spaces and maps for
/// upstreams and downstreams, each with its own monotonic allocator.
pub struct StreamRegistry {
    up: DashMap<u32, Arc<Stream>>,
    down: DashMap<u32, Arc<Stream>>,
    next_up_id: AtomicU32,
    next_down_id: AtomicU32,
    window_bytes: u32,
}

impl StreamRegistry {
    pub fn new(window_bytes: u32) -> Self {
        StreamRegistry {
            up: DashMap::new(),
            down: DashMap::new(),
            next_up_id: AtomicU32::new(1),
            next_down_id: AtomicU32::new(1),
            window_bytes,
        }
    }

    /// Register an upstream opened by the client. The client allocates
    /// the id (per §4.7); the registry only rejects a reused id.
    pub fn open_upstream(&self, id: u32, meta: StreamMeta) -> Result<Arc<Stream>, u32> {
        if self.up.contains_key(&id) {
            return Err(id);
        }
        let stream = Stream::new(id, Direction::Up, meta, self.window_bytes);
        self.up.insert(id, stream.clone());
        Ok(stream)
    }

    /// Allocate and register a server-opened downstream.
    pub fn open_downstream(&self, meta: StreamMeta) -> Arc<Stream> {
        let id = self.next_down_id.fetch_add(1, Ordering::SeqCst);
        let stream = Stream::new(id, Direction::Down, meta, self.window_bytes);
        self.down.insert(id, stream.clone());
        stream
    }

    pub fn get(&self, direction: Direction, id: u32) -> Option<Arc<Stream>> {
        match direction {
            Direction::Up => self.up.get(&id).map(|e| e.clone()),
            Direction::Down => self.down.get(&id).map(|e| e.clone()),
        }
    }

    /// Transition every open stream to `Errored` — called on connection
    /// close (§4.7 invariant: "a stream not in closed at connection death
    /// is aborted").
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.up.iter() {
            if !matches!(entry.state(), StreamState::Closed | StreamState::Errored) {
                entry.mark_errored();
                count += 1;
            }
        }
        for entry in self.down.iter() {
            if !matches!(entry.state(), StreamState::Closed | StreamState::Errored) {
                entry.mark_errored();
                count += 1;
            }
        }
        count
    }

    pub fn upstream_count(&self) -> usize {
        self.up.len()
    }

    pub fn downstream_count(&self) -> usize {
        self.down.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_ids_cannot_be_reused() {
        let registry = StreamRegistry::new(1024);
        registry.open_upstream(1, StreamMeta::default()).unwrap();
        assert!(registry.open_upstream(1, StreamMeta::default()).is_err());
    }

    #[test]
    fn downstream_ids_are_monotonic() {
        let registry = StreamRegistry::new(1024);
        let a = registry.open_downstream(StreamMeta::default());
        let b = registry.open_downstream(StreamMeta::default());
        assert!(b.id > a.id);
    }

    #[test]
    fn credit_consumption_and_acknowledgement() {
        let stream = Stream::new(1, Direction::Up, StreamMeta::default(), 100);
        assert!(stream.consume_credit(60).is_ok());
        assert_eq!(stream.credit(), 40);
        assert!(stream.consume_credit(60).is_err());
        stream.acknowledge(60);
        assert_eq!(stream.credit(), 100);
    }

    #[test]
    fn abort_all_transitions_open_streams_to_errored() {
        let registry = StreamRegistry::new(1024);
        let s1 = registry.open_upstream(1, StreamMeta::default()).unwrap();
        s1.mark_open();
        let s2 = registry.open_downstream(StreamMeta::default());
        s2.mark_closed();
        let aborted = registry.abort_all();
        assert_eq!(aborted, 1);
        assert_eq!(s1.state(), StreamState::Errored);
        assert_eq!(s2.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn wait_terminal_observes_abort() {
        let stream = Stream::new(1, Direction::Up, StreamMeta::default(), 1024);
        stream.mark_open();
        let waiter = tokio::spawn({
            let stream = stream.clone();
            async move { stream.wait_terminal().await }
        });
        tokio::task::yield_now().await;
        stream.mark_errored();
        let result = waiter.await.unwrap();
        assert_eq!(result, StreamState::Errored);
    }
}
