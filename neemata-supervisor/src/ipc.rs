//! Length-delimited JSON framing shared by both ends of the worker
//! message protocol (§6): the supervisor writes to a child's stdin and
//! reads its stdout; the worker does the mirror image over its own
//! stdin/stdout. Both sides build their `Framed*` halves from the same
//! two functions so the wire shape can't drift between them.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use neemata_core::protocol::WorkerMessage;

pub fn writer<W: AsyncWrite>(io: W) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(io, LengthDelimitedCodec::new())
}

pub fn reader<R: AsyncRead>(io: R) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(io, LengthDelimitedCodec::new())
}

/// Encode any serializable value as JSON and send it as one
/// length-delimited frame. Used both for [`WorkerMessage`]s and for the
/// one-off `WorkerData` frame a worker receives before the message loop
/// starts.
pub async fn send_json<W: AsyncWrite + Unpin, T: Serialize>(
    framed: &mut FramedWrite<W, LengthDelimitedCodec>,
    value: &T,
) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    framed.send(Bytes::from(bytes)).await
}

/// Read the next frame and decode it as `T`. `None` means the peer
/// closed the pipe (process exited); `Some(Err(_))` is a transport or
/// decode failure.
pub async fn recv_json<R: AsyncRead + Unpin, T: DeserializeOwned>(
    framed: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Option<std::io::Result<T>> {
    match framed.next().await {
        Some(Ok(bytes)) => Some(serde_json::from_slice(&bytes).map_err(std::io::Error::other)),
        Some(Err(e)) => Some(Err(e)),
        None => None,
    }
}

pub async fn send<W: AsyncWrite + Unpin>(
    framed: &mut FramedWrite<W, LengthDelimitedCodec>,
    msg: &WorkerMessage,
) -> std::io::Result<()> {
    send_json(framed, msg).await
}

pub async fn recv<R: AsyncRead + Unpin>(
    framed: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Option<std::io::Result<WorkerMessage>> {
    recv_json(framed).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_message_through_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_rx, client_tx) = tokio::io::split(client);
        let (server_rx, server_tx) = tokio::io::split(server);

        let mut w = writer(client_tx);
        let mut r = reader(server_rx);
        let _ = &client_rx;
        let _ = &server_tx;

        let msg = WorkerMessage::Ready;
        send(&mut w, &msg).await.unwrap();
        let decoded = recv(&mut r).await.unwrap().unwrap();
        assert!(matches!(decoded, WorkerMessage::Ready));
    }
}
