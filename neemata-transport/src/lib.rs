//! Reference `Transport`/`Format` implementations for `neemata-core`:
//! an in-process loopback transport and a `serde_json` wire format.
//! Concrete network transports (HTTP/WebSocket/TCP) are out of scope —
//! these exist only to make the core runtime exercisable.

mod json_format;
mod loopback;

pub use json_format::JsonFormat;
pub use loopback::{LoopbackClient, LoopbackTransport};
