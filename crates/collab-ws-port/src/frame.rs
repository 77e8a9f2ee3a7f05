//! Wire framing for a [`collab_port::Port`] carried over a WebSocket.
//!
//! `Envelope<P, C>` messages ride alongside a tiny app-level handshake and
//! heartbeat, the same layering the project's own uplink session uses on top
//! of `rt-protocol`'s `WsMessage`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame<M> {
    /// First frame sent by the connecting side, advertising its client id.
    Hello { client_id: String },
    /// First frame sent back by the accepting side, acknowledging the hello.
    HelloAck,
    /// Idle-connection liveness ping; carries no payload.
    Heartbeat,
    /// An actual `Port` message.
    Payload(M),
}

// Hand-written rather than derived so a caller can log a `WsFrame<M>` during
// handshake without requiring the (unrelated) payload type to be `Debug`.
impl<M> std::fmt::Debug for WsFrame<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WsFrame::Hello { client_id } => write!(f, "Hello({client_id})"),
            WsFrame::HelloAck => write!(f, "HelloAck"),
            WsFrame::Heartbeat => write!(f, "Heartbeat"),
            WsFrame::Payload(_) => write!(f, "Payload(..)"),
        }
    }
}
