//! collab-port: the reconnecting transport contract.
//!
//! [`Port`] abstracts over "an asynchronous, ordered, at-least-once channel
//! to the other side" without committing to any particular transport.
//! [`collab_memory_port`] implements it in-process for tests and demos;
//! [`collab_ws_port`] implements it over a real WebSocket connection with
//! reconnect-with-backoff. Both honor the same buffering contract: a `post`
//! issued while disconnected is queued and delivered, in order, once the
//! port reconnects.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

/// An event a [`Port`] emits to its subscribers.
#[derive(Debug, Clone)]
pub enum PortEvent<M> {
    /// A message arrived from the other side.
    Message(M),
    /// The underlying transport is (re)connected. Always the first event a
    /// fresh subscriber should expect if the port is currently up.
    Connected,
    /// The underlying transport dropped. Posts made from this point on are
    /// buffered, not lost.
    Disconnected,
    /// A subscriber fell behind the broadcast channel's buffer and missed
    /// some events; delivery continues from the next one.
    MessageError(String),
}

/// An asynchronous, reconnecting, ordered, at-least-once channel to the
/// other side of a collaboration session.
///
/// Implementers must buffer `post`s made while disconnected and deliver them,
/// in order, once reconnected; the trait itself cannot enforce this, but
/// every concrete [`Port`] in this workspace is tested against it.
#[async_trait]
pub trait Port<M>: Send + Sync {
    /// Enqueues `msg` for delivery to the other side.
    async fn post(&self, msg: M);

    /// Subscribes to this port's event stream. Multiple subscribers may
    /// coexist; dropping a [`PortEvents`] is how a subscriber unsubscribes.
    fn subscribe(&self) -> PortEvents<M>;
}

/// A subscription to a [`Port`]'s event stream.
pub struct PortEvents<M> {
    /// Synthesized event delivered once before anything from `inner`, used
    /// by implementers to prime a fresh subscriber with the port's current
    /// connectivity (see [`PortEvents::new_primed`]).
    primed: Option<PortEvent<M>>,
    inner: BroadcastStream<PortEvent<M>>,
}

impl<M> PortEvents<M>
where
    M: Clone + Send + 'static,
{
    pub fn new(rx: broadcast::Receiver<PortEvent<M>>) -> Self {
        PortEvents {
            primed: None,
            inner: BroadcastStream::new(rx),
        }
    }

    /// Like [`PortEvents::new`], but delivers `initial` before anything else
    /// if present. Implementers use this so that a subscriber who joins
    /// while the port is already connected still sees a leading `Connected`
    /// event, matching one who joins before the first connection.
    pub fn new_primed(rx: broadcast::Receiver<PortEvent<M>>, initial: Option<PortEvent<M>>) -> Self {
        PortEvents {
            primed: initial,
            inner: BroadcastStream::new(rx),
        }
    }

    /// Awaits the next event, translating a lagged-receiver condition into a
    /// [`PortEvent::MessageError`] rather than exposing the broadcast
    /// channel's own error type.
    pub async fn recv(&mut self) -> Option<PortEvent<M>> {
        if let Some(event) = self.primed.take() {
            return Some(event);
        }
        match self.inner.next().await {
            None => None,
            Some(Ok(event)) => Some(event),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => Some(PortEvent::MessageError(
                format!("subscriber lagged behind by {skipped} messages"),
            )),
        }
    }
}
