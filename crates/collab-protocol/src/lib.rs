//! collab-protocol: wire types for the event-sourced collaboration core.
//!
//! All client/host messages use a top-level `type` field for discriminated
//! serialization, the same convention used by this workspace's other wire
//! protocols.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, globally unique identity for an authoritative event.
///
/// Generated by proposers with a fresh UUID v4 and never altered by the
/// host -- the host renumbers `timestamp` and `source`, never `id`.
pub type EventId = String;

/// Advisory identity of a connected client. The host reserves
/// [`Source::HOST`] for its own synthesized events.
pub type ClientId = String;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The origin of an event: either a named client or the host itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub client_id: ClientId,
}

impl Source {
    /// Reserved client id used for host-originated events.
    pub const HOST: &'static str = "host";

    pub fn client(client_id: impl Into<ClientId>) -> Self {
        Source {
            client_id: client_id.into(),
        }
    }

    pub fn host() -> Self {
        Source {
            client_id: Self::HOST.to_owned(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.client_id == Self::HOST
    }
}

/// An immutable event record.
///
/// Ordered by `(timestamp, id)` ascending -- see `collab_engine::ord_key`.
/// `payload` and `context` are opaque to the core; the embedder's reducer
/// is the only code that interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event<P, C = ()> {
    pub id: EventId,
    /// Integer milliseconds. Authoritative once stamped by the host.
    pub timestamp: i64,
    pub source: Source,
    pub payload: P,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<C>,
}

impl<P, C> Event<P, C> {
    /// The `(timestamp, id)` pair used for all log ordering and comparisons.
    pub fn ord_key(&self) -> (i64, &str) {
        (self.timestamp, self.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// All client<->host message kinds.
///
/// Serializes/deserializes using the `type` field as a tag, e.g.
/// `{ "type": "event", "id": ..., "timestamp": ..., ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Envelope<P, C = ()> {
    /// Client -> host: a proposal. Host -> client: the authoritative event.
    Event(Event<P, C>),
    /// Host -> client: the proposal with this id was rejected.
    Rejection { event_id: EventId },
    /// Client -> host: replay everything after `since` (ms, 0 for "all").
    RequestHistory { since: i64 },
    /// Host -> client: reply to `RequestHistory`, sorted ascending.
    EventHistory { events: Vec<Event<P, C>> },
}
