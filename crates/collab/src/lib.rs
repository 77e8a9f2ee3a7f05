//! collab: a single-dependency front door onto the event-sourced
//! collaboration core.
//!
//! An embedder that only needs `EventLog` plus the client/host roles can
//! depend on this crate alone; anyone building a custom transport or reusing
//! just the engine should depend on the individual `collab-*` crates
//! directly instead.

pub use collab_client::{ClientConfig, ClientRole};
pub use collab_engine::{event_cmp, merge_sorted_by, EngineError, EventLog, ListenerId, ReducerError, SnapshotId};
pub use collab_host::{HostConfig, HostRole};
pub use collab_port::{Port, PortEvent, PortEvents};
pub use collab_protocol::{ClientId, Envelope, Event, EventId, Source};
