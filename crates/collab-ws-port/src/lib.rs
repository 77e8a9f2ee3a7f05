//! collab-ws-port: a [`collab_port::Port`] implementation over a real
//! WebSocket connection.
//!
//! Structured the same way as this workspace's own uplink session
//! (`services/forwarder/src/uplink.rs` in the corpus this is drawn from):
//! connect, exchange a hello handshake, then loop send/recv with automatic
//! reconnect-with-backoff on drop. [`WsClientPort`] is the connecting side;
//! [`WsServerPort`] (built via [`accept`] or [`WsListener`]) is the accepting
//! side. Both buffer `post`s made while their connection is down, fulfilling
//! the same contract [`collab_memory_port::MemoryPort`] does in-process.

mod client;
mod connection;
mod frame;
mod server;

pub use client::{WsClientConfig, WsClientPort};
pub use server::{accept, WsListener, WsServerPort};
