//! The accepting (host) half of a WebSocket [`Port`].
//!
//! Unlike [`crate::client::WsClientPort`], a [`WsServerPort`] does not
//! reconnect itself: one TCP connection is one `WsServerPort`. When a client
//! reconnects it opens a brand new connection, and the host's
//! [`WsListener::accept_next`] loop hands the embedder a fresh port to
//! re-register (typically by calling `HostRole::add_client` again for the
//! same `client_id`, replacing the stale registration).

use crate::connection::{drive_connection, recv_frame, send_frame, ExitReason};
use crate::frame::WsFrame;
use async_trait::async_trait;
use collab_port::{Port, PortEvent, PortEvents};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A [`Port`] wrapping a single accepted WebSocket connection.
pub struct WsServerPort<M> {
    outbox: mpsc::UnboundedSender<M>,
    events_tx: broadcast::Sender<PortEvent<M>>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<M> WsServerPort<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M> Port<M> for WsServerPort<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn post(&self, msg: M) {
        let _ = self.outbox.send(msg);
    }

    fn subscribe(&self) -> PortEvents<M> {
        let rx = self.events_tx.subscribe();
        let initial = self.is_connected().then_some(PortEvent::Connected);
        PortEvents::new_primed(rx, initial)
    }
}

impl<M> Drop for WsServerPort<M> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Accepts a single already-connected TCP stream as a WebSocket, performs
/// the hello handshake, and returns the client id it announced alongside a
/// ready-to-use [`WsServerPort`].
pub async fn accept<M>(stream: TcpStream, heartbeat_interval: Duration) -> Result<(String, WsServerPort<M>), String>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|err| format!("websocket accept failed: {err}"))?;

    let client_id = match recv_frame::<(), _>(&mut ws).await {
        Ok(WsFrame::Hello { client_id }) => client_id,
        Ok(other) => return Err(format!("expected hello, got a different frame first: {other:?}")),
        Err(err) => return Err(format!("hello recv failed: {err}")),
    };
    send_frame(&mut ws, &WsFrame::<()>::HelloAck)
        .await
        .map_err(|err| format!("hello_ack send failed: {err}"))?;

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<M>();
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let connected = Arc::new(AtomicBool::new(true));

    let task_events_tx = events_tx.clone();
    let task_connected = connected.clone();
    let task = tokio::spawn(async move {
        let exit = drive_connection(&mut ws, &mut outbox_rx, &task_events_tx, heartbeat_interval).await;
        task_connected.store(false, Ordering::SeqCst);
        let _ = task_events_tx.send(PortEvent::Disconnected);
        if let ExitReason::Remote(message) = exit {
            tracing::info!(error = %message, "collab-ws-port: server connection ended");
        }
    });

    Ok((
        client_id,
        WsServerPort {
            outbox: outbox_tx,
            events_tx,
            connected,
            task,
        },
    ))
}

/// A bound listener handing out one [`WsServerPort`] per accepted
/// connection, each preceded by the hello handshake that identifies the
/// connecting client.
pub struct WsListener {
    listener: TcpListener,
    heartbeat_interval: Duration,
}

impl WsListener {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, heartbeat_interval: Duration) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(WsListener { listener, heartbeat_interval })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the next TCP connection and drives it through the hello
    /// handshake. Returns an error for that one connection attempt without
    /// tearing down the listener itself -- callers should loop and keep
    /// calling this.
    pub async fn accept_next<M>(&self) -> Result<(String, WsServerPort<M>), String>
    where
        M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let (stream, _peer) = self
            .listener
            .accept()
            .await
            .map_err(|err| format!("tcp accept failed: {err}"))?;
        accept(stream, self.heartbeat_interval).await
    }
}
