//! The connecting (client) half of a WebSocket [`Port`].

use crate::connection::{drive_connection, recv_frame, send_frame, Backoff, ExitReason};
use crate::frame::WsFrame;
use async_trait::async_trait;
use collab_port::{Port, PortEvent, PortEvents};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for [`WsClientPort::connect`].
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        WsClientConfig {
            heartbeat_interval: Duration::from_secs(15),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// A [`Port`] that connects out to a `collab-ws-port` server endpoint,
/// performs a hello handshake, and transparently reconnects with backoff on
/// any drop. `post`s made while disconnected are queued in an unbounded
/// channel and drained, in order, as soon as the next connection comes up.
pub struct WsClientPort<M> {
    outbox: mpsc::UnboundedSender<M>,
    events_tx: broadcast::Sender<PortEvent<M>>,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<M> WsClientPort<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Connects to `url`, identifying as `client_id` in the hello frame. The
    /// returned port is usable immediately; `post`s issued before the
    /// handshake completes are buffered like any other disconnected period.
    pub fn connect(url: impl Into<String>, client_id: impl Into<String>, config: WsClientConfig) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<M>();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let task = spawn_reconnect_loop(url.into(), client_id.into(), config, outbox_rx, events_tx.clone(), connected.clone());

        WsClientPort {
            outbox: outbox_tx,
            events_tx,
            connected,
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M> Port<M> for WsClientPort<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn post(&self, msg: M) {
        // An unbounded sender never blocks; a reconnect in progress just
        // means the message waits in the channel until `drive_connection`
        // starts pulling from it again.
        let _ = self.outbox.send(msg);
    }

    fn subscribe(&self) -> PortEvents<M> {
        let rx = self.events_tx.subscribe();
        let initial = self.is_connected().then_some(PortEvent::Connected);
        PortEvents::new_primed(rx, initial)
    }
}

impl<M> Drop for WsClientPort<M> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_reconnect_loop<M>(
    url: String,
    client_id: String,
    config: WsClientConfig,
    mut outbox_rx: mpsc::UnboundedReceiver<M>,
    events_tx: broadcast::Sender<PortEvent<M>>,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        loop {
            match connect_and_handshake(&url, &client_id).await {
                Ok(mut ws) => {
                    backoff.reset();
                    connected.store(true, Ordering::SeqCst);
                    let _ = events_tx.send(PortEvent::Connected);

                    let exit = drive_connection(&mut ws, &mut outbox_rx, &events_tx, config.heartbeat_interval).await;
                    connected.store(false, Ordering::SeqCst);
                    let _ = events_tx.send(PortEvent::Disconnected);

                    if let ExitReason::OutboxDropped = exit {
                        return;
                    }
                    if let ExitReason::Remote(message) = exit {
                        tracing::warn!(error = %message, "collab-ws-port: client connection dropped, reconnecting");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "collab-ws-port: failed to connect, retrying");
                }
            }
            backoff.wait().await;
        }
    })
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_and_handshake(url: &str, client_id: &str) -> Result<WsStream, String> {
    let request = url
        .into_client_request()
        .map_err(|err| format!("invalid websocket url '{url}': {err}"))?;
    let (mut ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|err| format!("connect failed: {err}"))?;

    send_frame(&mut ws, &WsFrame::<()>::Hello { client_id: client_id.to_owned() })
        .await
        .map_err(|err| format!("hello send failed: {err}"))?;

    match recv_frame::<(), _>(&mut ws).await {
        Ok(WsFrame::HelloAck) => Ok(ws),
        Ok(other) => Err(format!("expected hello_ack, got a different frame first: {other:?}")),
        Err(err) => Err(format!("hello_ack recv failed: {err}")),
    }
}
