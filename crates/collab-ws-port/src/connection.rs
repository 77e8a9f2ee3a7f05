//! The read/write loop shared by the client and server halves once a
//! WebSocket handshake has completed.

use crate::frame::WsFrame;
use collab_port::PortEvent;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

pub(crate) enum ExitReason {
    /// The other side closed the connection, or a read/write failed.
    Remote(String),
    /// The local [`mpsc::UnboundedSender`] half was dropped -- the owning
    /// `Port` itself has gone away, so the caller should stop reconnecting.
    OutboxDropped,
}

/// Sends and receives [`WsFrame`]s until the connection drops or the
/// `Port`'s outbox is closed. Every `Payload` received is republished as a
/// [`PortEvent::Message`]; malformed frames become [`PortEvent::MessageError`]
/// rather than tearing down the connection.
pub(crate) async fn drive_connection<M, S>(
    mut ws: S,
    outbox: &mut mpsc::UnboundedReceiver<M>,
    events_tx: &broadcast::Sender<PortEvent<M>>,
    heartbeat_interval: Duration,
) -> ExitReason
where
    M: Serialize + DeserializeOwned + Clone + Send + 'static,
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            biased;
            outgoing = outbox.recv() => {
                match outgoing {
                    None => return ExitReason::OutboxDropped,
                    Some(payload) => {
                        if let Err(err) = send_frame(&mut ws, &WsFrame::Payload(payload)).await {
                            return ExitReason::Remote(err.to_string());
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = send_frame(&mut ws, &WsFrame::<M>::Heartbeat).await {
                    return ExitReason::Remote(err.to_string());
                }
            }
            incoming = ws.next() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) => return ExitReason::Remote("connection closed".to_owned()),
                    Some(Err(err)) => return ExitReason::Remote(err.to_string()),
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsFrame<M>>(&text) {
                        Ok(WsFrame::Payload(message)) => {
                            let _ = events_tx.send(PortEvent::Message(message));
                        }
                        Ok(WsFrame::Heartbeat) => {}
                        Ok(WsFrame::Hello { .. } | WsFrame::HelloAck) => {
                            tracing::warn!("collab-ws-port: unexpected handshake frame mid-session");
                        }
                        Err(err) => {
                            let _ = events_tx.send(PortEvent::MessageError(err.to_string()));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

pub(crate) async fn send_frame<M, S>(ws: &mut S, frame: &WsFrame<M>) -> Result<(), WsError>
where
    M: Serialize,
    S: Sink<Message, Error = WsError> + Unpin,
{
    let json = serde_json::to_string(frame).expect("WsFrame serialization is infallible for well-formed payloads");
    ws.send(Message::Text(json.into())).await
}

pub(crate) async fn recv_frame<M, S>(ws: &mut S) -> Result<WsFrame<M>, WsError>
where
    M: DeserializeOwned,
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            None => return Err(WsError::ConnectionClosed),
            Some(Err(err)) => return Err(err),
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|err| WsError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)));
            }
            Some(Ok(Message::Close(_))) => return Err(WsError::ConnectionClosed),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) => continue,
        }
    }
}

/// Simple doubling backoff with a ceiling, reset after every successful
/// handshake. Mirrors the retry shape the project already uses for its
/// client-side reconnect loops, minus the jitter this workspace doesn't use
/// elsewhere either.
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Backoff { initial, max, current: initial }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }
}
