//! collab-memory-port: an in-process [`Port`] for tests and the demo's
//! local (non-networked) mode.
//!
//! [`memory_port_pair`] builds two linked ports. Posting on one delivers a
//! [`PortEvent::Message`] to the other's subscribers; [`MemoryPort::set_connected`]
//! lets a test flip a port's connectivity, exercising the buffer-while-down
//! and drain-on-reconnect contract every [`Port`] must honor.

use async_trait::async_trait;
use collab_port::{Port, PortEvent, PortEvents};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Number of buffered [`PortEvent`]s a lagging subscriber may fall behind by
/// before missing one. Generous because this port is for tests and demos,
/// not a production fan-out path.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Builds two [`MemoryPort`]s wired together: whatever is posted on one is
/// delivered, in order, to the other's subscribers once that side is
/// connected.
///
/// Both ports start connected.
pub fn memory_port_pair<M>() -> (MemoryPort<M>, MemoryPort<M>)
where
    M: Clone + Send + Sync + 'static,
{
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel::<M>();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel::<M>();

    let (a_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (b_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    spawn_delivery_task(b_to_a_rx, a_events_tx.clone());
    spawn_delivery_task(a_to_b_rx, b_events_tx.clone());

    let a = MemoryPort::new(a_to_b_tx, a_events_tx);
    let b = MemoryPort::new(b_to_a_tx, b_events_tx);
    (a, b)
}

fn spawn_delivery_task<M>(mut inbox: mpsc::UnboundedReceiver<M>, events_tx: broadcast::Sender<PortEvent<M>>)
where
    M: Send + 'static,
{
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            // No subscribers is not an error -- just means nobody's listening yet.
            let _ = events_tx.send(PortEvent::Message(msg));
        }
    });
}

/// An in-process [`Port`] half. See [`memory_port_pair`].
pub struct MemoryPort<M> {
    connected: Arc<AtomicBool>,
    buffer: Arc<Mutex<VecDeque<M>>>,
    outbox: mpsc::UnboundedSender<M>,
    events_tx: broadcast::Sender<PortEvent<M>>,
}

impl<M> MemoryPort<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn new(outbox: mpsc::UnboundedSender<M>, events_tx: broadcast::Sender<PortEvent<M>>) -> Self {
        MemoryPort {
            connected: Arc::new(AtomicBool::new(true)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            outbox,
            events_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flips this port's connectivity. Transitioning to connected drains any
    /// messages buffered while it was down, in post order, before announcing
    /// [`PortEvent::Connected`]. A no-op if `connected` matches the current
    /// state.
    pub async fn set_connected(&self, connected: bool) {
        let was_connected = self.connected.swap(connected, Ordering::SeqCst);
        if connected == was_connected {
            return;
        }
        if connected {
            let mut buffer = self.buffer.lock().await;
            while let Some(msg) = buffer.pop_front() {
                let _ = self.outbox.send(msg);
            }
            drop(buffer);
            let _ = self.events_tx.send(PortEvent::Connected);
        } else {
            let _ = self.events_tx.send(PortEvent::Disconnected);
        }
    }
}

#[async_trait]
impl<M> Port<M> for MemoryPort<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn post(&self, msg: M) {
        if self.is_connected() {
            let _ = self.outbox.send(msg);
        } else {
            self.buffer.lock().await.push_back(msg);
        }
    }

    fn subscribe(&self) -> PortEvents<M> {
        let rx = self.events_tx.subscribe();
        let initial = self.is_connected().then_some(PortEvent::Connected);
        PortEvents::new_primed(rx, initial)
    }
}
