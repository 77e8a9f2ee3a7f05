//! collab-client: the client side of the collaboration core.
//!
//! A [`ClientRole`] wraps an [`EventLog`] and a [`Port`] to give an embedder
//! optimistic local writes (`propose`), automatic retry of unacknowledged
//! proposals, and reconciliation against whatever the host actually decided
//! (confirmation, rejection, or history catch-up on reconnect).

use chrono::Utc;
use collab_engine::{event_cmp, EngineError, EventLog, ListenerId, ReducerError};
use collab_port::{Port, PortEvent};
use collab_protocol::{ClientId, Event, EventId, Envelope, Source};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tunables for a [`ClientRole`]. Defaults match the core's own defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Forwarded to [`EventLog::new`]; must be at least 1.
    pub snapshot_interval: usize,
    /// How often an unacknowledged proposal is resent.
    pub retry_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            snapshot_interval: 100,
            retry_timeout: Duration::from_secs(5),
        }
    }
}

struct PendingEntry<P, C> {
    event: Event<P, C>,
    retry_handle: JoinHandle<()>,
}

struct ClientInner<S, P, C> {
    log: EventLog<S, P, C>,
    pending: HashMap<EventId, PendingEntry<P, C>>,
}

/// The client side of an event-sourced collaboration session.
///
/// Every public method acquires the role's single internal mutex for the
/// duration of one engine operation and releases it before any `.await` on
/// the port, so the port can never stall the engine's single-writer model.
pub struct ClientRole<S, P, C = ()> {
    client_id: ClientId,
    inner: Arc<Mutex<ClientInner<S, P, C>>>,
    port: Arc<dyn Port<Envelope<P, C>>>,
    retry_timeout: Duration,
    subscriber_task: JoinHandle<()>,
}

impl<S, P, C> ClientRole<S, P, C>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(
        client_id: impl Into<ClientId>,
        initial_state: S,
        reducer: impl Fn(&S, &Event<P, C>) -> Result<S, ReducerError> + Send + Sync + 'static,
        port: Arc<dyn Port<Envelope<P, C>>>,
        config: ClientConfig,
    ) -> Result<Self, EngineError> {
        let log = EventLog::new(initial_state, config.snapshot_interval, reducer)?;
        let inner = Arc::new(Mutex::new(ClientInner {
            log,
            pending: HashMap::new(),
        }));
        let subscriber_task = spawn_subscriber_task(inner.clone(), port.clone());
        Ok(ClientRole {
            client_id: client_id.into(),
            inner,
            port,
            retry_timeout: config.retry_timeout,
            subscriber_task,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub async fn state(&self) -> Arc<S> {
        self.inner.lock().await.log.state()
    }

    pub async fn subscribe(&self, cb: impl Fn(&S) + Send + Sync + 'static) -> ListenerId {
        self.inner.lock().await.log.subscribe(cb)
    }

    pub async fn unsubscribe(&self, id: ListenerId) {
        self.inner.lock().await.log.unsubscribe(id);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Proposes a new event: applies it to the local log optimistically,
    /// registers it as pending, and posts it to the host. Returns the fresh
    /// event id, which the caller can correlate against later confirmation
    /// or rejection by watching `pending_count` or subscribing to state.
    ///
    /// If the local reducer rejects the proposal, nothing is posted and
    /// nothing is left pending -- the caller sees the error directly.
    pub async fn propose(&self, payload: P, context: Option<C>) -> Result<EventId, EngineError> {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            source: Source::client(self.client_id.clone()),
            payload,
            context,
        };
        let event_id = event.id.clone();

        {
            let mut inner = self.inner.lock().await;
            inner.log.dispatch(event.clone())?;
            let retry_handle = spawn_retry_task(
                self.inner.clone(),
                self.port.clone(),
                event.clone(),
                self.retry_timeout,
            );
            inner.pending.insert(
                event_id.clone(),
                PendingEntry {
                    event: event.clone(),
                    retry_handle,
                },
            );
        }

        self.port.post(Envelope::Event(event)).await;
        Ok(event_id)
    }
}

impl<S, P, C> Drop for ClientRole<S, P, C> {
    fn drop(&mut self) {
        self.subscriber_task.abort();
    }
}

fn spawn_retry_task<S, P, C>(
    inner: Arc<Mutex<ClientInner<S, P, C>>>,
    port: Arc<dyn Port<Envelope<P, C>>>,
    event: Event<P, C>,
    retry_timeout: Duration,
) -> JoinHandle<()>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let event_id = event.id.clone();
        let mut ticker = tokio::time::interval(retry_timeout);
        // The first tick fires immediately; we already posted once in `propose`.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let still_pending = inner.lock().await.pending.contains_key(&event_id);
            if !still_pending {
                return;
            }
            port.post(Envelope::Event(event.clone())).await;
        }
    })
}

fn spawn_subscriber_task<S, P, C>(
    inner: Arc<Mutex<ClientInner<S, P, C>>>,
    port: Arc<dyn Port<Envelope<P, C>>>,
) -> JoinHandle<()>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut events = port.subscribe();
        loop {
            match events.recv().await {
                None => return,
                Some(PortEvent::Connected) => on_connected(&inner, &port).await,
                Some(PortEvent::Disconnected) => {
                    // Pending proposals keep retrying on their own schedule;
                    // there is nothing additional to do here.
                }
                Some(PortEvent::MessageError(message)) => {
                    tracing::warn!(error = %message, "collab-client: port reported a message error");
                }
                Some(PortEvent::Message(envelope)) => handle_envelope(&inner, envelope).await,
            }
        }
    })
}

async fn on_connected<S, P, C>(inner: &Arc<Mutex<ClientInner<S, P, C>>>, port: &Arc<dyn Port<Envelope<P, C>>>)
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let (pending_events, since) = {
        let guard = inner.lock().await;
        let pending_events: Vec<Event<P, C>> = guard.pending.values().map(|p| p.event.clone()).collect();
        let since = guard.log.log().last().map_or(0, |e| e.timestamp);
        (pending_events, since)
    };
    for event in pending_events {
        port.post(Envelope::Event(event)).await;
    }
    port.post(Envelope::RequestHistory { since }).await;
}

async fn handle_envelope<S, P, C>(inner: &Arc<Mutex<ClientInner<S, P, C>>>, envelope: Envelope<P, C>)
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    match envelope {
        Envelope::Event(event) => {
            let mut guard = inner.lock().await;
            if let Some(pending) = guard.pending.remove(&event.id) {
                pending.retry_handle.abort();
            }
            // The authoritative event may carry the same id as a locally
            // applied optimistic copy (same proposal, re-stamped timestamp
            // and source) or as an already-integrated authoritative copy (a
            // duplicate delivery). Either way, drop whatever the log already
            // holds for this id before integrating the authoritative record,
            // so the log never ends up with two entries for one id.
            if let Err(err) = guard.log.remove_event(&event.id) {
                tracing::warn!(error = %err, "collab-client: failed to remove the optimistic copy of an event before integrating its authoritative version");
            }
            let appends_at_tail = guard
                .log
                .log()
                .last()
                .map_or(true, |last| event_cmp(last, &event) == Ordering::Less);
            let result = if appends_at_tail {
                guard.log.dispatch(event)
            } else {
                guard.log.insert_events(vec![event])
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "collab-client: dropped an authoritative event the local reducer rejected");
            }
        }
        Envelope::Rejection { event_id } => {
            let mut guard = inner.lock().await;
            // A rejection only ever rolls back an event still outstanding in
            // `pending`. A stale or duplicate rejection for an id that has
            // since been confirmed (e.g. the retry task's resend reached the
            // host just after the original proposal was already accepted)
            // must not strip an already-confirmed event back out of the log.
            if let Some(pending) = guard.pending.remove(&event_id) {
                pending.retry_handle.abort();
                if let Err(err) = guard.log.remove_event(&event_id) {
                    tracing::warn!(error = %err, "collab-client: failed to roll back a rejected proposal");
                }
            }
        }
        Envelope::EventHistory { events } => {
            let mut guard = inner.lock().await;
            let fresh: Vec<Event<P, C>> = events.into_iter().filter(|e| !guard.log.contains_id(&e.id)).collect();
            if let Err(err) = guard.log.insert_events(fresh) {
                tracing::warn!(error = %err, "collab-client: failed to integrate event history");
            }
        }
        Envelope::RequestHistory { .. } => {
            tracing::warn!("collab-client: received a RequestHistory message; clients do not serve history");
        }
    }
}
