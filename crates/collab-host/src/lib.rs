//! collab-host: the single authoritative host of a collaboration session.
//!
//! A [`HostRole`] owns the authoritative [`EventLog`], a registry of
//! connected clients, and the set of ids it has ever accepted. It is the
//! sole writer: clients propose, the host validates and timestamps, and
//! every accepted event is broadcast back out, each recipient seeing its own
//! `filter_for_client` projection of it.

use chrono::Utc;
use collab_engine::{EngineError, EventLog, ListenerId, ReducerError};
use collab_port::{Port, PortEvent};
use collab_protocol::{ClientId, Event, EventId, Envelope, Source};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tunables for a [`HostRole`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Forwarded to [`EventLog::new`]; must be at least 1.
    pub snapshot_interval: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig { snapshot_interval: 100 }
    }
}

type Validate<P, C> = Arc<dyn Fn(&Event<P, C>, &ClientId) -> bool + Send + Sync>;
type FilterForClient<P, C> = Arc<dyn Fn(&Event<P, C>, &ClientId) -> Option<Event<P, C>> + Send + Sync>;
type ClientRegistry<P, C> = Arc<RwLock<HashMap<ClientId, Arc<dyn Port<Envelope<P, C>>>>>>;

struct HostInner<S, P, C> {
    log: EventLog<S, P, C>,
    past_ids: HashSet<EventId>,
}

/// The authoritative host side of an event-sourced collaboration session.
pub struct HostRole<S, P, C = ()> {
    inner: Arc<Mutex<HostInner<S, P, C>>>,
    clients: ClientRegistry<P, C>,
    subscriber_tasks: Mutex<HashMap<ClientId, JoinHandle<()>>>,
    validate: Validate<P, C>,
    filter_for_client: FilterForClient<P, C>,
}

impl<S, P, C> HostRole<S, P, C>
where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(
        initial_state: S,
        reducer: impl Fn(&S, &Event<P, C>) -> Result<S, ReducerError> + Send + Sync + 'static,
        validate: impl Fn(&Event<P, C>, &ClientId) -> bool + Send + Sync + 'static,
        filter_for_client: impl Fn(&Event<P, C>, &ClientId) -> Option<Event<P, C>> + Send + Sync + 'static,
        config: HostConfig,
    ) -> Result<Self, EngineError> {
        let log = EventLog::new(initial_state, config.snapshot_interval, reducer)?;
        Ok(HostRole {
            inner: Arc::new(Mutex::new(HostInner {
                log,
                past_ids: HashSet::new(),
            })),
            clients: Arc::new(RwLock::new(HashMap::new())),
            subscriber_tasks: Mutex::new(HashMap::new()),
            validate: Arc::new(validate),
            filter_for_client: Arc::new(filter_for_client),
        })
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

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Registers a client's port and starts servicing its proposals and
    /// history requests. Replaces any existing registration for the same id.
    pub async fn add_client(&self, client_id: impl Into<ClientId>, port: Arc<dyn Port<Envelope<P, C>>>) {
        let client_id = client_id.into();
        let subscriber_task = spawn_client_subscriber_task(
            self.inner.clone(),
            self.clients.clone(),
            self.validate.clone(),
            self.filter_for_client.clone(),
            client_id.clone(),
            port.clone(),
        );
        self.clients.write().await.insert(client_id.clone(), port);
        if let Some(old) = self.subscriber_tasks.lock().await.insert(client_id, subscriber_task) {
            old.abort();
        }
    }

    /// Deregisters a client and stops its subscriber task.
    pub async fn remove_client(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
        if let Some(handle) = self.subscriber_tasks.lock().await.remove(client_id) {
            handle.abort();
        }
    }

    /// Dispatches a host-originated event (e.g. a referee ruling with no
    /// client proposer) and broadcasts it like any accepted client proposal.
    pub async fn dispatch_host_event(&self, payload: P, context: Option<C>) -> Result<EventId, EngineError> {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            source: Source::host(),
            payload,
            context,
        };
        let event_id = event.id.clone();
        {
            let mut inner = self.inner.lock().await;
            inner.log.dispatch(event.clone())?;
            inner.past_ids.insert(event_id.clone());
        }
        broadcast(&self.clients, &self.filter_for_client, event).await;
        Ok(event_id)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn broadcast<P, C>(clients: &ClientRegistry<P, C>, filter_for_client: &FilterForClient<P, C>, event: Event<P, C>)
where
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let targets: Vec<(Arc<dyn Port<Envelope<P, C>>>, Event<P, C>)> = {
        let clients = clients.read().await;
        clients
            .iter()
            .filter_map(|(client_id, port)| {
                let filtered = filter_for_client(&event, client_id)?;
                Some((port.clone(), filtered))
            })
            .collect()
    };
    let posts = targets
        .into_iter()
        .map(|(port, filtered)| async move { port.post(Envelope::Event(filtered)).await });
    futures_util::future::join_all(posts).await;
}

fn spawn_client_subscriber_task<S, P, C>(
    inner: Arc<Mutex<HostInner<S, P, C>>>,
    clients: ClientRegistry<P, C>,
    validate: Validate<P, C>,
    filter_for_client: FilterForClient<P, C>,
    client_id: ClientId,
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
                Some(PortEvent::Connected) | Some(PortEvent::Disconnected) => {
                    // The port already buffers posts while this client is
                    // unreachable; the host has no additional action to take.
                }
                Some(PortEvent::MessageError(message)) => {
                    tracing::warn!(client_id = %client_id, error = %message, "collab-host: port reported a message error");
                }
                Some(PortEvent::Message(Envelope::Event(proposed))) => {
                    handle_proposal(&inner, &clients, &validate, &filter_for_client, &client_id, &port, proposed).await;
                }
                Some(PortEvent::Message(Envelope::RequestHistory { since })) => {
                    handle_request_history(&inner, &filter_for_client, &client_id, &port, since).await;
                }
                Some(PortEvent::Message(Envelope::Rejection { .. } | Envelope::EventHistory { .. })) => {
                    tracing::warn!(client_id = %client_id, "collab-host: received a host-only message kind from a client");
                }
            }
        }
    })
}

async fn handle_proposal<S, P, C>(
    inner: &Arc<Mutex<HostInner<S, P, C>>>,
    clients: &ClientRegistry<P, C>,
    validate: &Validate<P, C>,
    filter_for_client: &FilterForClient<P, C>,
    client_id: &ClientId,
    port: &Arc<dyn Port<Envelope<P, C>>>,
    proposed: Event<P, C>,
) where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let event_id = proposed.id.clone();

    let accepted = {
        let mut guard = inner.lock().await;
        if guard.past_ids.contains(&event_id) || !validate(&proposed, client_id) {
            None
        } else {
            let authoritative = Event {
                id: proposed.id,
                timestamp: now_ms(),
                source: Source::client(client_id.clone()),
                payload: proposed.payload,
                context: proposed.context,
            };
            match guard.log.dispatch(authoritative.clone()) {
                Ok(()) => {
                    guard.past_ids.insert(event_id.clone());
                    Some(authoritative)
                }
                Err(err) => {
                    tracing::warn!(client_id = %client_id, error = %err, "collab-host: reducer rejected a proposal");
                    None
                }
            }
        }
    };

    match accepted {
        Some(authoritative) => broadcast(clients, filter_for_client, authoritative).await,
        None => port.post(Envelope::Rejection { event_id }).await,
    }
}

async fn handle_request_history<S, P, C>(
    inner: &Arc<Mutex<HostInner<S, P, C>>>,
    filter_for_client: &FilterForClient<P, C>,
    client_id: &ClientId,
    port: &Arc<dyn Port<Envelope<P, C>>>,
    since: i64,
) where
    S: Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    let events: Vec<Event<P, C>> = {
        let guard = inner.lock().await;
        guard
            .log
            .log()
            .iter()
            .filter(|e| e.timestamp > since)
            .filter_map(|e| filter_for_client(e, client_id))
            .collect()
    };
    port.post(Envelope::EventHistory { events }).await;
}

impl<S, P, C> Drop for HostRole<S, P, C> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.subscriber_tasks.try_lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_memory_port::memory_port_pair;
    use tokio::time::Duration;

    fn counter_reducer() -> impl Fn(&i64, &Event<i64>) -> Result<i64, ReducerError> {
        |state, event| Ok(state + event.payload)
    }

    fn accept_all() -> impl Fn(&Event<i64>, &ClientId) -> bool {
        |_event, _client_id| true
    }

    fn no_filtering() -> impl Fn(&Event<i64>, &ClientId) -> Option<Event<i64>> {
        |event, _client_id| Some(event.clone())
    }

    async fn recv_message(events: &mut collab_port::PortEvents<Envelope<i64>>) -> Envelope<i64> {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("port closed")
            {
                PortEvent::Message(envelope) => return envelope,
                PortEvent::Connected | PortEvent::Disconnected => continue,
                PortEvent::MessageError(message) => panic!("unexpected message error: {message}"),
            }
        }
    }

    #[tokio::test]
    async fn accepts_a_valid_proposal_and_broadcasts_to_all_clients() {
        let host = HostRole::new(0i64, counter_reducer(), accept_all(), no_filtering(), HostConfig::default()).unwrap();

        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        let (bob_host_side, bob_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;
        host.add_client("bob", Arc::new(bob_host_side)).await;

        let mut bob_events = bob_client_side.subscribe();
        alice_client_side
            .post(Envelope::Event(Event {
                id: "p1".to_owned(),
                timestamp: 1,
                source: Source::client("alice"),
                payload: 5,
                context: None,
            }))
            .await;

        match recv_message(&mut bob_events).await {
            Envelope::Event(event) => {
                assert_eq!(event.id, "p1");
                assert_eq!(event.payload, 5);
                assert_eq!(event.source, Source::client("alice"));
            }
            other => panic!("expected an authoritative event, got {other:?}"),
        }
        assert_eq!(*host.state().await, 5);
    }

    #[tokio::test]
    async fn rejects_a_duplicate_proposal_id_to_the_proposer_only() {
        let host = HostRole::new(0i64, counter_reducer(), accept_all(), no_filtering(), HostConfig::default()).unwrap();
        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;

        let mut alice_events = alice_client_side.subscribe();
        let proposal = Event {
            id: "dup".to_owned(),
            timestamp: 1,
            source: Source::client("alice"),
            payload: 1,
            context: None,
        };
        alice_client_side.post(Envelope::Event(proposal.clone())).await;
        let first = recv_message(&mut alice_events).await;
        assert!(matches!(first, Envelope::Event(_)));

        alice_client_side.post(Envelope::Event(proposal)).await;
        match recv_message(&mut alice_events).await {
            Envelope::Rejection { event_id } => assert_eq!(event_id, "dup"),
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(*host.state().await, 1);
    }

    #[tokio::test]
    async fn rejects_a_proposal_that_fails_validation() {
        let host = HostRole::new(
            0i64,
            counter_reducer(),
            |event: &Event<i64>, _client_id: &ClientId| event.payload >= 0,
            no_filtering(),
            HostConfig::default(),
        )
        .unwrap();
        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;

        let mut alice_events = alice_client_side.subscribe();
        alice_client_side
            .post(Envelope::Event(Event {
                id: "bad".to_owned(),
                timestamp: 1,
                source: Source::client("alice"),
                payload: -1,
                context: None,
            }))
            .await;

        match recv_message(&mut alice_events).await {
            Envelope::Rejection { event_id } => assert_eq!(event_id, "bad"),
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(*host.state().await, 0);
    }

    #[tokio::test]
    async fn serves_filtered_history_since_a_timestamp() {
        let host = HostRole::new(
            0i64,
            counter_reducer(),
            accept_all(),
            |event: &Event<i64>, _client_id: &ClientId| (event.payload != 0).then(|| event.clone()),
            HostConfig::default(),
        )
        .unwrap();

        host.dispatch_host_event(1, None).await.unwrap();
        host.dispatch_host_event(0, None).await.unwrap();
        host.dispatch_host_event(2, None).await.unwrap();

        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;
        let mut alice_events = alice_client_side.subscribe();

        alice_client_side.post(Envelope::RequestHistory { since: 0 }).await;
        match recv_message(&mut alice_events).await {
            Envelope::EventHistory { events } => {
                let payloads: Vec<i64> = events.iter().map(|e| e.payload).collect();
                assert_eq!(payloads, vec![1, 2]);
            }
            other => panic!("expected event history, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_host_event_records_past_id_and_stamps_host_source() {
        let host = HostRole::new(0i64, counter_reducer(), accept_all(), no_filtering(), HostConfig::default()).unwrap();
        let id = host.dispatch_host_event(3, None).await.unwrap();
        assert_eq!(*host.state().await, 3);

        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;
        let mut alice_events = alice_client_side.subscribe();

        // Re-proposing the same id from a client must be rejected: host
        // events land in the past-id set exactly like client ones.
        alice_client_side
            .post(Envelope::Event(Event {
                id: id.clone(),
                timestamp: 999,
                source: Source::client("alice"),
                payload: 100,
                context: None,
            }))
            .await;
        match recv_message(&mut alice_events).await {
            Envelope::Rejection { event_id } => assert_eq!(event_id, id),
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(*host.state().await, 3);
    }

    #[tokio::test]
    async fn removed_client_no_longer_receives_broadcasts() {
        let host = HostRole::new(0i64, counter_reducer(), accept_all(), no_filtering(), HostConfig::default()).unwrap();
        let (alice_host_side, alice_client_side) = memory_port_pair::<Envelope<i64>>();
        host.add_client("alice", Arc::new(alice_host_side)).await;
        assert_eq!(host.client_count().await, 1);

        host.remove_client("alice").await;
        assert_eq!(host.client_count().await, 0);

        host.dispatch_host_event(9, None).await.unwrap();
        let mut alice_events = alice_client_side.subscribe();
        let timed_out = tokio::time::timeout(Duration::from_millis(100), alice_events.recv()).await;
        assert!(timed_out.is_err(), "removed client should not observe further broadcasts");
    }
}
