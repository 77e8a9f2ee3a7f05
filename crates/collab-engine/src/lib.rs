//! collab-engine: the append-only event log at the heart of the
//! collaboration core.
//!
//! An [`EventLog`] holds an embedder-supplied state `S`, replays events of
//! type `Event<P, C>` against an embedder-supplied reducer to derive it, and
//! offers the four log-shaping operations every role is built from:
//! `dispatch` (append at the tail), `replay` (fold extra events onto the
//! current state without touching the log), `insert_events` (splice sorted
//! events anywhere in the log) and `remove_event` (delete by id). Snapshots
//! are an internal performance detail: they bound how much of the log has to
//! be re-folded after a rewind.

mod error;
mod merge;

pub use error::{EngineError, ReducerError};
pub use merge::merge_sorted_by;

use collab_protocol::Event;
use std::cmp::Ordering;
use std::sync::Arc;

/// Orders events by `(timestamp, id)` ascending, matching [`Event::ord_key`].
///
/// The sole comparator the engine uses. Every operation that needs a notion
/// of "before" or "after" goes through this function so there is exactly one
/// place that defines event order.
pub fn event_cmp<P, C>(a: &Event<P, C>, b: &Event<P, C>) -> Ordering {
    a.ord_key().cmp(&b.ord_key())
}

/// Handle returned by [`EventLog::subscribe`]. Pass it to
/// [`EventLog::unsubscribe`] to stop receiving notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Handle returned by [`EventLog::create_snapshot`]. Pass it to
/// [`EventLog::dispose_snapshot`] to release it early, e.g. when an embedder
/// knows a snapshot will never be rewound to again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotId(u64);

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct Snapshot<S> {
    id: u64,
    state: Arc<S>,
    /// Number of events in the log at the time this snapshot was taken.
    event_index: usize,
}

impl<S> Snapshot<S> {
    fn cloned(&self) -> Self {
        Snapshot {
            id: self.id,
            state: self.state.clone(),
            event_index: self.event_index,
        }
    }
}

/// The reducer signature every [`EventLog`] is built around: given the state
/// before an event and the event itself, either produce the state after it
/// or reject the event.
type Reducer<S, P, C> = Box<dyn Fn(&S, &Event<P, C>) -> Result<S, ReducerError> + Send + Sync>;

/// An append-only, snapshot-accelerated event log.
///
/// `S` is the embedder's derived state, `P` the event payload, and `C` an
/// optional per-event context (defaults to `()`). `EventLog` itself is not
/// shared directly between tasks -- [`collab_client::ClientRole`] and
/// [`collab_host::HostRole`] each own one behind their own synchronization.
pub struct EventLog<S, P, C = ()> {
    reducer: Reducer<S, P, C>,
    initial_state: Arc<S>,
    state: Arc<S>,
    log: Vec<Event<P, C>>,
    snapshots: Vec<Snapshot<S>>,
    next_snapshot_id: u64,
    snapshot_interval: usize,
    listeners: Vec<(u64, Listener<S>)>,
    next_listener_id: u64,
}

impl<S, P, C> EventLog<S, P, C>
where
    S: Send + Sync + 'static,
    P: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Builds a new log with the given `initial_state` and `reducer`.
    ///
    /// `snapshot_interval` controls how many events may accumulate past the
    /// newest snapshot before [`dispatch`](Self::dispatch) takes another one
    /// automatically; it must be at least 1.
    pub fn new(
        initial_state: S,
        snapshot_interval: usize,
        reducer: impl Fn(&S, &Event<P, C>) -> Result<S, ReducerError> + Send + Sync + 'static,
    ) -> Result<Self, EngineError> {
        if snapshot_interval == 0 {
            return Err(EngineError::InvalidConfig(
                "snapshot_interval must be at least 1".to_owned(),
            ));
        }
        let initial_state = Arc::new(initial_state);
        Ok(EventLog {
            reducer: Box::new(reducer),
            initial_state: initial_state.clone(),
            state: initial_state,
            log: Vec::new(),
            snapshots: Vec::new(),
            next_snapshot_id: 0,
            snapshot_interval,
            listeners: Vec::new(),
            next_listener_id: 0,
        })
    }

    /// The current derived state.
    pub fn state(&self) -> Arc<S> {
        self.state.clone()
    }

    /// The full event log, oldest first.
    pub fn log(&self) -> &[Event<P, C>] {
        &self.log
    }

    /// Number of events currently in the log.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.log.iter().any(|e| e.id == id)
    }

    /// Registers a listener, invoking it once immediately with the current
    /// state and then again after every state-changing operation.
    ///
    /// If `cb` panics on any invocation, the panic is caught and logged; it
    /// does not propagate to the caller of the operation that triggered the
    /// notification, and it does not stop other listeners from running.
    pub fn subscribe(&mut self, cb: impl Fn(&S) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        let cb: Listener<S> = Arc::new(cb);
        invoke_listener(&cb, &self.state);
        self.listeners.push((id, cb));
        ListenerId(id)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|(i, _)| *i != id.0);
    }

    fn notify(&self) {
        // Snapshot the listener list before invoking anything: a listener
        // that calls back into a *different* EventLog handle and ends up
        // unsubscribing one of our own listeners mid-pass must not change
        // which callbacks this pass delivers to.
        let snapshot: Vec<Listener<S>> = self.listeners.iter().map(|(_, cb)| cb.clone()).collect();
        let state = self.state.clone();
        for cb in snapshot {
            invoke_listener(&cb, &state);
        }
    }

    fn newest_snapshot_index(&self) -> usize {
        self.snapshots.last().map_or(0, |s| s.event_index)
    }

    /// Takes a snapshot of the current state at the current log position.
    pub fn create_snapshot(&mut self) -> SnapshotId {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        self.snapshots.push(Snapshot {
            id,
            state: self.state.clone(),
            event_index: self.log.len(),
        });
        SnapshotId(id)
    }

    /// Releases a snapshot early. A no-op if it was already dropped, e.g. by
    /// an [`insert_events`](Self::insert_events) call that invalidated it.
    pub fn dispose_snapshot(&mut self, id: SnapshotId) {
        self.snapshots.retain(|s| s.id != id.0);
    }

    /// Appends `event` at the tail of the log.
    ///
    /// `event` must sort after every event already in the log; violating
    /// this is a caller bug and only checked with `debug_assert!`; callers
    /// that need to place an event elsewhere must use
    /// [`insert_events`](Self::insert_events) instead.
    pub fn dispatch(&mut self, event: Event<P, C>) -> Result<(), EngineError> {
        if let Some(last) = self.log.last() {
            debug_assert!(
                event_cmp(last, &event) == Ordering::Less,
                "dispatch requires the new event to sort after the log's tail"
            );
        }
        let next = (self.reducer)(&self.state, &event).map_err(EngineError::Reducer)?;
        self.state = Arc::new(next);
        self.log.push(event);
        if self.log.len() - self.newest_snapshot_index() >= self.snapshot_interval {
            self.create_snapshot();
        }
        self.notify();
        Ok(())
    }

    /// Folds `events` onto the current state without touching the log.
    ///
    /// Used by a client to optimistically apply its own proposals before the
    /// host has accepted them; the log itself is only ever changed by
    /// `dispatch`, `insert_events`, `remove_event`, and `rebaseline`.
    pub fn replay(&mut self, events: &[Event<P, C>]) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut scratch = self.state.clone();
        for event in events {
            let next = (self.reducer)(&scratch, event).map_err(EngineError::Reducer)?;
            scratch = Arc::new(next);
        }
        self.state = scratch;
        self.notify();
        Ok(())
    }

    /// Splices `events` into the log at their correct sorted position and
    /// re-derives state from there.
    ///
    /// `events` must already be sorted by [`event_cmp`] and disjoint from
    /// every id already in the log; both are caller obligations checked only
    /// with `debug_assert!`. A no-op if `events` is empty.
    ///
    /// The whole operation is atomic: if the reducer rejects any event while
    /// replaying the merged tail, the log, state, and snapshots are left
    /// exactly as they were before the call -- no snapshot is dropped, no
    /// partial state is committed.
    pub fn insert_events(&mut self, events: Vec<Event<P, C>>) -> Result<(), EngineError>
    where
        P: Clone,
        C: Clone,
    {
        if events.is_empty() {
            return Ok(());
        }
        debug_assert!(
            events.windows(2).all(|w| event_cmp(&w[0], &w[1]) != Ordering::Greater),
            "insert_events requires its input sorted by event_cmp"
        );
        debug_assert!(
            events.iter().all(|e| !self.contains_id(&e.id)),
            "insert_events requires ids disjoint from the existing log"
        );

        // Smallest index whose event sorts after the new batch's first
        // event under the full (timestamp, id) comparator; every snapshot at
        // or before it is still valid. Comparing by timestamp alone would
        // place an existing entry that shares a timestamp with `events[0]`
        // but sorts after it by id on the wrong side of the anchor.
        let anchor = self.log.partition_point(|e| event_cmp(e, &events[0]) == Ordering::Less);

        let retained_snapshots: Vec<Snapshot<S>> = self
            .snapshots
            .iter()
            .filter(|s| s.event_index <= anchor)
            .map(Snapshot::cloned)
            .collect();

        let (base_state, base_index) = match retained_snapshots.last() {
            Some(s) => (s.state.clone(), s.event_index),
            None => (self.initial_state.clone(), 0),
        };

        let tail: Vec<Event<P, C>> = self.log[base_index..].to_vec();
        let merged_tail = merge_sorted_by(tail, events, event_cmp);

        let mut scratch = base_state;
        for event in &merged_tail {
            let next = (self.reducer)(&scratch, event).map_err(EngineError::Reducer)?;
            scratch = Arc::new(next);
        }

        // Replay succeeded: commit log, snapshots, and state together.
        self.log.truncate(base_index);
        self.log.extend(merged_tail);
        self.snapshots = retained_snapshots;
        self.state = scratch;
        self.notify();
        Ok(())
    }

    /// Removes the event with the given id, wherever it sits in the log, and
    /// re-derives state from there. A no-op if no event with that id exists.
    ///
    /// Atomic in the same sense as [`insert_events`](Self::insert_events): a
    /// reducer rejection during replay leaves everything untouched.
    pub fn remove_event(&mut self, id: &str) -> Result<(), EngineError>
    where
        P: Clone,
        C: Clone,
    {
        let Some(removed_index) = self.log.iter().position(|e| e.id == id) else {
            return Ok(());
        };

        let retained_snapshots: Vec<Snapshot<S>> = self
            .snapshots
            .iter()
            .filter(|s| s.event_index <= removed_index)
            .map(Snapshot::cloned)
            .collect();

        let (base_state, base_index) = match retained_snapshots.last() {
            Some(s) => (s.state.clone(), s.event_index),
            None => (self.initial_state.clone(), 0),
        };

        let suffix: Vec<Event<P, C>> = self.log[base_index..]
            .iter()
            .filter(|e| e.id != id)
            .cloned()
            .collect();

        let mut scratch = base_state;
        for event in &suffix {
            let next = (self.reducer)(&scratch, event).map_err(EngineError::Reducer)?;
            scratch = Arc::new(next);
        }

        self.log.truncate(base_index);
        self.log.extend(suffix);
        self.snapshots = retained_snapshots;
        self.state = scratch;
        self.notify();
        Ok(())
    }

    /// Discards the entire log and every snapshot, setting `new_state` as
    /// both the initial and current state.
    ///
    /// Used when a client catches up from host history: rather than replay
    /// potentially years of events, the embedder may fold them down itself
    /// and hand the engine the result directly.
    pub fn rebaseline(&mut self, new_state: S) {
        let state = Arc::new(new_state);
        self.initial_state = state.clone();
        self.state = state;
        self.log.clear();
        self.snapshots.clear();
        self.next_snapshot_id = 0;
        self.notify();
    }
}

fn invoke_listener<S>(cb: &Listener<S>, state: &S) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(state)));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        tracing::error!(panic = %message, "collab-engine: subscriber panicked during notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_protocol::Source;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn ev(id: &str, ts: i64, value: i64) -> Event<i64> {
        Event {
            id: id.to_owned(),
            timestamp: ts,
            source: Source::client("t"),
            payload: value,
            context: None,
        }
    }

    fn sum_reducer() -> impl Fn(&i64, &Event<i64>) -> Result<i64, ReducerError> {
        |state, event| Ok(state + event.payload)
    }

    #[test]
    fn dispatch_folds_and_appends() {
        let mut log = EventLog::new(0i64, 100, sum_reducer()).unwrap();
        log.dispatch(ev("a", 1, 10)).unwrap();
        log.dispatch(ev("b", 2, 5)).unwrap();
        assert_eq!(*log.state(), 15);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn dispatch_rejects_without_mutating() {
        let mut log = EventLog::new(0i64, 100, |_s: &i64, e: &Event<i64>| {
            if e.payload < 0 {
                Err(ReducerError::msg("negative payload"))
            } else {
                Ok(*_s + e.payload)
            }
        })
        .unwrap();
        log.dispatch(ev("a", 1, 10)).unwrap();
        let err = log.dispatch(ev("b", 2, -1));
        assert!(err.is_err());
        assert_eq!(*log.state(), 10);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn snapshot_created_automatically_at_interval() {
        let mut log = EventLog::new(0i64, 2, sum_reducer()).unwrap();
        log.dispatch(ev("a", 1, 1)).unwrap();
        assert!(log.snapshots.is_empty());
        log.dispatch(ev("b", 2, 1)).unwrap();
        assert_eq!(log.snapshots.len(), 1);
        assert_eq!(log.snapshots[0].event_index, 2);
    }

    #[test]
    fn insert_events_interleaves_and_rewinds_from_nearest_snapshot() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.dispatch(ev("c", 30, 4)).unwrap();
        assert_eq!(*log.state(), 5);

        log.insert_events(vec![ev("b", 20, 2)]).unwrap();
        assert_eq!(*log.state(), 7);
        let ids: Vec<_> = log.log().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn insert_events_anchors_on_the_full_comparator_not_timestamp_alone() {
        // "z" already sits in the log at timestamp 10; a new event at the
        // same timestamp but a smaller id ("a") must land *before* it, not
        // after -- the anchor has to account for the secondary id key, not
        // just the timestamp.
        let mut log = EventLog::new(0i64, 100, sum_reducer()).unwrap();
        log.dispatch(ev("z", 10, 1)).unwrap();

        log.insert_events(vec![ev("a", 10, 2)]).unwrap();

        let ids: Vec<_> = log.log().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "z"]);
        assert!(log.log().windows(2).all(|w| event_cmp(&w[0], &w[1]) != Ordering::Greater));
    }

    #[test]
    fn insert_events_empty_is_noop() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.insert_events(vec![]).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn insert_events_invalidates_snapshots_after_anchor() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap(); // snapshot at index 1
        log.dispatch(ev("c", 30, 4)).unwrap(); // snapshot at index 2
        assert_eq!(log.snapshots.len(), 2);

        // Inserting before timestamp 30 invalidates the snapshot at index 2
        // but not the one at index 1.
        log.insert_events(vec![ev("b", 20, 2)]).unwrap();
        assert!(log.snapshots.iter().all(|s| s.event_index <= 1));
    }

    #[test]
    fn insert_events_failure_leaves_state_untouched() {
        let mut log = EventLog::new(0i64, 1, |s: &i64, e: &Event<i64>| {
            if e.payload < 0 {
                Err(ReducerError::msg("negative"))
            } else {
                Ok(s + e.payload)
            }
        })
        .unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.dispatch(ev("c", 30, 4)).unwrap();
        let before_state = *log.state();
        let before_len = log.len();

        let result = log.insert_events(vec![ev("b", 20, -99)]);
        assert!(result.is_err());
        assert_eq!(*log.state(), before_state);
        assert_eq!(log.len(), before_len);
        assert!(!log.contains_id("b"));
    }

    #[test]
    fn remove_event_rewinds_and_skips_the_removed_event() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.dispatch(ev("b", 20, 2)).unwrap();
        log.dispatch(ev("c", 30, 4)).unwrap();
        assert_eq!(*log.state(), 7);

        log.remove_event("b").unwrap();
        assert_eq!(*log.state(), 5);
        assert_eq!(log.len(), 2);
        assert!(!log.contains_id("b"));
    }

    #[test]
    fn remove_event_missing_id_is_noop() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.remove_event("nonexistent").unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn rebaseline_clears_log_and_snapshots() {
        let mut log = EventLog::new(0i64, 1, sum_reducer()).unwrap();
        log.dispatch(ev("a", 10, 1)).unwrap();
        log.dispatch(ev("b", 20, 2)).unwrap();
        log.rebaseline(100);
        assert_eq!(*log.state(), 100);
        assert_eq!(log.len(), 0);
        assert!(log.snapshots.is_empty());

        log.rebaseline(100);
        assert_eq!(*log.state(), 100);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn subscribe_fires_immediately_and_on_every_change() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut log = EventLog::new(0i64, 100, sum_reducer()).unwrap();
        let seen2 = seen.clone();
        log.subscribe(move |_state: &i64| {
            seen2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
        log.dispatch(ev("a", 1, 1)).unwrap();
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_future_notifications() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut log = EventLog::new(0i64, 100, sum_reducer()).unwrap();
        let seen2 = seen.clone();
        let id = log.subscribe(move |_state: &i64| {
            seen2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        log.unsubscribe(id);
        log.dispatch(ev("a", 1, 1)).unwrap();
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others_or_propagate() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut log = EventLog::new(0i64, 100, sum_reducer()).unwrap();
        log.subscribe(|_state: &i64| panic!("boom"));
        let seen2 = seen.clone();
        log.subscribe(move |_state: &i64| {
            seen2.fetch_add(1, AtomicOrdering::SeqCst);
        });
        log.dispatch(ev("a", 1, 1)).unwrap();
        // The second listener's priming call plus its post-dispatch call.
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn snapshot_interval_zero_is_rejected() {
        let result = EventLog::new(0i64, 0, sum_reducer());
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    proptest::proptest! {
        #[test]
        fn insert_events_always_leaves_log_sorted(
            base in proptest::collection::vec(1i64..1000, 0..10),
            extra in proptest::collection::vec(1i64..1000, 0..10),
        ) {
            let mut log = EventLog::new(0i64, 3, sum_reducer()).unwrap();
            let mut used_ids = std::collections::HashSet::new();
            let mut next_id = 0u32;
            let mut fresh_id = |used: &mut std::collections::HashSet<String>, counter: &mut u32| {
                loop {
                    let candidate = format!("id-{counter}");
                    *counter += 1;
                    if used.insert(candidate.clone()) {
                        return candidate;
                    }
                }
            };

            let mut base_sorted = base.clone();
            base_sorted.sort_unstable();
            for ts in base_sorted {
                let id = fresh_id(&mut used_ids, &mut next_id);
                log.dispatch(ev(&id, ts, 1)).unwrap();
            }

            let mut extra_sorted = extra.clone();
            extra_sorted.sort_unstable();
            let extra_events: Vec<_> = extra_sorted
                .into_iter()
                .map(|ts| {
                    let id = fresh_id(&mut used_ids, &mut next_id);
                    ev(&id, ts, 1)
                })
                .collect();
            log.insert_events(extra_events).unwrap();

            prop_assert!(log.log().windows(2).all(|w| event_cmp(&w[0], &w[1]) != Ordering::Greater));
        }
    }
}
