//! In-flight run tracking and per-subscriber event delivery.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{KestrelError, Result};

use super::events::{AgentEvent, AgentEventPayload};

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<AgentEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivery state of one run: sequence counter and its own subscribers.
struct RunChannel {
    next_seq: u64,
    closed: bool,
    subscribers: Vec<Subscriber>,
}

impl RunChannel {
    /// Release every queue so receivers end after draining.
    fn close(&mut self) {
        self.closed = true;
        self.subscribers.clear();
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    channel: Arc<Mutex<RunChannel>>,
}

/// Runs by request id, plus subscribers waiting for a run that has not
/// registered yet. Lock order is this map first, then a run's channel.
#[derive(Default)]
struct RegistryState {
    runs: HashMap<String, ActiveRun>,
    pending: HashMap<String, Vec<Subscriber>>,
}

impl RegistryState {
    fn remove_subscriber(&mut self, request_id: &str, id: u64) -> bool {
        if let Some(run) = self.runs.get(request_id) {
            let mut channel = lock(&run.channel);
            let before = channel.subscribers.len();
            channel.subscribers.retain(|s| s.id != id);
            if channel.subscribers.len() != before {
                return true;
            }
        }
        let Some(list) = self.pending.get_mut(request_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.pending.remove(request_id);
        }
        removed
    }
}

/// Maps request ids to active runs and their subscribers.
#[derive(Default)]
pub struct RunRegistry {
    state: Arc<Mutex<RegistryState>>,
    next_subscriber: AtomicU64,
}

/// What a newly registered run owns.
#[derive(Debug)]
pub struct RunSlot {
    pub request_id: String,
    pub cancel: CancellationToken,
    pub emitter: RunEventEmitter,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `request_id` for a new run. Subscribers waiting on the id move
    /// into the run's own channel.
    pub fn register(&self, request_id: &str) -> Result<RunSlot> {
        let mut state = lock(&self.state);
        if state.runs.contains_key(request_id) {
            return Err(KestrelError::DuplicateRun(request_id.to_string()));
        }
        let cancel = CancellationToken::new();
        let channel = Arc::new(Mutex::new(RunChannel {
            next_seq: 1,
            closed: false,
            subscribers: state.pending.remove(request_id).unwrap_or_default(),
        }));
        state.runs.insert(
            request_id.to_string(),
            ActiveRun {
                cancel: cancel.clone(),
                channel: channel.clone(),
            },
        );
        debug!(request_id, "run registered");
        Ok(RunSlot {
            request_id: request_id.to_string(),
            cancel,
            emitter: RunEventEmitter {
                request_id: request_id.to_string(),
                channel,
                registry: Arc::downgrade(&self.state),
            },
        })
    }

    /// Remove a run without a terminal event and close its subscriber queues.
    pub fn finish(&self, request_id: &str) -> bool {
        let removed = lock(&self.state).runs.remove(request_id);
        match removed {
            Some(run) => {
                lock(&run.channel).close();
                debug!(request_id, "run finished");
                true
            }
            None => false,
        }
    }

    /// Cancel an active run.
    pub fn abort(&self, request_id: &str) -> Result<()> {
        let state = lock(&self.state);
        let run = state
            .runs
            .get(request_id)
            .ok_or_else(|| KestrelError::RunNotFound(request_id.to_string()))?;
        run.cancel.cancel();
        debug!(request_id, "run abort requested");
        Ok(())
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        lock(&self.state).runs.contains_key(request_id)
    }

    /// Ids of the active runs, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state).runs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Open a dedicated queue for `request_id`'s events.
    ///
    /// An active run delivers from its next event on. Otherwise the queue
    /// waits for the next run registered under the id.
    pub fn subscribe(&self, request_id: &str) -> EventSubscription {
        let (subscriber, subscription) = self.new_subscriber(request_id);
        let mut state = lock(&self.state);
        match state.runs.get(request_id) {
            Some(run) => lock(&run.channel).subscribers.push(subscriber),
            None => state
                .pending
                .entry(request_id.to_string())
                .or_default()
                .push(subscriber),
        }
        subscription
    }

    /// Like [`subscribe`](Self::subscribe), but only for a run that is active
    /// now. Fails with [`KestrelError::RunNotFound`] otherwise.
    pub fn subscribe_active(&self, request_id: &str) -> Result<EventSubscription> {
        let (subscriber, subscription) = self.new_subscriber(request_id);
        let state = lock(&self.state);
        let run = state
            .runs
            .get(request_id)
            .ok_or_else(|| KestrelError::RunNotFound(request_id.to_string()))?;
        lock(&run.channel).subscribers.push(subscriber);
        Ok(subscription)
    }

    /// Remove one subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, request_id: &str, subscriber_id: u64) -> bool {
        lock(&self.state).remove_subscriber(request_id, subscriber_id)
    }

    fn new_subscriber(&self, request_id: &str) -> (Subscriber, EventSubscription) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = EventSubscription {
            request_id: request_id.to_string(),
            id,
            rx,
            registry: Arc::downgrade(&self.state),
        };
        (Subscriber { id, tx }, subscription)
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("active_runs", &self.active_runs())
            .finish_non_exhaustive()
    }
}

/// Assigns sequence numbers and fans events out to one run's subscribers.
///
/// A terminal event releases the run's id and closes its queues in the same
/// critical section, so a run registered later under the same id never shares
/// subscribers or ordering with this one. Later emits are dropped.
#[derive(Clone)]
pub struct RunEventEmitter {
    request_id: String,
    channel: Arc<Mutex<RunChannel>>,
    registry: Weak<Mutex<RegistryState>>,
}

impl RunEventEmitter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Emit `payload`. Returns the assigned sequence number, or `None` after a terminal event.
    pub fn emit(&self, payload: AgentEventPayload) -> Option<u64> {
        if !payload.is_terminal() {
            return self.deliver(&mut lock(&self.channel), payload);
        }

        let registry = self.registry.upgrade();
        let mut state = registry.as_deref().map(lock);
        let mut channel = lock(&self.channel);
        if let Some(state) = state.as_mut() {
            let owned = state
                .runs
                .get(&self.request_id)
                .is_some_and(|run| Arc::ptr_eq(&run.channel, &self.channel));
            if owned {
                state.runs.remove(&self.request_id);
                debug!(request_id = %self.request_id, "run finished");
            }
        }
        let seq = self.deliver(&mut channel, payload);
        channel.close();
        seq
    }

    fn deliver(&self, channel: &mut RunChannel, payload: AgentEventPayload) -> Option<u64> {
        if channel.closed {
            trace!(request_id = %self.request_id, kind = payload.kind(), "dropping event after terminal");
            return None;
        }
        let seq = channel.next_seq;
        channel.next_seq += 1;
        let event = AgentEvent {
            request_id: self.request_id.clone(),
            seq,
            timestamp: chrono::Utc::now(),
            payload,
        };
        trace!(request_id = %self.request_id, seq, kind = event.kind(), "emit");
        channel.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        Some(seq)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.channel).closed
    }
}

impl std::fmt::Debug for RunEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventEmitter")
            .field("request_id", &self.request_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One subscriber's ordered event queue. Dropping it unsubscribes.
pub struct EventSubscription {
    request_id: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    registry: Weak<Mutex<RegistryState>>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next event, or `None` once the run's terminal event has been drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventSubscription {
    type Item = AgentEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AgentEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove_subscriber(&self.request_id, self.id);
        }
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("request_id", &self.request_id)
            .field("id", &self.id)
            .finish()
    }
}
