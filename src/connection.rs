//! The bus: routes published messages to the listeners currently subscribed
//! to their topic, and nothing else.
//!
//! A background-task-free, synchronous routing core backed by
//! `dashmap::DashMap`, a lock-free concurrent map, with per-listener
//! `deadqueue` queues buffering what each listener hasn't consumed yet.

use crate::counter::{DeliveryGuard, RunCounter};
use crate::message::{LogicalClock, Message};
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Delivery mode a listener was installed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Every matching publication is delivered immediately.
    Each,
    /// Matching publications are buffered until the engine explicitly
    /// requests a flush (see [`Connection::flush_join`]); the buffered list
    /// is then delivered exactly once.
    Join,
}

/// Opaque handle to one installed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One item handed to a listener's queue.
#[derive(Debug)]
pub enum Delivery {
    /// A single message, delivered immediately (`Each` mode).
    Each(Message, DeliveryGuard),
    /// The accumulated ordered list of messages published to a `Join`-mode
    /// listener's topic during this run, delivered exactly once.
    Joined(Vec<Message>, DeliveryGuard),
    /// Pushed by a run's teardown so the listener-processing task can exit
    /// cooperatively instead of blocking on its queue forever.
    Shutdown,
}

/// Per-listener delivery queue.
pub type DeliveryQueue = deadqueue::unbounded::Queue<Delivery>;

/// The connection contract any transport (in-memory or otherwise) must
/// satisfy for the engine to drive processes over it.
pub trait Connection: Send + Sync {
    /// Installs a listener for `topic`, filtered to `correlation_id`. Returns
    /// the listener's id and its delivery queue; the caller is expected to
    /// pump the queue on its own task.
    fn subscribe(
        &self,
        topic: &str,
        mode: ListenMode,
        correlation_id: Uuid,
        counter: Arc<RunCounter>,
    ) -> (ListenerId, Arc<DeliveryQueue>);

    /// Routes `message` to every current listener on `message.topic` whose
    /// correlation id matches. Returns promptly; delivery to `Each`-mode
    /// listeners happens via their queue, not synchronously with this call.
    /// A topic with no matching listener silently drops the message.
    fn publish(&self, message: Message);

    /// Removes a listener. Buffered `Join` messages it hadn't yet flushed
    /// are discarded.
    fn disconnect(&self, id: ListenerId);

    /// For a `Join`-mode listener that hasn't fired yet, delivers its
    /// buffered list (possibly empty) exactly once. A no-op for listeners
    /// that are `Each`-mode or have already fired.
    fn flush_join(&self, id: ListenerId);

    /// Snapshot of listener counts per topic, with topics that have none
    /// pruned, so an idle connection reports an empty map. The engine's
    /// teardown checks rely on this to confirm every listener is gone.
    fn listeners(&self) -> std::collections::HashMap<String, usize>;

    /// Next sample from this connection's monotonic logical clock.
    fn next_timestamp(&self) -> u64;
}

struct ListenerEntry {
    id: ListenerId,
    mode: ListenMode,
    correlation_id: Uuid,
    counter: Arc<RunCounter>,
    queue: Arc<DeliveryQueue>,
    join_buffer: Mutex<Vec<Message>>,
    fired: AtomicBool,
}

/// The in-memory [`Connection`] implementation this crate ships: a single
/// process, single connection bus with no persistence.
#[derive(Default)]
pub struct InMemoryConnection {
    next_id: AtomicU64,
    clock: LogicalClock,
    topics: DashMap<String, Vec<ListenerEntry>>,
    listener_topics: DashMap<ListenerId, String>,
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for InMemoryConnection {
    fn subscribe(
        &self,
        topic: &str,
        mode: ListenMode,
        correlation_id: Uuid,
        counter: Arc<RunCounter>,
    ) -> (ListenerId, Arc<DeliveryQueue>) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let queue = Arc::new(DeliveryQueue::new());
        let entry = ListenerEntry {
            id,
            mode,
            correlation_id,
            counter,
            queue: queue.clone(),
            join_buffer: Mutex::new(Vec::new()),
            fired: AtomicBool::new(false),
        };
        self.topics.entry(topic.to_string()).or_default().push(entry);
        self.listener_topics.insert(id, topic.to_string());
        trace!("subscribed listener {id:?} to topic {topic} ({mode:?})");
        (id, queue)
    }

    fn publish(&self, message: Message) {
        let Some(mut entries) = self.topics.get_mut(&message.topic) else {
            trace!("publish to {} has no listeners, dropping", message.topic);
            return;
        };
        for entry in entries.iter() {
            if entry.correlation_id != message.correlation_id {
                continue;
            }
            match entry.mode {
                ListenMode::Each => {
                    let guard = DeliveryGuard::new(entry.counter.clone());
                    entry.queue.push(Delivery::Each(message.clone(), guard));
                }
                ListenMode::Join => {
                    if !entry.fired.load(Ordering::SeqCst) {
                        entry
                            .join_buffer
                            .lock()
                            .expect("join buffer mutex poisoned")
                            .push(message.clone());
                    }
                }
            }
        }
    }

    fn disconnect(&self, id: ListenerId) {
        let Some((_, topic)) = self.listener_topics.remove(&id) else {
            return;
        };
        if let Some(mut entries) = self.topics.get_mut(&topic) {
            entries.retain(|e| e.id != id);
            let now_empty = entries.is_empty();
            drop(entries);
            if now_empty {
                self.topics.remove(&topic);
            }
        }
        debug!("disconnected listener {id:?} from topic {topic}");
    }

    fn flush_join(&self, id: ListenerId) {
        let Some(topic) = self.listener_topics.get(&id).map(|t| t.value().clone()) else {
            return;
        };
        let Some(entries) = self.topics.get(&topic) else {
            return;
        };
        let Some(entry) = entries.iter().find(|e| e.id == id) else {
            return;
        };
        if entry.fired.swap(true, Ordering::SeqCst) {
            return; // fires at most once per run
        }
        let buffered = std::mem::take(
            &mut *entry
                .join_buffer
                .lock()
                .expect("join buffer mutex poisoned"),
        );
        let guard = DeliveryGuard::new(entry.counter.clone());
        entry.queue.push(Delivery::Joined(buffered, guard));
    }

    fn listeners(&self) -> std::collections::HashMap<String, usize> {
        self.topics
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| (e.key().clone(), e.value().len()))
            .collect()
    }

    fn next_timestamp(&self) -> u64 {
        self.clock.next()
    }
}

impl std::fmt::Debug for InMemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConnection")
            .field("listeners", &self.listeners())
            .finish()
    }
}
