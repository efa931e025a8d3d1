//! The unit of transport on the bus.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Reserved topic name the engine publishes the run's input to.
pub const WELL_KNOWN_IN: &str = "__in__";
/// Reserved topic name the engine watches for a run's result.
pub const WELL_KNOWN_OUT: &str = "__out__";

/// One message published to a topic.
///
/// `(correlation_id, correlation_value)` is copied unchanged from the
/// triggering `__in__` message onto every downstream message produced within
/// the same run. That is how a process that only sees a message on some
/// intermediate topic can still recover "the value that started this run"
/// via [`crate::transform::current_input`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub value: Value,
    /// A connection-wide logical clock sample, not a wall-clock timestamp.
    /// Strictly increasing across every message this connection ever routes,
    /// which is stronger than "monotonic within a run" alone, and avoids
    /// wall-clock resolution ties between messages a single `publish_each`
    /// emits back to back.
    pub published_at: u64,
    pub correlation_id: Uuid,
    pub correlation_value: Value,
}

/// Monotonic source for [`Message::published_at`]. Shared by a connection
/// across every run it hosts.
#[derive(Debug, Default)]
pub struct LogicalClock(AtomicU64);

impl LogicalClock {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
