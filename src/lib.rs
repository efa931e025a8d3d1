//! An in-memory, topic-based publish/subscribe dataflow runtime.
//!
//! Processes declare the topic they listen on, a transform, and the
//! topic(s) they publish their transform's result to; [`PubSub`] wires a set
//! of processes to a [`Connection`] and drives them against one input at a
//! time until the run quiesces or a process publishes to the engine's
//! reserved `__out__` topic.
//!
//! ```ignore
//! use dataflow_bus::{sync_transform_fn, Connection, InMemoryConnection, PubSub, Topic, Value};
//! use std::sync::Arc;
//!
//! let numbers = Topic::new("numbers");
//! let doubled = Topic::new("doubled");
//! let process = numbers
//!     .subscribe()
//!     .transform(sync_transform_fn(|v| Ok(Value::from(v.as_i64().unwrap_or(0) * 2))))
//!     .sink(doubled.publish());
//!
//! # async fn run() {
//! let connection: Arc<dyn Connection> = Arc::new(InMemoryConnection::new());
//! let engine = PubSub::new(vec![process], connection);
//! assert_eq!(engine.invoke(Value::from(21)).await.unwrap(), None);
//! # }
//! ```

pub mod connection;
pub mod counter;
pub mod engine;
pub mod error;
pub mod message;
pub mod topic;
pub mod transform;
pub mod value;

pub use connection::{Connection, Delivery, DeliveryQueue, InMemoryConnection, ListenMode, ListenerId};
pub use engine::{MessageStream, PubSub};
pub use error::{Error, Result, TransformError};
pub use message::{Message, WELL_KNOWN_IN, WELL_KNOWN_OUT};
pub use topic::{Process, ProcessResult, Sink, Source, Staged, Topic, IN, OUT};
pub use transform::{
    async_transform, current_input, sync_transform, sync_transform_fn, MappingTransform,
    MappingValue, Transform, TransformFuture, TransformOutput,
};
pub use value::Value;
