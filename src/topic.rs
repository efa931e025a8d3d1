//! The process-construction DSL: `Topic` combinators build up `Process`
//! records without executing anything. An operator-overloaded pipeline
//! (`source | transform | sink`) doesn't translate cleanly to Rust, so this
//! is an explicit builder instead:
//! `topic.subscribe().transform(t).sink(topic.publish())`.

use crate::connection::ListenMode;
use crate::error::TransformError;
use crate::message::{WELL_KNOWN_IN, WELL_KNOWN_OUT};
use crate::transform::{Transform, TransformOutput};
use crate::value::Value;
use std::sync::Arc;

lazy_static::lazy_static! {
    /// The engine's reserved input topic.
    pub static ref IN: Topic = Topic::new(WELL_KNOWN_IN);
    /// The engine's reserved output topic.
    pub static ref OUT: Topic = Topic::new(WELL_KNOWN_OUT);
}

/// A named routing channel. Identity is its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// `t.subscribe()`: a process source that fires on every matching
    /// message.
    pub fn subscribe(&self) -> Source {
        Source {
            topic: self.0.clone(),
            mode: ListenMode::Each,
        }
    }

    /// `t.join()`: a process source that fires once, with every message
    /// published to this topic during the run, once no producer can publish
    /// any more.
    pub fn join(&self) -> Source {
        Source {
            topic: self.0.clone(),
            mode: ListenMode::Join,
        }
    }

    /// `t.publish()`: one message out per transform return value.
    pub fn publish(&self) -> Sink {
        Sink::Publish(self.0.clone())
    }

    /// `t.publish_each()`: the transform must return an array; one message
    /// is published per element.
    pub fn publish_each(&self) -> Sink {
        Sink::PublishEach(self.0.clone())
    }
}

/// A source half of a process: a topic plus the mode it's subscribed with.
#[derive(Debug, Clone)]
pub struct Source {
    topic: String,
    mode: ListenMode,
}

impl Source {
    /// Attaches the transform step, producing a [`Staged`] process awaiting
    /// a sink (or none, if the process is a dead end).
    pub fn transform(self, transform: Arc<dyn Transform>) -> Staged {
        Staged {
            topic: self.topic,
            mode: self.mode,
            transform,
        }
    }
}

/// A source with its transform attached; not yet wired to a sink.
#[derive(Clone)]
pub struct Staged {
    topic: String,
    mode: ListenMode,
    transform: Arc<dyn Transform>,
}

impl Staged {
    /// Attaches the first sink, producing a complete [`Process`]. Call
    /// `.sink(...)` again on the result to chain additional sinks: each
    /// publish in the chain forwards the transform's output unchanged.
    pub fn sink(self, sink: Sink) -> Process {
        Process {
            source_topic: self.topic,
            source_mode: self.mode,
            transform: self.transform,
            sinks: vec![sink],
        }
    }
}

impl From<Staged> for Process {
    /// A `Staged` with no sink attached is a valid process: it consumes and
    /// transforms, but publishes nothing.
    fn from(staged: Staged) -> Self {
        Process {
            source_topic: staged.topic,
            source_mode: staged.mode,
            transform: staged.transform,
            sinks: Vec::new(),
        }
    }
}

/// What a process does with its transform's output.
#[derive(Debug, Clone)]
pub enum Sink {
    /// One message published per transform return value.
    Publish(String),
    /// The transform must return an array; one message per element,
    /// `published_at` strictly increasing.
    PublishEach(String),
}

/// A declarative subscriber -> transform -> publisher pipeline. The engine
/// treats `transform` as opaque; it only interprets `source_topic`,
/// `source_mode`, and `sinks`.
#[derive(Clone)]
pub struct Process {
    pub(crate) source_topic: String,
    pub(crate) source_mode: ListenMode,
    pub(crate) transform: Arc<dyn Transform>,
    pub(crate) sinks: Vec<Sink>,
}

impl Process {
    pub fn source_topic(&self) -> &str {
        &self.source_topic
    }

    pub fn source_mode(&self) -> ListenMode {
        self.source_mode
    }

    pub fn sinks(&self) -> &[Sink] {
        &self.sinks
    }

    /// Chains one more sink onto this process: each sink in the chain
    /// publishes the transform's output unchanged, so
    /// `.sink(OUT.publish()).sink(also.publish())` fans the same value out
    /// to both topics.
    pub fn sink(mut self, sink: Sink) -> Process {
        self.sinks.push(sink);
        self
    }

    /// Runs this process's transform standalone: source and sink are no-ops.
    /// Tests rely on this to exercise a chain's logic without spinning up an
    /// engine.
    pub async fn invoke(&self, input: Value) -> std::result::Result<Value, TransformError> {
        self.transform.call(input.clone(), input).await
    }
}

/// Helper alias so call sites reading transform results don't need to name
/// [`TransformOutput`] directly.
pub type ProcessResult = TransformOutput;
