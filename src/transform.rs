//! The opaque transform a process applies to its input.
//!
//! The engine never inspects a transform's body, it only calls it and
//! awaits the result: an `Fn` returning a `Result` whose error side is a
//! boxed `std::error::Error`.

use crate::error::TransformError;
use crate::value::Value;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a transform returns on success.
pub type TransformOutput = std::result::Result<Value, TransformError>;
/// The future a transform's invocation returns.
pub type TransformFuture = BoxFuture<'static, TransformOutput>;

/// A process's transform step. The engine treats implementors as opaque:
/// call it with the process's current input and the run's original
/// `correlation_value`, await the result, apply the process's sinks to it.
pub trait Transform: Send + Sync {
    fn call(&self, input: Value, correlation_value: Value) -> TransformFuture;
}

struct SyncTransform<F>(F);

impl<F> Transform for SyncTransform<F>
where
    F: Fn(Value, Value) -> TransformOutput + Send + Sync + 'static,
{
    fn call(&self, input: Value, correlation_value: Value) -> TransformFuture {
        Box::pin(std::future::ready((self.0)(input, correlation_value)))
    }
}

/// Wraps an ordinary synchronous function as a [`Transform`]. Most simple
/// processes (`add_one`, `sum`, `sorted`, ...) are this shape.
pub fn sync_transform<F>(f: F) -> Arc<dyn Transform>
where
    F: Fn(Value, Value) -> TransformOutput + Send + Sync + 'static,
{
    Arc::new(SyncTransform(f))
}

/// Convenience for a sync transform that only looks at its input, ignoring
/// the run's `correlation_value`.
pub fn sync_transform_fn<F>(f: F) -> Arc<dyn Transform>
where
    F: Fn(Value) -> TransformOutput + Send + Sync + 'static,
{
    sync_transform(move |input, _correlation_value| f(input))
}

struct AsyncTransform<F>(F);

impl<F, Fut> Transform for AsyncTransform<F>
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TransformOutput> + Send + 'static,
{
    fn call(&self, input: Value, correlation_value: Value) -> TransformFuture {
        Box::pin((self.0)(input, correlation_value))
    }
}

/// Wraps a genuinely asynchronous function as a [`Transform`]. This is how a
/// transform may itself `.await` a nested [`crate::engine::PubSub::invoke`]
/// without blocking a worker thread (spec.md §4.4's "must tolerate arbitrary
/// transform latency").
pub fn async_transform<F, Fut>(f: F) -> Arc<dyn Transform>
where
    F: Fn(Value, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TransformOutput> + Send + 'static,
{
    Arc::new(AsyncTransform(f))
}

/// One entry of a mapping-valued transform (spec.md §4.2): a transform may
/// return `{k: v}` where any `v` is itself evaluated against the process's
/// current input, rather than being a literal value.
#[derive(Clone)]
pub enum MappingValue {
    /// Evaluate this sub-transform against the current input.
    Transform(Arc<dyn Transform>),
    /// `Topic.IN.current()` — the run's original `correlation_value`,
    /// independent of which topic's message triggered this process.
    CurrentInput,
    /// A nested mapping, evaluated the same way.
    Mapping(BTreeMap<String, MappingValue>),
}

/// Builds a [`MappingValue::CurrentInput`] — the Rust spelling of
/// `Topic.IN.current()`.
pub fn current_input() -> MappingValue {
    MappingValue::CurrentInput
}

/// A transform whose output is a map built by evaluating each entry against
/// the process's current input, rather than a single computed value. Lets a
/// process "include the original input alongside the computed one."
pub struct MappingTransform(BTreeMap<String, MappingValue>);

impl MappingTransform {
    pub fn new(entries: impl IntoIterator<Item = (impl Into<String>, MappingValue)>) -> Arc<dyn Transform> {
        Arc::new(Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }

    fn eval(value: MappingValue, input: Value, correlation_value: Value) -> TransformFuture {
        match value {
            MappingValue::Transform(t) => t.call(input, correlation_value),
            MappingValue::CurrentInput => Box::pin(std::future::ready(Ok(correlation_value))),
            MappingValue::Mapping(m) => Self(m).call(input, correlation_value),
        }
    }
}

impl Transform for MappingTransform {
    fn call(&self, input: Value, correlation_value: Value) -> TransformFuture {
        let entries: Vec<(String, MappingValue)> = self.0.clone().into_iter().collect();
        Box::pin(async move {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, value) in entries {
                let evaluated =
                    MappingTransform::eval(value, input.clone(), correlation_value.clone()).await?;
                out.insert(key, evaluated);
            }
            Ok(Value::Object(out))
        })
    }
}
