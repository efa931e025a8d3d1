//! The execution engine: attaches listeners for a set of processes, drives
//! them to quiescence against one input, and returns the first value
//! observed on `__out__`.

use crate::connection::{Connection, Delivery, DeliveryQueue, ListenMode, ListenerId};
use crate::counter::{RunCounter, MAX_RUN_STEPS};
use crate::error::{Error, Result, TransformError};
use crate::message::{Message, WELL_KNOWN_IN, WELL_KNOWN_OUT};
use crate::topic::{Process, Sink};
use crate::transform::{async_transform, Transform};
use crate::value::Value;
use log::{debug, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Semaphore};
use uuid::Uuid;

/// Upper bound on transform invocations this engine runs concurrently,
/// across every run it drives: a bounded worker pool rather than one
/// unbounded task per listener. Chosen generously above anything this
/// crate's own tests exercise (the 100-process chain still has only one
/// transform runnable at a time per run).
const MAX_CONCURRENT_TRANSFORMS: usize = 64;

/// Shared sink for every message this run publishes, used only by
/// [`PubSub::stream`]; `None` for `invoke`/`batch` so they pay no tracing
/// overhead. Cleared by the run's driver task once it finishes, so a
/// transform that is still running past teardown can't leak a trace item.
type TraceHandle = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

fn emit(connection: &Arc<dyn Connection>, trace: &TraceHandle, message: Message) {
    if let Some(tx) = trace.lock().expect("trace mutex poisoned").as_ref() {
        let _ = tx.send(message.clone());
    }
    connection.publish(message);
}

/// Tears down every listener a run installed, on every exit path: normal
/// completion, error, or early abandonment (the task this guard lives in
/// being aborted, e.g. when a [`MessageStream`] consumer stops polling).
/// Ties the listeners' lifetime to this guard's `Drop` so every exit path
/// goes through the same cleanup.
struct ListenerGuard {
    connection: Arc<dyn Connection>,
    entries: Vec<(ListenerId, Arc<DeliveryQueue>)>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        for (id, queue) in self.entries.drain(..) {
            // Wakes the listener-processing task out of its queue wait so it
            // exits cooperatively instead of leaking forever; the transform
            // it may be mid-execution of is *not* forcibly cancelled here.
            queue.push(Delivery::Shutdown);
            self.connection.disconnect(id);
        }
    }
}

/// Owns a set of processes and a connection. Construct with [`PubSub::new`]
/// and drive it with [`PubSub::invoke`], [`PubSub::batch`], or
/// [`PubSub::stream`].
pub struct PubSub {
    processes: Vec<Process>,
    connection: Arc<dyn Connection>,
    /// Bounds concurrent transform execution across every run this engine
    /// drives; shared by every `invoke` so a `batch` of many concurrent
    /// runs still respects one engine-wide limit rather than each run
    /// getting its own.
    transform_semaphore: Arc<Semaphore>,
}

impl PubSub {
    pub fn new<I, P>(processes: I, connection: Arc<dyn Connection>) -> Arc<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<Process>,
    {
        Arc::new(Self {
            processes: processes.into_iter().map(Into::into).collect(),
            connection,
            transform_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFORMS)),
        })
    }

    /// Publishes `input` to `__in__` under a fresh correlation id, waits for
    /// the first `__out__` publication for that run or for quiescence
    /// (whichever happens first), then tears down every listener the run
    /// installed. Returns `Ok(None)` if the run quiesced without ever
    /// publishing to `__out__`; that is not an error.
    pub async fn invoke(&self, input: Value) -> Result<Option<Value>> {
        self.run_core(input, Arc::new(Mutex::new(None))).await
    }

    /// Runs one logical `invoke` per input, concurrently, returning results
    /// in input order. Each invocation mints its own correlation id and the
    /// bus filters strictly by correlation id, so concurrent runs cannot
    /// cross-contaminate results even when the same connection is shared.
    pub async fn batch(&self, inputs: Vec<Value>) -> Vec<Result<Option<Value>>> {
        let invocations = inputs.into_iter().map(|input| self.invoke(input));
        futures::future::join_all(invocations).await
    }

    /// Same scheduling as `invoke`, but yields every message observed on the
    /// bus for this run, in publication order, including the initial
    /// `__in__` message and the terminating `__out__` message. Dropping the
    /// returned stream before it ends tears the run's listeners down the
    /// same way `invoke` does on early return.
    pub fn stream(self: &Arc<Self>, input: Value) -> MessageStream {
        let (trace_tx, rx) = mpsc::unbounded_channel();
        let trace: TraceHandle = Arc::new(Mutex::new(Some(trace_tx)));
        let (result_tx, result_rx) = oneshot::channel();
        let engine = self.clone();
        let driver_trace = trace.clone();
        let driver = tokio::spawn(async move {
            let result = engine.run_core(input, driver_trace.clone()).await;
            // Stop tracing before announcing completion: any sink publish
            // from a transform that's still finishing after teardown must
            // not show up as a further stream item.
            *driver_trace.lock().expect("trace mutex poisoned") = None;
            let _ = result_tx.send(result);
        });
        MessageStream {
            rx,
            result_rx: Some(result_rx),
            final_error_emitted: false,
            _driver: driver,
        }
    }

    /// Returns a transform that, when used inside another engine sharing
    /// this connection, invokes *this* engine once per element of a
    /// list-valued message and returns the list of results. This is the
    /// nesting mechanism: each inner `invoke` mints its own correlation id,
    /// so nested and outer runs never cross-contaminate even though they
    /// share the bus.
    pub fn map(self: &Arc<Self>) -> Arc<dyn Transform> {
        let engine = self.clone();
        async_transform(move |input, _correlation_value| {
            let engine = engine.clone();
            async move {
                let items = match input {
                    Value::Array(items) => items,
                    other => {
                        return Err(
                            format!("map() requires a list-valued input, got {other}").into(),
                        )
                    }
                };
                let invocations = items.into_iter().map(|item| {
                    let engine = engine.clone();
                    async move { engine.invoke(item).await }
                });
                let results = futures::future::try_join_all(invocations)
                    .await
                    .map_err(|e| Box::new(e) as TransformError)?;
                let values: Vec<Value> = results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect();
                Ok(Value::Array(values))
            }
        })
    }

    async fn run_core(&self, input: Value, trace: TraceHandle) -> Result<Option<Value>> {
        let correlation_id = Uuid::new_v4();
        // The run's own input, copied unchanged onto every downstream
        // message; kept independent of any particular message's
        // `correlation_value` so a `.join()` that fires with zero buffered
        // messages (a legitimate, reachable state) still hands its
        // transform the real run input instead of deriving one from an
        // empty list.
        let run_correlation_value = input.clone();
        let counter = Arc::new(RunCounter::new());
        let (out_tx, mut out_rx) = oneshot::channel::<Value>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<Error>();

        let mut guard_entries = Vec::with_capacity(self.processes.len() + 1);
        let mut join_ids: VecDeque<ListenerId> = VecDeque::new();

        // Output interception: the engine's own internal listener on
        // `__out__`. The first delivery it receives completes `out_tx`;
        // every later one (a second process also publishing to `__out__`)
        // is observed only by `stream` via tracing, not returned by `invoke`.
        {
            let (id, queue) =
                self.connection
                    .subscribe(WELL_KNOWN_OUT, ListenMode::Each, correlation_id, counter.clone());
            guard_entries.push((id, queue.clone()));
            let out_tx = Mutex::new(Some(out_tx));
            tokio::spawn(async move {
                loop {
                    match queue.pop().await {
                        Delivery::Shutdown => break,
                        Delivery::Each(msg, _guard) => {
                            if let Some(tx) = out_tx.lock().expect("out_tx mutex poisoned").take() {
                                let _ = tx.send(msg.value);
                            }
                        }
                        Delivery::Joined(..) => {
                            unreachable!("__out__ is always subscribed in Each mode")
                        }
                    }
                }
            });
        }

        for process in &self.processes {
            let (id, queue) = self.connection.subscribe(
                &process.source_topic,
                process.source_mode,
                correlation_id,
                counter.clone(),
            );
            guard_entries.push((id, queue.clone()));
            if process.source_mode == ListenMode::Join {
                join_ids.push_back(id);
            }
            tokio::spawn(Self::run_listener(
                queue,
                self.connection.clone(),
                process.clone(),
                correlation_id,
                run_correlation_value.clone(),
                counter.clone(),
                error_tx.clone(),
                trace.clone(),
                self.transform_semaphore.clone(),
            ));
        }

        let guard = ListenerGuard {
            connection: self.connection.clone(),
            entries: guard_entries,
        };

        emit(
            &self.connection,
            &trace,
            Message {
                topic: WELL_KNOWN_IN.to_string(),
                value: input.clone(),
                published_at: self.connection.next_timestamp(),
                correlation_id,
                correlation_value: input,
            },
        );

        let result = Self::drive(&self.connection, &counter, &mut out_rx, &mut error_rx, join_ids).await;
        drop(guard);
        result
    }

    /// The quiescence loop. Waits for either the first `__out__` value or
    /// global quiescence (`counter.outstanding() == 0`); on quiescence,
    /// flushes one not-yet-fired join listener at a time and loops until
    /// either an `__out__` value appears or no join listener remains to
    /// flush. Dependency ordering falls out of re-checking quiescence
    /// between each flush rather than flushing every joiner in one pass.
    async fn drive(
        connection: &Arc<dyn Connection>,
        counter: &Arc<RunCounter>,
        out_rx: &mut oneshot::Receiver<Value>,
        error_rx: &mut mpsc::UnboundedReceiver<Error>,
        mut join_ids: VecDeque<ListenerId>,
    ) -> Result<Option<Value>> {
        loop {
            let notified = counter.notified();

            if let Ok(value) = out_rx.try_recv() {
                return Ok(Some(value));
            }
            if let Ok(err) = error_rx.try_recv() {
                return Err(err);
            }
            if counter.outstanding() == 0 {
                if let Some(id) = join_ids.pop_front() {
                    connection.flush_join(id);
                    continue;
                }
                return Ok(None);
            }

            tokio::select! {
                biased;
                res = &mut *out_rx => return Ok(res.ok()),
                Some(err) = error_rx.recv() => return Err(err),
                _ = notified => {}
            }
        }
    }

    async fn run_listener(
        queue: Arc<DeliveryQueue>,
        connection: Arc<dyn Connection>,
        process: Process,
        run_correlation_id: Uuid,
        run_correlation_value: Value,
        counter: Arc<RunCounter>,
        error_tx: mpsc::UnboundedSender<Error>,
        trace: TraceHandle,
        semaphore: Arc<Semaphore>,
    ) {
        loop {
            match queue.pop().await {
                Delivery::Shutdown => break,
                Delivery::Each(msg, _guard) => {
                    Self::handle_delivery(
                        &connection,
                        &process,
                        msg.value,
                        msg.correlation_value,
                        msg.correlation_id,
                        &counter,
                        &error_tx,
                        &trace,
                        &semaphore,
                    )
                    .await;
                }
                Delivery::Joined(messages, _guard) => {
                    // Use the run's own input, not anything derived from
                    // `messages`: a join that fires with an empty buffered
                    // list (a legitimate reachable state) still needs the
                    // real `correlation_value`, not a fallback null.
                    let values = Value::Array(messages.into_iter().map(|m| m.value).collect());
                    Self::handle_delivery(
                        &connection,
                        &process,
                        values,
                        run_correlation_value.clone(),
                        run_correlation_id,
                        &counter,
                        &error_tx,
                        &trace,
                        &semaphore,
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_delivery(
        connection: &Arc<dyn Connection>,
        process: &Process,
        input: Value,
        correlation_value: Value,
        correlation_id: Uuid,
        counter: &Arc<RunCounter>,
        error_tx: &mpsc::UnboundedSender<Error>,
        trace: &TraceHandle,
        semaphore: &Arc<Semaphore>,
    ) {
        let steps = counter.record_step();
        if steps > MAX_RUN_STEPS {
            warn!("run {correlation_id} exceeded {MAX_RUN_STEPS} steps, assuming a process cycle");
            let _ = error_tx.send(Error::CycleOverflow(MAX_RUN_STEPS as usize));
            return;
        }

        let transform_result = {
            let _permit = semaphore
                .acquire()
                .await
                .expect("transform semaphore is never closed");
            process.transform.call(input, correlation_value.clone()).await
        };
        let output = match transform_result {
            Ok(output) => output,
            Err(e) => {
                let _ = error_tx.send(Error::TransformFailure(e.to_string()));
                return;
            }
        };

        for sink in process.sinks() {
            match sink {
                Sink::Publish(topic) => {
                    emit(
                        connection,
                        trace,
                        Message {
                            topic: topic.clone(),
                            value: output.clone(),
                            published_at: connection.next_timestamp(),
                            correlation_id,
                            correlation_value: correlation_value.clone(),
                        },
                    );
                }
                Sink::PublishEach(topic) => match &output {
                    Value::Array(items) => {
                        for item in items {
                            emit(
                                connection,
                                trace,
                                Message {
                                    topic: topic.clone(),
                                    value: item.clone(),
                                    published_at: connection.next_timestamp(),
                                    correlation_id,
                                    correlation_value: correlation_value.clone(),
                                },
                            );
                        }
                    }
                    other => {
                        debug!("publish_each({topic}) requires an array, got {other}");
                        let _ = error_tx.send(Error::TransformFailure(format!(
                            "publish_each({topic}) requires the transform to return an array, got {other}"
                        )));
                    }
                },
            }
        }
    }
}

/// A lazy sequence of every message a [`PubSub::stream`] run produces, in
/// publication order. Ends when the run reaches quiescence or publishes to
/// `__out__`; if the run failed, the final item is that `Err`.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
    result_rx: Option<oneshot::Receiver<Result<Option<Value>>>>,
    final_error_emitted: bool,
    _driver: tokio::task::JoinHandle<()>,
}

impl futures::Stream for MessageStream {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(None) => {
                if !this.final_error_emitted {
                    this.final_error_emitted = true;
                    if let Some(mut result_rx) = this.result_rx.take() {
                        if let Ok(Err(e)) = result_rx.try_recv() {
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        // Abandoning the stream mid-run aborts the task driving it; the
        // `ListenerGuard` alive in that task's stack unwinds and tears down
        // the run's listeners the same way a normal return would.
        self._driver.abort();
    }
}
