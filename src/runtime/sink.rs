//! Reply and stream sinks with resolve-exactly-once discipline
//!
//! A query caller does not block a thread: it hands a [`ReplySink`] to the
//! stub and awaits the paired [`Reply`]. The sink may be cloned into a
//! service so it can complete later, but only the first resolution is
//! delivered; later attempts are counted and logged.
//!
//! Streams stamp each event with a sequence number and consumers reassemble
//! through a [`Reorder`] buffer, so completions that race at the transport
//! layer are still observed in publisher order.

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::error::{DispatchError, DispatchResult};
use super::message::Value;

/// An item tagged with its publisher-side sequence number
#[derive(Debug)]
pub(crate) struct Sequenced<T> {
    pub(crate) seq: u64,
    pub(crate) item: T,
}

/// Reassembles sequence-numbered items into publisher order
#[derive(Debug)]
pub(crate) struct Reorder<T> {
    next: u64,
    buffer: BTreeMap<u64, T>,
}

impl<T> Reorder<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            buffer: BTreeMap::new(),
        }
    }

    /// Buffer an item; duplicates of already-released sequence numbers are dropped
    pub(crate) fn push(&mut self, seq: u64, item: T) {
        if seq >= self.next {
            self.buffer.entry(seq).or_insert(item);
        }
    }

    /// Release the next in-order item, if it has arrived
    pub(crate) fn pop(&mut self) -> Option<T> {
        let item = self.buffer.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Number of items waiting for a gap to fill
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

enum ReplyTarget {
    Channel(oneshot::Sender<DispatchResult<Value>>),
    Stream(StreamSink),
    Detached,
}

struct ReplyState {
    target: Mutex<Option<ReplyTarget>>,
    attempts: AtomicUsize,
    label: String,
}

/// Single-shot result sink for query-shaped calls
#[derive(Clone)]
pub struct ReplySink {
    state: Arc<ReplyState>,
}

impl ReplySink {
    fn with_target(label: impl Into<String>, target: ReplyTarget) -> Self {
        Self {
            state: Arc::new(ReplyState {
                target: Mutex::new(Some(target)),
                attempts: AtomicUsize::new(0),
                label: label.into(),
            }),
        }
    }

    /// Create a sink and the future its caller awaits
    pub fn channel(target: impl Into<String>) -> (ReplySink, Reply) {
        let target = target.into();
        let (tx, rx) = oneshot::channel();
        let sink = Self::with_target(target.clone(), ReplyTarget::Channel(tx));
        let reply = Reply {
            rx,
            target,
            timeout: None,
        };
        (sink, reply)
    }

    /// A sink nobody awaits; failures are logged
    pub fn detached(label: impl Into<String>) -> ReplySink {
        Self::with_target(label, ReplyTarget::Detached)
    }

    /// A sink that forwards its single value into a stream and completes it
    pub(crate) fn into_stream(sink: StreamSink) -> ReplySink {
        let label = sink.label().to_string();
        Self::with_target(label, ReplyTarget::Stream(sink))
    }

    /// Resolve successfully
    pub fn ok(&self, value: Value) -> bool {
        self.complete(Ok(value))
    }

    /// Serialize and resolve successfully
    pub fn ok_serialize<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.ok(value),
            Err(err) => self.fail(DispatchError::Service(format!(
                "result serialization failed: {err}"
            ))),
        }
    }

    /// Resolve with a failure
    pub fn fail(&self, err: DispatchError) -> bool {
        self.complete(Err(err))
    }

    /// Resolve with `result`; returns false if the sink was already resolved
    pub fn complete(&self, result: DispatchResult<Value>) -> bool {
        self.state.attempts.fetch_add(1, Ordering::AcqRel);
        let target = self.state.target.lock().take();
        match target {
            Some(ReplyTarget::Channel(tx)) => {
                // Receiver may have given up (timeout); that is not an error here.
                let _ = tx.send(result);
                true
            }
            Some(ReplyTarget::Stream(stream)) => {
                match result {
                    Ok(value) => {
                        stream.next(value);
                        stream.complete();
                    }
                    Err(err) => {
                        stream.fail(err);
                    }
                }
                true
            }
            Some(ReplyTarget::Detached) => {
                if let Err(err) = result {
                    tracing::warn!(target_label = %self.state.label, error = %err, "detached reply failed");
                }
                true
            }
            None => {
                tracing::warn!(target_label = %self.state.label, "reply resolved more than once; ignoring");
                false
            }
        }
    }

    /// Whether a result has been delivered
    pub fn is_resolved(&self) -> bool {
        self.state.target.lock().is_none()
    }

    /// How many times resolution was attempted (1 for a well-behaved sink)
    pub fn resolve_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySink")
            .field("target", &self.state.label)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Caller-side future for a query result
///
/// Resolves to `ServiceClosed` if the sink is dropped unresolved, so a caller
/// never hangs on a stub that discarded its message.
pub struct Reply {
    rx: oneshot::Receiver<DispatchResult<Value>>,
    target: String,
    timeout: Option<Duration>,
}

impl Reply {
    /// Bound the wait; elapsing yields `DispatchError::Timeout`
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Await the reply, honoring the configured timeout
    pub async fn wait(self) -> DispatchResult<Value> {
        match self.timeout {
            Some(timeout) => {
                let target = self.target.clone();
                tokio::time::timeout(timeout, self)
                    .await
                    .unwrap_or_else(|_| Err(DispatchError::Timeout(target)))
            }
            None => self.await,
        }
    }

    /// Await the reply and deserialize it
    pub async fn typed<T: DeserializeOwned>(self) -> DispatchResult<T> {
        let target = self.target.clone();
        let value = self.wait().await?;
        serde_json::from_value(value).map_err(|err| {
            DispatchError::Service(format!("unexpected reply from '{target}': {err}"))
        })
    }
}

impl Future for Reply {
    type Output = DispatchResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::ServiceClosed(this.target.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Stream event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One value
    Next(Value),
    /// Normal end of stream
    Complete,
    /// Terminal failure
    Fail(DispatchError),
}

struct StreamState {
    next_seq: u64,
    done: bool,
}

struct StreamShared {
    tx: mpsc::UnboundedSender<Sequenced<StreamEvent>>,
    state: Mutex<StreamState>,
    label: String,
}

/// Publisher side of a multi-value stream
#[derive(Clone)]
pub struct StreamSink {
    shared: Arc<StreamShared>,
}

impl StreamSink {
    /// Create a sink and its consumer
    pub fn channel(target: impl Into<String>) -> (StreamSink, ResultStream) {
        let target = target.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = StreamSink {
            shared: Arc::new(StreamShared {
                tx,
                state: Mutex::new(StreamState {
                    next_seq: 0,
                    done: false,
                }),
                label: target.clone(),
            }),
        };
        let stream = ResultStream {
            rx,
            reorder: Reorder::new(),
            target,
            finished: false,
        };
        (sink, stream)
    }

    fn emit(&self, event: StreamEvent) -> bool {
        let terminal = !matches!(event, StreamEvent::Next(_));
        let mut state = self.shared.state.lock();
        if state.done {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.done = terminal;
        // A dropped consumer is not the publisher's failure.
        let _ = self.shared.tx.send(Sequenced { seq, item: event });
        true
    }

    /// Publish a value; false once the stream is terminal
    pub fn next(&self, value: Value) -> bool {
        self.emit(StreamEvent::Next(value))
    }

    /// End the stream normally
    pub fn complete(&self) -> bool {
        self.emit(StreamEvent::Complete)
    }

    /// End the stream with a failure
    pub fn fail(&self, err: DispatchError) -> bool {
        self.emit(StreamEvent::Fail(err))
    }

    /// Whether complete or fail has been called
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    /// Whether the consumer has gone away
    pub fn is_cancelled(&self) -> bool {
        self.shared.tx.is_closed()
    }

    pub(crate) fn label(&self) -> &str {
        &self.shared.label
    }
}

impl std::fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("target", &self.shared.label)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Consumer side of a stream call
pub struct ResultStream {
    rx: mpsc::UnboundedReceiver<Sequenced<StreamEvent>>,
    reorder: Reorder<StreamEvent>,
    target: String,
    finished: bool,
}

impl ResultStream {
    /// Drain the stream, stopping at the first failure
    pub async fn collect_values(mut self) -> DispatchResult<Vec<Value>> {
        use futures::StreamExt;

        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Stream for ResultStream {
    type Item = DispatchResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if let Some(event) = this.reorder.pop() {
                match event {
                    StreamEvent::Next(value) => return Poll::Ready(Some(Ok(value))),
                    StreamEvent::Complete => {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                    StreamEvent::Fail(err) => {
                        this.finished = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(sequenced)) => this.reorder.push(sequenced.seq, sequenced.item),
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(DispatchError::ServiceClosed(
                        this.target.clone(),
                    ))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_reorder_releases_in_sequence() {
        let mut reorder = Reorder::new();
        reorder.push(2, "c");
        reorder.push(0, "a");
        assert_eq!(reorder.pop(), Some("a"));
        assert_eq!(reorder.pop(), None);
        assert_eq!(reorder.buffered(), 1);
        reorder.push(1, "b");
        reorder.push(0, "dup");
        assert_eq!(reorder.pop(), Some("b"));
        assert_eq!(reorder.pop(), Some("c"));
        assert_eq!(reorder.pop(), None);
    }

    #[tokio::test]
    async fn test_reply_resolves_exactly_once() {
        let (sink, reply) = ReplySink::channel("svc");
        assert!(sink.ok(json!(1)));
        assert!(!sink.fail(DispatchError::Service("late".into())));
        assert!(sink.is_resolved());
        assert_eq!(sink.resolve_attempts(), 2);
        assert_eq!(reply.await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_dropped_sink_reports_closed() {
        let (sink, reply) = ReplySink::channel("svc");
        drop(sink);
        assert_eq!(reply.await, Err(DispatchError::ServiceClosed("svc".into())));
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (_sink, reply) = ReplySink::channel("svc");
        let result = reply.timeout(Some(Duration::from_millis(10))).wait().await;
        assert_eq!(result, Err(DispatchError::Timeout("svc".into())));
    }

    #[tokio::test]
    async fn test_typed_reply() {
        let (sink, reply) = ReplySink::channel("svc");
        sink.ok_serialize(&vec![1u32, 2, 3]);
        let values: Vec<u32> = reply.typed().await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_terminal_is_final() {
        let (sink, stream) = StreamSink::channel("svc");
        assert!(sink.next(json!("a")));
        assert!(sink.next(json!("b")));
        assert!(sink.complete());
        assert!(!sink.next(json!("c")));
        assert!(!sink.fail(DispatchError::Service("late".into())));

        let values = stream.collect_values().await.unwrap();
        assert_eq!(values, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_stream_failure_surfaces_once() {
        let (sink, mut stream) = StreamSink::channel("svc");
        sink.next(json!(1));
        sink.fail(DispatchError::PipeFailed("boom".into()));

        assert_eq!(stream.next().await, Some(Ok(json!(1))));
        assert_eq!(
            stream.next().await,
            Some(Err(DispatchError::PipeFailed("boom".into())))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_reply_into_stream() {
        let (sink, stream) = StreamSink::channel("svc");
        let reply = ReplySink::into_stream(sink);
        reply.ok(json!(42));
        assert_eq!(stream.collect_values().await.unwrap(), vec![json!(42)]);
    }
}
