//! Flow-controlled pipes
//!
//! A pipe is a single-producer, single-consumer channel of values bounded by
//! [`Credits`]. The publisher holds a [`PipeOut`] and may only send while
//! credit is available; the consumer holds a [`PipeIn`] stream and either
//! replenishes automatically (prefetch mode) or grants credit explicitly.
//!
//! `close` and `fail` are terminal and idempotent: the consumer observes at
//! most one of them, and no value after it.

use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::credits::{Credits, FlowMode};
use super::error::{DispatchError, DispatchResult};
use super::inbox::Inbox;
use super::message::{Address, Body, Message, Value};
use super::sink::{Reorder, Sequenced};

/// Pipe identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipeId(pub Uuid);

impl PipeId {
    /// Create a new random PipeId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe:{}", self.0)
    }
}

/// Event carried from publisher to consumer
#[derive(Debug, Clone, PartialEq)]
pub enum PipeEvent {
    /// One value
    Next(Value),
    /// Normal end
    Close,
    /// Terminal failure
    Fail(DispatchError),
}

impl PipeEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, PipeEvent::Next(_))
    }
}

/// A value the pipe refused, handed back to the publisher
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipeError {
    /// No credit available; wait for `on_available`
    #[error("no credit available")]
    NoCredit(Value),

    /// Pipe already closed or failed
    #[error("pipe is closed")]
    Closed(Value),

    /// Consumer cancelled the subscription
    #[error("pipe cancelled by consumer")]
    Cancelled(Value),
}

impl PipeError {
    /// Recover the refused value
    pub fn into_value(self) -> Value {
        match self {
            PipeError::NoCredit(value) | PipeError::Closed(value) | PipeError::Cancelled(value) => {
                value
            }
        }
    }
}

struct PipeState {
    next_seq: u64,
    terminal: bool,
}

struct PipeShared {
    id: PipeId,
    tx: mpsc::UnboundedSender<Sequenced<PipeEvent>>,
    state: Mutex<PipeState>,
    credits: Credits,
}

/// Publisher side of a pipe
#[derive(Clone)]
pub struct PipeOut {
    shared: Arc<PipeShared>,
}

impl PipeOut {
    /// Pipe identifier
    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    /// Credits currently available to the publisher
    pub fn available(&self) -> i64 {
        self.shared.credits.available()
    }

    /// The credit counter bound to this pipe
    pub fn credits(&self) -> &Credits {
        &self.shared.credits
    }

    /// Register a single-shot wake-up for when credit becomes available
    pub fn on_available(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.credits.on_available(callback);
    }

    fn emit(&self, event: PipeEvent) -> Result<(), PipeEvent> {
        let terminal = event.is_terminal();
        {
            let mut state = self.shared.state.lock();
            if state.terminal {
                return Err(event);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.terminal = terminal;
            // Consumer may be gone; cancellation reaches us through the credits.
            let _ = self.shared.tx.send(Sequenced { seq, item: event });
        }
        if terminal {
            // Wake clones still waiting in `next`.
            self.shared.credits.close();
        }
        Ok(())
    }

    fn emit_value(&self, value: Value) -> Result<(), PipeError> {
        self.emit(PipeEvent::Next(value)).map_err(|event| match event {
            PipeEvent::Next(value) => PipeError::Closed(value),
            _ => PipeError::Closed(Value::Null),
        })
    }

    /// Send a value if a credit is available, otherwise hand it back
    pub fn try_next(&self, value: Value) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed(value));
        }
        if self.is_cancelled() {
            return Err(PipeError::Cancelled(value));
        }
        if !self.shared.credits.try_acquire() {
            return Err(PipeError::NoCredit(value));
        }
        self.emit_value(value)
    }

    /// Wait for a credit, then send
    ///
    /// Returns `Closed` if the pipe is closed or failed while waiting.
    pub async fn next(&self, value: Value) -> Result<(), PipeError> {
        if self.is_closed() {
            return Err(PipeError::Closed(value));
        }
        if !self.shared.credits.acquire().await {
            if self.is_closed() {
                return Err(PipeError::Closed(value));
            }
            return Err(PipeError::Cancelled(value));
        }
        self.emit_value(value)
    }

    /// End the pipe normally; false if already terminal
    pub fn close(&self) -> bool {
        self.emit(PipeEvent::Close).is_ok()
    }

    /// End the pipe with a failure; false if already terminal
    pub fn fail(&self, err: DispatchError) -> bool {
        self.emit(PipeEvent::Fail(err)).is_ok()
    }

    /// Whether close or fail has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().terminal
    }

    /// Whether the consumer cancelled or went away
    pub fn is_cancelled(&self) -> bool {
        self.shared.credits.is_cancelled() || self.shared.tx.is_closed()
    }
}

impl fmt::Debug for PipeOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeOut")
            .field("id", &self.shared.id)
            .field("credits", &self.shared.credits)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer side of a pipe
pub struct PipeIn {
    id: PipeId,
    rx: mpsc::UnboundedReceiver<Sequenced<PipeEvent>>,
    reorder: Reorder<PipeEvent>,
    credits: Credits,
    prefetch: bool,
    finished: bool,
    label: String,
    subscription: Option<Subscription>,
}

impl PipeIn {
    /// Pipe identifier
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Credit counter; call `add`/`set` on it in explicit-credit mode
    pub fn credits(&self) -> &Credits {
        &self.credits
    }

    /// Grant `n` more values (explicit-credit mode)
    pub fn add_credits(&self, n: i64) {
        self.credits.add(n);
    }

    /// Stop consuming; the publisher observes cancellation
    ///
    /// A pipe opened through a subscription also tells the publishing stub,
    /// which runs its unsubscribe hook.
    pub fn close(&mut self) {
        self.unsubscribe();
        self.finished = true;
    }

    pub(crate) fn attach(&mut self, subscription: Subscription) {
        self.subscription = Some(subscription);
    }

    fn unsubscribe(&self) {
        match &self.subscription {
            Some(subscription) => {
                subscription.cancel();
            }
            None => self.credits.cancel(),
        }
    }
}

impl Stream for PipeIn {
    type Item = DispatchResult<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            if let Some(event) = this.reorder.pop() {
                match event {
                    PipeEvent::Next(value) => {
                        if this.prefetch {
                            this.credits.add(1);
                        }
                        return Poll::Ready(Some(Ok(value)));
                    }
                    PipeEvent::Close => {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                    PipeEvent::Fail(err) => {
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
                        this.label.clone(),
                    ))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for PipeIn {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for PipeIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeIn")
            .field("id", &self.id)
            .field("credits", &self.credits)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

/// Create a connected publisher/consumer pair
///
/// `mode` should already be resolved; a zero prefetch window grants no
/// initial credit.
pub fn pipe(mode: FlowMode, label: impl Into<String>) -> (PipeOut, PipeIn) {
    let id = PipeId::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let credits = Credits::new(mode.initial_credits());
    let out = PipeOut {
        shared: Arc::new(PipeShared {
            id,
            tx,
            state: Mutex::new(PipeState {
                next_seq: 0,
                terminal: false,
            }),
            credits: credits.clone(),
        }),
    };
    let input = PipeIn {
        id,
        rx,
        reorder: Reorder::new(),
        credits,
        prefetch: mode.is_prefetch(),
        finished: false,
        label: label.into(),
        subscription: None,
    };
    (out, input)
}

/// Cancel handle for a pipe subscription
///
/// Cancelling is delivered to the publishing stub as a message, so it is
/// serialized with the stub's other work.
#[derive(Clone)]
pub struct Subscription {
    pipe: PipeId,
    credits: Credits,
    inbox: Inbox,
    address: Address,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(pipe: PipeId, credits: Credits, inbox: Inbox, address: Address) -> Self {
        Self {
            pipe,
            credits,
            inbox,
            address,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pipe this subscription controls
    pub fn pipe_id(&self) -> PipeId {
        self.pipe
    }

    /// Cancel the subscription; false if it was already cancelled
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.credits.cancel();
        let message = Message::new(self.address.clone(), Body::Cancel { pipe: self.pipe }).direct(true);
        if let Err(err) = self.inbox.offer_now(message) {
            tracing::debug!(pipe = %self.pipe, error = %err, "unsubscribe not delivered");
        }
        true
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("pipe", &self.pipe)
            .field("address", &self.address)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_explicit_credit_scenario() {
        let (out, mut input) = pipe(FlowMode::Credit { initial: 3 }, "svc");
        for i in 0..3 {
            out.try_next(json!(i)).unwrap();
        }
        assert_eq!(out.try_next(json!(3)), Err(PipeError::NoCredit(json!(3))));
        assert!(!out.is_closed());

        input.add_credits(2);
        assert_eq!(out.available(), 2);
        out.try_next(json!(3)).unwrap();
        out.try_next(json!(4)).unwrap();
        assert!(out.close());

        let mut values = Vec::new();
        while let Some(value) = input.next().await {
            values.push(value.unwrap());
        }
        assert_eq!(values, (0..5).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_and_fail_are_idempotent() {
        let (out, mut input) = pipe(FlowMode::Credit { initial: 4 }, "svc");
        out.try_next(json!("a")).unwrap();
        assert!(out.fail(DispatchError::PipeFailed("boom".into())));
        assert!(!out.close());
        assert!(!out.fail(DispatchError::PipeFailed("again".into())));
        assert_eq!(out.try_next(json!("b")), Err(PipeError::Closed(json!("b"))));

        assert_eq!(input.next().await, Some(Ok(json!("a"))));
        assert_eq!(
            input.next().await,
            Some(Err(DispatchError::PipeFailed("boom".into())))
        );
        assert_eq!(input.next().await, None);
    }

    #[tokio::test]
    async fn test_prefetch_replenishes_per_value() {
        let (out, mut input) = pipe(FlowMode::Prefetch { window: 2 }, "svc");
        out.try_next(json!(1)).unwrap();
        out.try_next(json!(2)).unwrap();
        assert!(matches!(out.try_next(json!(3)), Err(PipeError::NoCredit(_))));

        assert_eq!(input.next().await, Some(Ok(json!(1))));
        assert_eq!(out.available(), 1);
        out.try_next(json!(3)).unwrap();
    }

    #[tokio::test]
    async fn test_async_next_waits_for_credit() {
        let (out, mut input) = pipe(FlowMode::Credit { initial: 0 }, "svc");
        let publisher = {
            let out = out.clone();
            tokio::spawn(async move { out.next(json!("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished());

        input.add_credits(1);
        publisher.await.unwrap().unwrap();
        assert_eq!(input.next().await, Some(Ok(json!("late"))));
    }

    #[tokio::test]
    async fn test_close_wakes_publisher_waiting_for_credit() {
        let (out, mut input) = pipe(FlowMode::Credit { initial: 0 }, "svc");
        let publisher = {
            let out = out.clone();
            tokio::spawn(async move { out.next(json!(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!publisher.is_finished());

        assert!(out.close());
        let result = tokio::time::timeout(Duration::from_millis(500), publisher)
            .await
            .expect("publisher still blocked after close")
            .unwrap();
        assert_eq!(result, Err(PipeError::Closed(json!(1))));

        input.add_credits(1);
        assert_eq!(out.next(json!(2)).await, Err(PipeError::Closed(json!(2))));
        assert_eq!(input.next().await, None);
    }

    #[tokio::test]
    async fn test_fail_wakes_publisher_waiting_for_credit() {
        let (out, _input) = pipe(FlowMode::Credit { initial: 0 }, "svc");
        let publisher = {
            let out = out.clone();
            tokio::spawn(async move { out.next(json!("x")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(out.fail(DispatchError::PipeFailed("gone".into())));
        let result = tokio::time::timeout(Duration::from_millis(500), publisher)
            .await
            .expect("publisher still blocked after fail")
            .unwrap();
        assert_eq!(result, Err(PipeError::Closed(json!("x"))));
    }

    #[tokio::test]
    async fn test_dropping_consumer_cancels() {
        let (out, input) = pipe(FlowMode::Credit { initial: 5 }, "svc");
        drop(input);
        assert!(out.is_cancelled());
        assert_eq!(
            out.try_next(json!(1)),
            Err(PipeError::Cancelled(json!(1)))
        );
    }

    #[tokio::test]
    async fn test_publisher_dropped_without_close() {
        let (out, mut input) = pipe(FlowMode::Credit { initial: 1 }, "svc");
        drop(out);
        assert_eq!(
            input.next().await,
            Some(Err(DispatchError::ServiceClosed("svc".into())))
        );
        assert_eq!(input.next().await, None);
    }
}
