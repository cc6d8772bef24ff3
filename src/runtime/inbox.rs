//! Per-service inbox and delivery loop
//!
//! Every service owns one [`Inbox`]. Callers offer messages; a single
//! [`DeliveryLoop`] task pulls them off in batches and hands each batch to the
//! service's stub tree. Because only that task touches the stubs, deliveries
//! never overlap.
//!
//! Capacity is enforced with a semaphore: each queued message holds a permit
//! until it is received. When no permit is free the configured
//! [`QueueFullHandler`] decides whether the caller blocks, the message is
//! dropped, or the offer fails. Direct messages skip the permit.

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};

use super::error::{DispatchError, DispatchResult};
use super::lifecycle::ShutdownMode;
use super::message::{Address, Body, Message, Value};
use super::stub::{OpOutcome, StubId, StubTree};

/// What to do with an offer that finds the inbox full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullAction {
    /// Wait up to the duration for room, then fail with `QueueFull`
    Block(Duration),
    /// Discard the message; its sink fails with `QueueFull` but the offer succeeds
    Drop,
    /// Fail the offer with `QueueFull`
    Fail,
}

/// Policy consulted when an offer exceeds the inbox capacity
pub trait QueueFullHandler: Send + Sync {
    /// Decide how to handle an offer to a full inbox; `timeout` is the
    /// caller's offer timeout
    fn on_full(&self, address: &Address, timeout: Duration) -> QueueFullAction;
}

impl<F> QueueFullHandler for F
where
    F: Fn(&Address, Duration) -> QueueFullAction + Send + Sync,
{
    fn on_full(&self, address: &Address, timeout: Duration) -> QueueFullAction {
        self(address, timeout)
    }
}

/// Default policy: block for the offer timeout, then fail
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockThenFail;

impl QueueFullHandler for BlockThenFail {
    fn on_full(&self, _address: &Address, timeout: Duration) -> QueueFullAction {
        QueueFullAction::Block(timeout)
    }
}

/// Fail immediately when full
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFast;

impl QueueFullHandler for FailFast {
    fn on_full(&self, _address: &Address, _timeout: Duration) -> QueueFullAction {
        QueueFullAction::Fail
    }
}

/// Silently drop messages that do not fit
#[derive(Debug, Clone, Copy, Default)]
pub struct DropNewest;

impl QueueFullHandler for DropNewest {
    fn on_full(&self, _address: &Address, _timeout: Duration) -> QueueFullAction {
        QueueFullAction::Drop
    }
}

/// Offer counters
#[derive(Debug, Default)]
pub struct InboxStats {
    offered: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl InboxStats {
    /// Messages accepted into the queue
    pub fn offered(&self) -> u64 {
        self.offered.load(Ordering::Relaxed)
    }

    /// Offers that failed
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Messages discarded by a drop policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Queued {
    message: Message,
    _permit: Option<OwnedSemaphorePermit>,
}

struct InboxShared {
    address: Address,
    tx: mpsc::UnboundedSender<Queued>,
    permits: Option<Arc<Semaphore>>,
    capacity: Option<usize>,
    handler: Arc<dyn QueueFullHandler>,
    closed: AtomicBool,
    stats: InboxStats,
}

/// Sending side of a service's message queue
#[derive(Clone)]
pub struct Inbox {
    shared: Arc<InboxShared>,
}

impl Inbox {
    /// Create an inbox and the receiver its delivery loop drains
    pub fn new(
        address: Address,
        capacity: Option<usize>,
        handler: Arc<dyn QueueFullHandler>,
        max_batch: usize,
    ) -> (Inbox, InboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Inbox {
            shared: Arc::new(InboxShared {
                address,
                tx,
                permits: capacity.map(|capacity| Arc::new(Semaphore::new(capacity))),
                capacity,
                handler,
                closed: AtomicBool::new(false),
                stats: InboxStats::default(),
            }),
        };
        let receiver = InboxReceiver {
            rx,
            max_batch: max_batch.max(1),
        };
        (inbox, receiver)
    }

    /// Service address
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// Configured capacity bound
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Offer counters
    pub fn stats(&self) -> &InboxStats {
        &self.shared.stats
    }

    /// Whether the delivery loop has stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.shared.tx.is_closed()
    }

    fn closed_error(&self) -> DispatchError {
        DispatchError::ServiceClosed(self.shared.address.to_string())
    }

    fn full_error(&self) -> DispatchError {
        DispatchError::QueueFull(self.shared.address.to_string())
    }

    fn reject(&self, message: Message, err: DispatchError) -> DispatchResult<()> {
        self.shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
        message.fail(err.clone());
        Err(err)
    }

    fn enqueue(&self, message: Message, permit: Option<OwnedSemaphorePermit>) -> DispatchResult<()> {
        match self.shared.tx.send(Queued {
            message,
            _permit: permit,
        }) {
            Ok(()) => {
                self.shared.stats.offered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(queued)) => self.reject(queued.message, self.closed_error()),
        }
    }

    /// Enqueue a message, applying the capacity policy
    ///
    /// A message that is not enqueued has its sink resolved with the same
    /// error that is returned.
    pub async fn offer(&self, message: Message, timeout: Duration) -> DispatchResult<()> {
        if self.is_closed() {
            return self.reject(message, self.closed_error());
        }
        let Some(permits) = self.shared.permits.clone().filter(|_| !message.is_direct()) else {
            return self.enqueue(message, None);
        };

        match permits.clone().try_acquire_owned() {
            Ok(permit) => return self.enqueue(message, Some(permit)),
            Err(TryAcquireError::Closed) => return self.reject(message, self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        match self.shared.handler.on_full(&self.shared.address, timeout) {
            QueueFullAction::Block(wait) => {
                match tokio::time::timeout(wait, permits.acquire_owned()).await {
                    Ok(Ok(permit)) => self.enqueue(message, Some(permit)),
                    Ok(Err(_)) => self.reject(message, self.closed_error()),
                    Err(_) => self.reject(message, self.full_error()),
                }
            }
            QueueFullAction::Drop => {
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(address = %self.shared.address, "inbox full; message dropped");
                message.fail(self.full_error());
                Ok(())
            }
            QueueFullAction::Fail => self.reject(message, self.full_error()),
        }
    }

    /// Enqueue without waiting; a blocking policy is treated as failure
    pub fn offer_now(&self, message: Message) -> DispatchResult<()> {
        if self.is_closed() {
            return self.reject(message, self.closed_error());
        }
        let Some(permits) = self.shared.permits.clone().filter(|_| !message.is_direct()) else {
            return self.enqueue(message, None);
        };
        match permits.try_acquire_owned() {
            Ok(permit) => self.enqueue(message, Some(permit)),
            Err(TryAcquireError::Closed) => self.reject(message, self.closed_error()),
            Err(TryAcquireError::NoPermits) => self.reject(message, self.full_error()),
        }
    }

    /// Stop accepting offers and wake blocked offerers
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(permits) = &self.shared.permits {
            permits.close();
        }
    }

    /// Handle that does not keep the channel open
    pub(crate) fn downgrade(&self) -> WeakInbox {
        WeakInbox {
            address: self.shared.address.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning inbox handle held by the delivery loop
///
/// The receiver sees the channel close once every [`Inbox`] is dropped.
pub(crate) struct WeakInbox {
    address: Address,
    shared: Weak<InboxShared>,
}

impl WeakInbox {
    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn close(&self) {
        if let Some(shared) = self.shared.upgrade() {
            Inbox { shared }.close();
        }
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("address", &self.shared.address)
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving side, owned by the delivery loop
pub struct InboxReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
    max_batch: usize,
}

impl InboxReceiver {
    /// Wait for at least one message and take up to `max_batch` that are ready
    ///
    /// None once every sender is gone. Cancel-safe.
    pub async fn recv_batch(&mut self) -> Option<Vec<Message>> {
        let first = self.rx.recv().await?;
        let mut batch = Vec::with_capacity(self.max_batch.min(16));
        batch.push(first.message);
        while batch.len() < self.max_batch {
            match self.rx.try_recv() {
                Ok(queued) => batch.push(queued.message),
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Close the channel and take whatever is still queued
    pub fn close_and_drain(&mut self) -> Vec<Message> {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Ok(queued) = self.rx.try_recv() {
            remaining.push(queued.message);
        }
        remaining
    }
}

pub(crate) type Ops = FuturesUnordered<BoxFuture<'static, (StubId, OpOutcome)>>;

/// The single task that owns a service's stubs
pub(crate) struct DeliveryLoop {
    tree: StubTree,
    inbox: WeakInbox,
    receiver: InboxReceiver,
    ops: Ops,
}

impl DeliveryLoop {
    pub(crate) fn new(tree: StubTree, inbox: WeakInbox, receiver: InboxReceiver) -> Self {
        Self {
            tree,
            inbox,
            receiver,
            ops: FuturesUnordered::new(),
        }
    }

    /// Deliver until the root stub is closed and no load or save is in flight
    pub(crate) async fn run(mut self) {
        let address = self.inbox.address().clone();
        tracing::debug!(%address, "delivery loop started");
        let mut open = true;

        loop {
            if self.tree.is_closed() && self.ops.is_empty() {
                break;
            }
            tokio::select! {
                biased;

                Some((id, outcome)) = self.ops.next(), if !self.ops.is_empty() => {
                    self.tree.complete(id, outcome, &self.ops);
                }
                batch = self.receiver.recv_batch(), if open => match batch {
                    Some(batch) => {
                        tracing::trace!(%address, size = batch.len(), "batch received");
                        self.tree.deliver_batch(batch, &self.ops);
                    }
                    None => {
                        tracing::debug!(%address, "all handles dropped");
                        open = false;
                        self.tree.close_all(ShutdownMode::Forced);
                    }
                },
                else => break,
            }
            if self.tree.is_closed() {
                self.inbox.close();
            }
        }

        self.finish();
        tracing::debug!(%address, "delivery loop stopped");
    }

    fn finish(mut self) {
        self.inbox.close();
        self.tree.close_all(ShutdownMode::Forced);
        let address = self.inbox.address().to_string();
        for message in self.receiver.close_and_drain() {
            match message.body {
                Body::Shutdown {
                    reply: Some(reply), ..
                } => {
                    reply.ok(Value::Null);
                }
                body => Message { body, ..message }.fail(DispatchError::ServiceClosed(address.clone())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::{Args, Sink};
    use crate::runtime::sink::ReplySink;

    fn message(address: &Address) -> Message {
        Message::call(address.clone(), "m", Args::empty(), Sink::None)
    }

    #[tokio::test]
    async fn test_batches_respect_max_batch() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), None, Arc::new(BlockThenFail), 3);
        for _ in 0..5 {
            inbox.offer(message(&address), Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(receiver.recv_batch().await.unwrap().len(), 3);
        assert_eq!(receiver.recv_batch().await.unwrap().len(), 2);
        assert_eq!(inbox.stats().offered(), 5);
    }

    #[tokio::test]
    async fn test_fail_fast_when_full() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), Some(1), Arc::new(FailFast), 8);
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();

        let (reply, pending) = ReplySink::channel("svc");
        let query = Message::call(address.clone(), "m", Args::empty(), Sink::Reply(reply));
        let err = inbox.offer(query, Duration::ZERO).await.unwrap_err();
        assert_eq!(err, DispatchError::QueueFull("svc".into()));
        assert_eq!(pending.await, Err(DispatchError::QueueFull("svc".into())));

        // Receiving frees the permit.
        receiver.recv_batch().await.unwrap();
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();
        assert_eq!(inbox.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn test_block_then_fail() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), Some(1), Arc::new(BlockThenFail), 8);
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();

        let err = inbox
            .offer(message(&address), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::QueueFull("svc".into()));

        // A blocked offer succeeds once the consumer makes room.
        let blocked = {
            let inbox = inbox.clone();
            let address = address.clone();
            tokio::spawn(async move { inbox.offer(message(&address), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        receiver.recv_batch().await.unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drop_policy_and_direct_bypass() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), Some(1), Arc::new(DropNewest), 8);
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();
        assert_eq!(inbox.stats().dropped(), 1);

        inbox
            .offer(message(&address).direct(true), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(receiver.recv_batch().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_custom_handler_closure() {
        let address = Address::parse("svc").unwrap();
        let handler: Arc<dyn QueueFullHandler> =
            Arc::new(|_: &Address, _: Duration| QueueFullAction::Fail);
        let (inbox, _receiver) = Inbox::new(address.clone(), Some(0), handler, 8);
        assert!(inbox.offer_now(message(&address)).is_err());
    }

    #[tokio::test]
    async fn test_receiver_ends_when_only_weak_handle_remains() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), Some(4), Arc::new(BlockThenFail), 8);
        let weak = inbox.downgrade();
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();
        drop(inbox);

        assert_eq!(receiver.recv_batch().await.unwrap().len(), 1);
        assert!(receiver.recv_batch().await.is_none());
        assert_eq!(weak.address(), &address);
        weak.close();
    }

    #[tokio::test]
    async fn test_closed_inbox_rejects() {
        let address = Address::parse("svc").unwrap();
        let (inbox, mut receiver) = Inbox::new(address.clone(), Some(4), Arc::new(BlockThenFail), 8);
        inbox.offer(message(&address), Duration::ZERO).await.unwrap();
        inbox.close();
        assert_eq!(
            inbox.offer(message(&address), Duration::ZERO).await,
            Err(DispatchError::ServiceClosed("svc".into()))
        );
        assert_eq!(receiver.close_and_drain().len(), 1);
    }
}
