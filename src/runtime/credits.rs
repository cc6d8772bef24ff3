//! Credit-based flow control between a pipe publisher and its consumer
//!
//! The consumer grants capacity by raising a cumulative credit sequence;
//! the publisher spends one credit per value it sends. `available()` is the
//! difference. Both counters are atomics because this is the one piece of
//! state written from both sides of a pipe.
//!
//! A blocked publisher resumes only through its `on_available` callback (or
//! the async [`Credits::acquire`], which waits on the same wake-up), never by
//! polling.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::Notify;

use super::error::DispatchError;

/// Sentinel: explicit credit mode is off
pub const CREDIT_DISABLE: i64 = -1;

/// Sentinel: prefetch mode is off
pub const PREFETCH_DISABLE: i64 = -1;

/// Prefetch enabled with the runtime's default window
pub const PREFETCH_DEFAULT: i64 = 0;

/// Flow control mode chosen when a subscription is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowMode {
    /// Runtime replenishes one credit per consumed value; window 0 means the
    /// runtime default
    Prefetch {
        /// Number of values allowed in flight
        window: u32,
    },
    /// Consumer grants credit explicitly with `set`/`add`
    Credit {
        /// Credits granted at subscription time
        initial: u64,
    },
}

impl Default for FlowMode {
    fn default() -> Self {
        FlowMode::Prefetch { window: 0 }
    }
}

impl FlowMode {
    /// Select a mode from the `(prefetch, credits)` sentinel pair
    pub fn from_sentinels(prefetch: i64, credits: i64) -> Result<FlowMode, DispatchError> {
        let illegal = |detail: &str| DispatchError::illegal_argument("subscribe", detail);

        if prefetch < PREFETCH_DISABLE || credits < CREDIT_DISABLE {
            return Err(illegal("negative prefetch or credit count"));
        }
        match (prefetch, credits) {
            (PREFETCH_DISABLE, CREDIT_DISABLE) => {
                Err(illegal("prefetch and credits cannot both be disabled"))
            }
            (PREFETCH_DISABLE, initial) => Ok(FlowMode::Credit {
                initial: initial as u64,
            }),
            (window, CREDIT_DISABLE) => Ok(FlowMode::Prefetch {
                window: clamp_window(window),
            }),
            (window, initial) if window > PREFETCH_DEFAULT && initial > 0 => {
                Err(illegal("prefetch window and credits are mutually exclusive"))
            }
            (_, initial) if initial > 0 => Ok(FlowMode::Credit {
                initial: initial as u64,
            }),
            (window, _) => Ok(FlowMode::Prefetch {
                window: clamp_window(window),
            }),
        }
    }

    /// Replace a zero prefetch window with the runtime default
    pub fn resolve(self, default_window: u32) -> FlowMode {
        match self {
            FlowMode::Prefetch { window: 0 } => FlowMode::Prefetch {
                window: default_window.max(1),
            },
            other => other,
        }
    }

    /// Credits granted when the pipe opens
    pub fn initial_credits(&self) -> i64 {
        match self {
            FlowMode::Prefetch { window } => i64::from(*window),
            FlowMode::Credit { initial } => i64::try_from(*initial).unwrap_or(i64::MAX),
        }
    }

    /// Whether the consumer side replenishes automatically
    pub fn is_prefetch(&self) -> bool {
        matches!(self, FlowMode::Prefetch { .. })
    }
}

fn clamp_window(window: i64) -> u32 {
    u32::try_from(window).unwrap_or(u32::MAX)
}

type OnAvailable = Box<dyn FnOnce() + Send>;

struct CreditsInner {
    /// Cumulative credits granted by the consumer
    sequence: AtomicI64,
    /// Values accepted from the publisher
    sent: AtomicI64,
    cancelled: AtomicBool,
    /// Publisher has finished; no more credit will be spent
    closed: AtomicBool,
    on_available: Mutex<Option<OnAvailable>>,
    notify: Notify,
    upstream: Mutex<Option<Credits>>,
}

/// Shared credit counter for one pipe
#[derive(Clone)]
pub struct Credits {
    inner: Arc<CreditsInner>,
}

impl Credits {
    /// Credits with `initial` already granted
    pub fn new(initial: i64) -> Self {
        Self {
            inner: Arc::new(CreditsInner {
                sequence: AtomicI64::new(initial),
                sent: AtomicI64::new(0),
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                on_available: Mutex::new(None),
                notify: Notify::new(),
                upstream: Mutex::new(None),
            }),
        }
    }

    /// Current cumulative credit sequence
    pub fn get(&self) -> i64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// Values sent so far
    pub fn sent(&self) -> i64 {
        self.inner.sent.load(Ordering::Acquire)
    }

    /// Credits granted minus values sent; zero once cancelled
    pub fn available(&self) -> i64 {
        if self.is_cancelled() {
            return 0;
        }
        self.get() - self.sent()
    }

    /// Set the cumulative credit sequence
    pub fn set(&self, sequence: i64) {
        let previous = self.inner.sequence.swap(sequence, Ordering::AcqRel);
        self.granted(previous, sequence);
    }

    /// Grant `n` more credits
    pub fn add(&self, n: i64) {
        let previous = self.inner.sequence.fetch_add(n, Ordering::AcqRel);
        self.granted(previous, previous + n);
    }

    fn granted(&self, previous: i64, sequence: i64) {
        if self.is_cancelled() {
            return;
        }
        let sent = self.sent();
        if previous - sent <= 0 && sequence - sent > 0 {
            self.fire();
        }
        self.inner.notify.notify_waiters();

        let delta = sequence - previous;
        if delta > 0 {
            let upstream = self.inner.upstream.lock().clone();
            if let Some(upstream) = upstream {
                upstream.add(delta);
            }
        }
    }

    fn fire(&self) {
        // Take before calling so the callback may re-register.
        let callback = self.inner.on_available.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Register a single-shot callback for the next `<= 0` to `> 0` transition
    ///
    /// Fires immediately if credit is already available or the credits are
    /// cancelled, so a publisher cannot miss its wake-up.
    pub fn on_available(&self, callback: impl FnOnce() + Send + 'static) {
        *self.inner.on_available.lock() = Some(Box::new(callback));
        if self.available() > 0 || self.is_cancelled() {
            self.fire();
        }
    }

    /// Stop all future grants and tell the publisher to stop
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fire();
        self.inner.notify.notify_waiters();
        let upstream = self.inner.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Publisher side is done: release anyone waiting to spend credit
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fire();
        self.inner.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Forward this consumer's availability, now and on every later grant,
    /// to `upstream`
    pub fn chain(&self, upstream: &Credits) {
        if self.is_cancelled() {
            upstream.cancel();
            return;
        }
        *self.inner.upstream.lock() = Some(upstream.clone());
        let available = self.available();
        if available > 0 {
            upstream.add(available);
        }
    }

    /// Spend one credit if available
    pub fn try_acquire(&self) -> bool {
        loop {
            if self.is_cancelled() || self.is_closed() {
                return false;
            }
            let sent = self.sent();
            if self.get() - sent <= 0 {
                return false;
            }
            if self
                .inner
                .sent
                .compare_exchange(sent, sent + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Wait for and spend one credit; false if the credits were cancelled or
    /// the publisher side closed
    pub async fn acquire(&self) -> bool {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire() {
                return true;
            }
            if self.is_cancelled() || self.is_closed() {
                return false;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Credits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credits")
            .field("sequence", &self.get())
            .field("sent", &self.sent())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
