//! Messages, headers, arguments, and addresses
//!
//! Every call into a service becomes a [`Message`]: a target address, a
//! header map, and a body that is either a method call carrying its
//! positional arguments and exactly one sink, or one of the lifecycle control
//! requests (activate, checkpoint, shutdown, pipe cancel) that travel through
//! the same inbox so they serialize with ordinary calls.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::{ArgError, DispatchError, RegistrationError};
use super::lifecycle::ShutdownMode;
use super::pipe::{PipeId, PipeOut};
use super::sink::{ReplySink, StreamSink};

/// Argument and result value type
pub type Value = serde_json::Value;

/// Address of a stub: a root service name optionally followed by a child path
///
/// `"bank"` names a registered service, `"bank/acct-7"` names the child that
/// the `bank` stub produces for lookup path `acct-7`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    full: String,
    root_len: usize,
}

impl Address {
    /// Parse an address string
    pub fn parse(raw: &str) -> Result<Self, RegistrationError> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() || trimmed.split('/').any(|segment| segment.is_empty()) {
            return Err(RegistrationError::InvalidAddress(raw.to_string()));
        }
        let root_len = trimmed.find('/').unwrap_or(trimmed.len());
        Ok(Self {
            full: trimmed.to_string(),
            root_len,
        })
    }

    /// The full address string
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The registered service name
    pub fn root(&self) -> &str {
        &self.full[..self.root_len]
    }

    /// Child lookup path below the root, if any
    pub fn path(&self) -> Option<&str> {
        if self.root_len == self.full.len() {
            None
        } else {
            Some(&self.full[self.root_len + 1..])
        }
    }

    /// Address of the root service
    pub fn root_address(&self) -> Address {
        Self {
            full: self.root().to_string(),
            root_len: self.root_len,
        }
    }

    /// Append a child path
    pub fn child(&self, path: &str) -> Result<Address, RegistrationError> {
        Self::parse(&format!("{}/{}", self.full, path))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.full)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Unique message identifier, also used as correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message headers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Caller-supplied correlation id (defaults to the message id)
    pub correlation_id: Option<Uuid>,

    /// Give up on the message if it is not delivered within this duration
    pub timeout: Option<Duration>,

    /// Set on messages re-synthesized from the journal
    pub replay: bool,

    /// Free-form string headers
    pub values: BTreeMap<String, String>,
}

impl Headers {
    /// Headers with a delivery timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Add a free-form header
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

/// Positional argument list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    /// Wrap a list of values
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// No arguments
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the raw values
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Take the raw values
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Deserialize the argument at `index`
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgError> {
        let value = self.0.get(index).ok_or(ArgError::Missing(index))?;
        T::deserialize(value).map_err(|err| ArgError::Type {
            index,
            detail: err.to_string(),
        })
    }

    /// Check the argument count
    pub fn expect_len(&self, expected: usize) -> Result<(), ArgError> {
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(ArgError::Arity {
                expected,
                actual: self.0.len(),
            })
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Where the outcome of a call goes
pub enum Sink {
    /// Fire-and-forget send
    None,
    /// Request/reply query
    Reply(ReplySink),
    /// Multi-value stream
    Stream(StreamSink),
    /// Flow-controlled push pipe
    Pipe(PipeOut),
}

impl Sink {
    /// Resolve the sink with a failure
    pub fn fail(self, err: DispatchError) {
        match self {
            Sink::None => {
                tracing::debug!(error = %err, "dropping failed send");
            }
            Sink::Reply(reply) => {
                reply.fail(err);
            }
            Sink::Stream(stream) => {
                stream.fail(err);
            }
            Sink::Pipe(pipe) => {
                pipe.fail(err);
            }
        }
    }

    /// Short name of the call shape
    pub fn shape(&self) -> &'static str {
        match self {
            Sink::None => "send",
            Sink::Reply(_) => "query",
            Sink::Stream(_) => "stream",
            Sink::Pipe(_) => "pipe",
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.shape())
    }
}

/// Message payload
#[derive(Debug)]
pub enum Body {
    /// Invoke a method
    Call {
        /// Method name
        method: Arc<str>,
        /// Positional arguments
        args: Args,
        /// Result sink
        sink: Sink,
    },

    /// Load the stub without invoking anything
    Activate {
        /// Resolved once the stub is active (or failed to load)
        reply: Option<ReplySink>,
    },

    /// Request a checkpoint at the next after-batch
    Checkpoint {
        /// Resolved when the save completes
        reply: Option<ReplySink>,
    },

    /// Close the stub
    Shutdown {
        /// Graceful runs a final checkpoint first
        mode: ShutdownMode,
        /// Resolved once the stub is closed
        reply: Option<ReplySink>,
    },

    /// Consumer cancelled a pipe subscription
    Cancel {
        /// Pipe being cancelled
        pipe: PipeId,
    },
}

/// A queued unit of work for one stub
#[derive(Debug)]
pub struct Message {
    pub(crate) id: MessageId,
    pub(crate) address: Address,
    pub(crate) headers: Headers,
    pub(crate) body: Body,
    pub(crate) deadline: Option<Instant>,
    pub(crate) direct: bool,
}

impl Message {
    /// Create a message with default headers
    pub fn new(address: Address, body: Body) -> Self {
        Self {
            id: MessageId::new(),
            address,
            headers: Headers::default(),
            body,
            deadline: None,
            direct: false,
        }
    }

    /// Method call message
    pub fn call(address: Address, method: &str, args: Args, sink: Sink) -> Self {
        Self::new(
            address,
            Body::Call {
                method: Arc::from(method),
                args,
                sink,
            },
        )
    }

    /// Replace the headers; a header timeout becomes the delivery deadline
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.deadline = headers
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        self.headers = headers;
        self
    }

    /// Mark the message as a direct call (bypasses the capacity bound)
    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Message id
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Caller-supplied correlation id, or the message id
    pub fn correlation_id(&self) -> Uuid {
        self.headers.correlation_id.unwrap_or(self.id.0)
    }

    /// Target address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Message headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Message body
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Whether the message bypasses the capacity bound
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Method name for call messages
    pub fn method(&self) -> Option<&str> {
        match &self.body {
            Body::Call { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Whether the delivery deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }

    /// Discard the message, resolving whatever sink it carries with `err`
    pub fn fail(self, err: DispatchError) {
        match self.body {
            Body::Call { sink, .. } => sink.fail(err),
            Body::Activate { reply } | Body::Checkpoint { reply } | Body::Shutdown { reply, .. } => {
                if let Some(reply) = reply {
                    reply.fail(err);
                }
            }
            Body::Cancel { .. } => {}
        }
    }
}
