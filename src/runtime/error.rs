//! Error types for the Quartet runtime
//!
//! Domain errors use thiserror. `DispatchError` is the taxonomy every reply,
//! stream, and pipe sink resolves with; the other enums cover the journal,
//! storage, and method registration subsystems and convert into
//! `RuntimeError` at the top level.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Dispatch-related errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Journal-related errors
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Method table registration errors
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Initialization errors
    #[error("Initialization failed: {0}")]
    Init(String),
}

/// Failure delivered to a caller through its reply, stream, or pipe sink.
///
/// Cloneable because a single failure may fan out to many sinks, e.g. every
/// pending message of a stub whose load failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DispatchError {
    /// No method with this name on the target stub
    #[error("method '{method}' not found on '{address}'")]
    MethodNotFound {
        /// Target address
        address: String,
        /// Requested method name
        method: String,
    },

    /// Argument count or type mismatch at dispatch time
    #[error("illegal argument for '{method}': {detail}")]
    IllegalArgument {
        /// Method being invoked
        method: String,
        /// What was wrong with the arguments
        detail: String,
    },

    /// The stub is closed, or its load/replay failed
    #[error("service '{0}' is closed")]
    ServiceClosed(String),

    /// No stub registered under the address
    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    /// The inbox capacity policy rejected an offer
    #[error("inbox for '{0}' is full")]
    QueueFull(String),

    /// A journal append or flush failed (durability only)
    #[error("journal write failed: {0}")]
    JournalWriteFailed(String),

    /// Journal replay failed; the stub is closed
    #[error("journal replay failed: {0}")]
    ReplayFailed(String),

    /// A pipe was failed by its publisher or consumer
    #[error("pipe failed: {0}")]
    PipeFailed(String),

    /// The message deadline elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// User-level failure raised inside a service method
    #[error("{0}")]
    Service(String),
}

impl DispatchError {
    /// Build an `IllegalArgument` error
    pub fn illegal_argument(method: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IllegalArgument {
            method: method.into(),
            detail: detail.into(),
        }
    }

    /// Build a `MethodNotFound` error
    pub fn method_not_found(address: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            address: address.into(),
            method: method.into(),
        }
    }

    /// Whether this failure means the target will not accept further messages
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ServiceClosed(_) | Self::ReplayFailed(_))
    }
}

/// Convenience result alias for dispatch operations
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Argument extraction failure raised by [`Args`](super::message::Args).
///
/// Service bodies propagate it with `?`; the method adapter boundary turns it
/// into [`DispatchError::IllegalArgument`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    /// Wrong number of positional arguments
    #[error("expected {expected} argument(s), got {actual}")]
    Arity {
        /// Declared parameter count
        expected: usize,
        /// Supplied argument count
        actual: usize,
    },

    /// Argument at `index` is missing
    #[error("missing argument {0}")]
    Missing(usize),

    /// Argument at `index` has the wrong shape
    #[error("argument {index}: {detail}")]
    Type {
        /// Position of the argument
        index: usize,
        /// Deserialization detail
        detail: String,
    },
}

/// Journal-specific errors
#[derive(Debug, Error)]
pub enum JournalError {
    /// Corrupted journal record
    #[error("Corrupted journal '{key}' at offset {offset}: {detail}")]
    Corrupted {
        /// Journal key
        key: String,
        /// Byte offset where corruption was found
        offset: u64,
        /// Description of the corruption
        detail: String,
    },

    /// Entry sequence numbers went backwards
    #[error("Out-of-order entry in journal '{key}': {seq} after {previous}")]
    OutOfOrder {
        /// Journal key
        key: String,
        /// Offending sequence number
        seq: u64,
        /// Sequence number that preceded it
        previous: u64,
    },

    /// Encoding error
    #[error("Entry encoding failed: {0}")]
    Encoding(String),

    /// Background replay read did not complete
    #[error("Replay read aborted: {0}")]
    Aborted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience result alias for journal operations
pub type JournalResult<T> = std::result::Result<T, JournalError>;

/// Storage-specific errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Method table construction errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Two methods registered under one name
    #[error("method '{0}' registered twice")]
    DuplicateMethod(String),

    /// A method declared both direct and modify
    #[error("method '{0}' cannot be both direct and modify")]
    DirectModify(String),

    /// A modify method that is not send- or query-shaped cannot be journaled
    #[error("method '{0}' is modify but not send- or query-shaped")]
    ModifyShape(String),

    /// A bean does not match the type its method table was built for
    #[error("bean type '{actual}' does not match method table for '{expected}'")]
    BeanMismatch {
        /// Type the table was built for
        expected: String,
        /// Type supplied
        actual: String,
    },

    /// Address already has a stub
    #[error("address '{0}' is already registered")]
    DuplicateAddress(String),

    /// Address is empty or malformed
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Convert a service body failure into the dispatch taxonomy
///
/// Argument errors become `IllegalArgument`, embedded dispatch errors pass
/// through, everything else is a user-level `Service` failure.
pub(crate) fn classify(method: &str, err: anyhow::Error) -> DispatchError {
    if let Some(arg) = err.downcast_ref::<ArgError>() {
        return DispatchError::illegal_argument(method, arg.to_string());
    }
    match err.downcast::<DispatchError>() {
        Ok(dispatch) => dispatch,
        Err(other) => DispatchError::Service(format!("{other:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_arg_error() {
        let err = anyhow::Error::new(ArgError::Missing(2));
        match classify("deposit", err) {
            DispatchError::IllegalArgument { method, detail } => {
                assert_eq!(method, "deposit");
                assert!(detail.contains("missing argument 2"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_passthrough_and_user_error() {
        let err = anyhow::Error::new(DispatchError::ServiceClosed("bank".into()));
        assert_eq!(
            classify("x", err),
            DispatchError::ServiceClosed("bank".into())
        );

        let err = anyhow::anyhow!("insufficient funds");
        assert_eq!(
            classify("withdraw", err),
            DispatchError::Service("insufficient funds".into())
        );
    }

    #[test]
    fn test_is_closed() {
        assert!(DispatchError::ServiceClosed("a".into()).is_closed());
        assert!(DispatchError::ReplayFailed("io".into()).is_closed());
        assert!(!DispatchError::QueueFull("a".into()).is_closed());
    }
}
