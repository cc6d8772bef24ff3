//! Quartet – an actor-style message dispatch runtime
//!
//! Services are plain Rust values ("beans") paired with a method table.
//! Every call is turned into a message, queued on the service's inbox, and
//! delivered on a single path, so a bean never sees two calls at once.
//! Calls come in four shapes:
//! - send: fire-and-forget
//! - query: one result through a reply future
//! - stream: a finite sequence of results
//! - pipe: a credit-bounded push channel with explicit flow control
//!
//! Services load lazily (load hook, then journal replay), buffer arrivals
//! while loading, journal state-changing calls before running them, and
//! checkpoint through a save hook that truncates the journal.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core: messages, stubs, inboxes, journals, pipes
pub mod runtime;

// Re-export key types for convenience
pub use runtime::credits::{Credits, FlowMode};
pub use runtime::error::{DispatchError, DispatchResult, RuntimeError};
pub use runtime::lifecycle::{LoadState, ShutdownMode};
pub use runtime::message::{Address, Args, Headers, Value};
pub use runtime::method::{BatchSummary, Child, MethodDef, MethodTable};
pub use runtime::pipe::{PipeIn, PipeOut, Subscription};
pub use runtime::registry::ServiceRef;
pub use runtime::sink::{ReplySink, StreamSink};
pub use runtime::{JournalMode, Runtime, RuntimeConfig, ServiceBuilder};

/// Current version of the runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[doc(hidden)]
pub use serde_json as __serde_json;

/// Build an [`Args`] list from JSON-convertible expressions
///
/// ```
/// let args = quartet::args![1, "two", [3]];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::empty()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new(vec![$($crate::__serde_json::json!($value)),+])
    };
}
