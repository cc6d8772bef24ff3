//! Service registry and caller handles
//!
//! The registry maps root service names to their inbox. Callers resolve an
//! address (root or child path) to a [`ServiceRef`] and invoke methods through
//! it in any of the four call shapes.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::credits::FlowMode;
use super::error::{DispatchError, DispatchResult, RegistrationError};
use super::inbox::Inbox;
use super::lifecycle::ShutdownMode;
use super::message::{Address, Args, Body, Headers, Message, Sink, Value};
use super::method::{MethodInfo, MethodTable};
use super::pipe::{PipeIn, Subscription, pipe};
use super::sink::{ReplySink, ResultStream, StreamSink};

/// Caller-side defaults applied by every [`ServiceRef`]
#[derive(Debug, Clone, Copy)]
pub struct CallDefaults {
    /// How long an offer may wait for inbox capacity
    pub offer_timeout: Duration,
    /// Window used for subscriptions that ask for the default prefetch
    pub prefetch_window: u32,
}

impl Default for CallDefaults {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_millis(1000),
            prefetch_window: 32,
        }
    }
}

#[derive(Clone)]
struct Registered {
    inbox: Inbox,
    table: Arc<MethodTable>,
}

/// Registered services by root name
#[derive(Clone, Default)]
pub struct Registry {
    services: Arc<RwLock<HashMap<String, Registered>>>,
    defaults: CallDefaults,
}

impl Registry {
    /// Create an empty registry
    pub fn new(defaults: CallDefaults) -> Self {
        Self {
            services: Arc::default(),
            defaults,
        }
    }

    pub(crate) fn insert(
        &self,
        address: &Address,
        inbox: Inbox,
        table: Arc<MethodTable>,
    ) -> Result<(), RegistrationError> {
        if address.path().is_some() {
            return Err(RegistrationError::InvalidAddress(address.to_string()));
        }
        let mut services = self.services.write();
        // A closed service may be replaced.
        if let Some(existing) = services.get(address.root()) {
            if !existing.inbox.is_closed() {
                return Err(RegistrationError::DuplicateAddress(address.to_string()));
            }
        }
        services.insert(address.root().to_string(), Registered { inbox, table });
        tracing::debug!(%address, "service registered");
        Ok(())
    }

    /// Handle for `address`, which may name a child below a registered root
    pub fn resolve(&self, address: &str) -> DispatchResult<ServiceRef> {
        let address =
            Address::parse(address).map_err(|_| DispatchError::ServiceNotFound(address.to_string()))?;
        let services = self.services.read();
        let registered = services
            .get(address.root())
            .ok_or_else(|| DispatchError::ServiceNotFound(address.to_string()))?;
        let table = address.path().is_none().then(|| registered.table.clone());
        Ok(ServiceRef {
            address,
            inbox: registered.inbox.clone(),
            table,
            defaults: self.defaults,
        })
    }

    /// Remove a registration
    pub fn remove(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    /// Registered root names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Caller handle for one stub address
#[derive(Clone)]
pub struct ServiceRef {
    address: Address,
    inbox: Inbox,
    table: Option<Arc<MethodTable>>,
    defaults: CallDefaults,
}

impl ServiceRef {
    /// Target address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Whether the service has stopped accepting messages
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Method description, known only for root addresses
    pub fn info(&self, method: &str) -> Option<&MethodInfo> {
        self.table.as_ref()?.info(method)
    }

    /// Handle for a child path below this address
    pub fn child(&self, path: &str) -> DispatchResult<ServiceRef> {
        let address = self
            .address
            .child(path)
            .map_err(|_| DispatchError::ServiceNotFound(format!("{}/{path}", self.address)))?;
        Ok(ServiceRef {
            address,
            inbox: self.inbox.clone(),
            table: None,
            defaults: self.defaults,
        })
    }

    fn call(&self, method: &str, args: Args, sink: Sink, headers: Headers) -> Message {
        let direct = self.info(method).is_some_and(|info| info.direct);
        Message::call(self.address.clone(), method, args, sink)
            .with_headers(headers)
            .direct(direct)
    }

    fn control(&self, body: Body) -> Message {
        Message::new(self.address.clone(), body).direct(true)
    }

    async fn offer(&self, message: Message) -> DispatchResult<()> {
        self.inbox.offer(message, self.defaults.offer_timeout).await
    }

    /// Fire-and-forget call; succeeds once the message is queued
    pub async fn send(&self, method: &str, args: Args) -> DispatchResult<()> {
        self.offer(self.call(method, args, Sink::None, Headers::default()))
            .await
    }

    /// Call and wait for the single result
    pub async fn query(&self, method: &str, args: Args) -> DispatchResult<Value> {
        self.query_with(method, args, Headers::default()).await
    }

    /// Query with explicit headers; a header timeout bounds both delivery and
    /// the wait for the reply
    pub async fn query_with(&self, method: &str, args: Args, headers: Headers) -> DispatchResult<Value> {
        let timeout = headers.timeout;
        let (reply, pending) = ReplySink::channel(format!("{}.{method}", self.address));
        self.offer(self.call(method, args, Sink::Reply(reply), headers))
            .await?;
        pending.timeout(timeout).wait().await
    }

    /// Query and deserialize the result
    pub async fn query_as<T: DeserializeOwned>(&self, method: &str, args: Args) -> DispatchResult<T> {
        let value = self.query(method, args).await?;
        serde_json::from_value(value).map_err(|err| {
            DispatchError::Service(format!("unexpected result from '{}.{method}': {err}", self.address))
        })
    }

    /// Call and receive the results as a stream
    pub async fn stream(&self, method: &str, args: Args) -> DispatchResult<ResultStream> {
        let (sink, stream) = StreamSink::channel(format!("{}.{method}", self.address));
        self.offer(self.call(method, args, Sink::Stream(sink), Headers::default()))
            .await?;
        Ok(stream)
    }

    /// Open a credit-bounded pipe from a pipe-shaped method
    pub async fn subscribe(
        &self,
        method: &str,
        args: Args,
        mode: FlowMode,
    ) -> DispatchResult<(PipeIn, Subscription)> {
        let mode = mode.resolve(self.defaults.prefetch_window);
        let (out, mut input) = pipe(mode, format!("{}.{method}", self.address));
        let subscription = Subscription::new(
            input.id(),
            input.credits().clone(),
            self.inbox.clone(),
            self.address.clone(),
        );
        input.attach(subscription.clone());
        self.offer(self.call(method, args, Sink::Pipe(out), Headers::default()))
            .await?;
        Ok((input, subscription))
    }

    async fn control_reply(&self, body: impl FnOnce(ReplySink) -> Body) -> DispatchResult<Value> {
        let (reply, pending) = ReplySink::channel(self.address.to_string());
        self.offer(self.control(body(reply))).await?;
        pending.await
    }

    /// Load the stub now instead of on first call
    pub async fn activate(&self) -> DispatchResult<()> {
        self.control_reply(|reply| Body::Activate { reply: Some(reply) })
            .await
            .map(drop)
    }

    /// Request a checkpoint; resolves when the save completes
    pub async fn checkpoint(&self) -> DispatchResult<()> {
        self.control_reply(|reply| Body::Checkpoint { reply: Some(reply) })
            .await
            .map(drop)
    }

    /// Close the stub and its children; closing twice succeeds
    pub async fn shutdown(&self, mode: ShutdownMode) -> DispatchResult<()> {
        match self
            .control_reply(|reply| Body::Shutdown {
                mode,
                reply: Some(reply),
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(DispatchError::ServiceClosed(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRef")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}
