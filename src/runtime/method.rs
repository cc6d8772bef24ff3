//! Method adapters and method tables
//!
//! A [`MethodTable`] is built once per service type from typed closures and
//! then shared read-only by every stub of that type. Each entry is a
//! [`MethodAdapter`] that translates one of the four call shapes (send, query,
//! stream, pipe) into an invocation of the service bean, and turns whatever
//! the body returns (or raises) into a resolution of the caller's sink.
//!
//! Beans are stored type-erased; the builder's closures downcast back to the
//! concrete type, and stubs check the bean type against the table on
//! construction.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use super::error::{DispatchError, RegistrationError, classify};
use super::lifecycle::ShutdownMode;
use super::message::{Address, Args, Value};
use super::pipe::{PipeId, PipeOut};
use super::sink::{ReplySink, StreamSink};
use super::vault::Vault;

/// Type-erased service instance
pub type Bean = dyn Any + Send;

/// Call shape a method is written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// Fire-and-forget
    Send,
    /// Single result
    Query,
    /// Finite sequence of results
    Stream,
    /// Credit-bounded push channel
    Pipe,
}

/// Static description of one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method name
    pub name: String,
    /// Call shape the body implements
    pub kind: MethodKind,
    /// Changes business state; journaled and marks the stub modified
    pub modify: bool,
    /// Admitted past the inbox capacity bound
    pub direct: bool,
    /// Declared parameter count, checked before invocation
    pub arity: Option<usize>,
    /// False for the placeholder returned for unknown names
    pub found: bool,
}

/// Per-invocation access to the stub's state
pub struct Invocation<'a> {
    bean: &'a mut Bean,
    address: &'a Address,
    modified: &'a mut bool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(bean: &'a mut Bean, address: &'a Address, modified: &'a mut bool) -> Self {
        Self {
            bean,
            address,
            modified,
        }
    }

    /// Address of the stub being invoked
    pub fn address(&self) -> &Address {
        self.address
    }

    /// Flag the stub as modified for the current batch
    pub fn mark_modified(&mut self) {
        *self.modified = true;
    }

    /// Whether the stub has been marked modified in the current batch
    pub fn is_modified(&self) -> bool {
        *self.modified
    }
}

/// One operation of a service, callable in any of the four shapes
///
/// Implementations must resolve the supplied sink exactly once and must not
/// let a failure escape: send failures are logged, everything else fails the
/// sink.
pub trait MethodAdapter: Send + Sync {
    /// Static description
    fn info(&self) -> &MethodInfo;

    /// Fire-and-forget invocation
    fn send(&self, cx: &mut Invocation<'_>, args: Args);

    /// Invocation resolving `reply` with the result
    fn query(&self, cx: &mut Invocation<'_>, args: Args, reply: ReplySink);

    /// Invocation publishing zero or more values to `sink`
    fn stream(&self, cx: &mut Invocation<'_>, args: Args, sink: StreamSink);

    /// Invocation handing a credit-bounded publisher to the method
    fn pipe(&self, cx: &mut Invocation<'_>, args: Args, pipe: PipeOut);

    /// Method name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Whether calls are journaled
    fn is_modify(&self) -> bool {
        self.info().modify
    }

    /// Whether calls bypass the inbox capacity bound
    fn is_direct(&self) -> bool {
        self.info().direct
    }
}

type SendFn = Box<dyn Fn(&mut Bean, &Args) -> anyhow::Result<()> + Send + Sync>;
type QueryFn = Box<dyn Fn(&mut Bean, &Args) -> anyhow::Result<Value> + Send + Sync>;
type ReplyFn = Box<dyn Fn(&mut Bean, &Args, ReplySink) -> anyhow::Result<()> + Send + Sync>;
type StreamFn = Box<dyn Fn(&mut Bean, &Args, &StreamSink) -> anyhow::Result<()> + Send + Sync>;
type PipeFn = Box<dyn Fn(&mut Bean, &Args, PipeOut) -> anyhow::Result<()> + Send + Sync>;

enum Handler {
    Send(SendFn),
    Query(QueryFn),
    Reply(ReplyFn),
    Stream(StreamFn),
    Pipe(PipeFn),
}

impl Handler {
    fn kind(&self) -> MethodKind {
        match self {
            Handler::Send(_) => MethodKind::Send,
            Handler::Query(_) | Handler::Reply(_) => MethodKind::Query,
            Handler::Stream(_) => MethodKind::Stream,
            Handler::Pipe(_) => MethodKind::Pipe,
        }
    }
}

/// Run `f`, turning a panic into an error
pub(crate) fn guarded<T>(label: &str, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Err(anyhow::anyhow!("'{label}' panicked: {detail}"))
        }
    }
}

fn downcast<B: 'static>(bean: &mut Bean) -> anyhow::Result<&mut B> {
    bean.downcast_mut::<B>().ok_or_else(|| {
        anyhow::Error::new(DispatchError::Service(format!(
            "bean is not a {}",
            std::any::type_name::<B>()
        )))
    })
}

/// Adapter backed by a builder closure
struct FnAdapter {
    info: MethodInfo,
    handler: Handler,
}

impl FnAdapter {
    fn check_arity(&self, args: &Args) -> Result<(), DispatchError> {
        match self.info.arity {
            Some(expected) => args
                .expect_len(expected)
                .map_err(|err| DispatchError::illegal_argument(&self.info.name, err.to_string())),
            None => Ok(()),
        }
    }

    fn run<T>(&self, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, DispatchError> {
        guarded(&self.info.name, f).map_err(|err| classify(&self.info.name, err))
    }

    fn shape_error(&self, shape: &str) -> DispatchError {
        DispatchError::illegal_argument(
            &self.info.name,
            format!("{:?} method cannot be called as {shape}", self.info.kind).to_lowercase(),
        )
    }
}

impl MethodAdapter for FnAdapter {
    fn info(&self) -> &MethodInfo {
        &self.info
    }

    fn send(&self, cx: &mut Invocation<'_>, args: Args) {
        let address = cx.address;
        let bean = &mut *cx.bean;
        let result = self.check_arity(&args).and_then(|()| {
            match &self.handler {
                Handler::Send(f) => self.run(|| f(bean, &args)),
                Handler::Query(f) => self.run(|| f(bean, &args).map(drop)),
                Handler::Reply(f) => {
                    let reply = ReplySink::detached(format!("{}.{}", address, self.info.name));
                    self.run(|| f(bean, &args, reply))
                }
                Handler::Stream(f) => {
                    let (sink, _discard) = StreamSink::channel(address.as_str());
                    self.run(|| f(bean, &args, &sink))
                }
                Handler::Pipe(_) => Err(self.shape_error("send")),
            }
        });
        if let Err(err) = result {
            tracing::warn!(%address, method = %self.info.name, error = %err, "send failed");
        }
    }

    fn query(&self, cx: &mut Invocation<'_>, args: Args, reply: ReplySink) {
        if let Err(err) = self.check_arity(&args) {
            reply.fail(err);
            return;
        }
        let bean = &mut *cx.bean;
        match &self.handler {
            Handler::Send(f) => {
                reply.complete(self.run(|| f(bean, &args)).map(|()| Value::Null));
            }
            Handler::Query(f) => {
                reply.complete(self.run(|| f(bean, &args)));
            }
            Handler::Reply(f) => {
                if let Err(err) = self.run(|| f(bean, &args, reply.clone())) {
                    reply.fail(err);
                }
            }
            Handler::Stream(_) => {
                reply.fail(self.shape_error("query"));
            }
            Handler::Pipe(_) => {
                reply.fail(self.shape_error("query"));
            }
        }
    }

    fn stream(&self, cx: &mut Invocation<'_>, args: Args, sink: StreamSink) {
        if let Err(err) = self.check_arity(&args) {
            sink.fail(err);
            return;
        }
        let bean = &mut *cx.bean;
        let result = match &self.handler {
            Handler::Stream(f) => self.run(|| f(bean, &args, &sink)),
            Handler::Query(f) => self.run(|| f(bean, &args)).map(|value| {
                sink.next(value);
            }),
            Handler::Reply(f) => {
                // The reply forwards into the stream and completes it.
                let reply = ReplySink::into_stream(sink.clone());
                match self.run(|| f(bean, &args, reply.clone())) {
                    Ok(()) => return,
                    Err(err) => {
                        reply.fail(err);
                        return;
                    }
                }
            }
            Handler::Send(f) => self.run(|| f(bean, &args)),
            Handler::Pipe(_) => Err(self.shape_error("stream")),
        };
        match result {
            Ok(()) => {
                sink.complete();
            }
            Err(err) => {
                sink.fail(err);
            }
        }
    }

    fn pipe(&self, cx: &mut Invocation<'_>, args: Args, pipe: PipeOut) {
        if let Err(err) = self.check_arity(&args) {
            pipe.fail(err);
            return;
        }
        let bean = &mut *cx.bean;
        match &self.handler {
            Handler::Pipe(f) => {
                if let Err(err) = self.run(|| f(bean, &args, pipe.clone())) {
                    pipe.fail(err);
                }
            }
            _ => {
                pipe.fail(self.shape_error("pipe"));
            }
        }
    }
}

/// Marks the stub modified after every invocation of its delegate
struct ModifyAdapter {
    info: MethodInfo,
    delegate: Box<dyn MethodAdapter>,
}

impl MethodAdapter for ModifyAdapter {
    fn info(&self) -> &MethodInfo {
        &self.info
    }

    fn send(&self, cx: &mut Invocation<'_>, args: Args) {
        self.delegate.send(cx, args);
        cx.mark_modified();
    }

    fn query(&self, cx: &mut Invocation<'_>, args: Args, reply: ReplySink) {
        self.delegate.query(cx, args, reply);
        cx.mark_modified();
    }

    fn stream(&self, cx: &mut Invocation<'_>, args: Args, sink: StreamSink) {
        self.delegate.stream(cx, args, sink);
        cx.mark_modified();
    }

    fn pipe(&self, cx: &mut Invocation<'_>, args: Args, pipe: PipeOut) {
        self.delegate.pipe(cx, args, pipe);
        cx.mark_modified();
    }
}

/// Placeholder for a name with no method; fails every call
struct NotFoundAdapter {
    info: MethodInfo,
}

impl NotFoundAdapter {
    fn new(name: &str) -> Self {
        Self {
            info: MethodInfo {
                name: name.to_string(),
                kind: MethodKind::Send,
                modify: false,
                direct: false,
                arity: None,
                found: false,
            },
        }
    }

    fn error(&self, cx: &Invocation<'_>) -> DispatchError {
        DispatchError::method_not_found(cx.address.as_str(), &self.info.name)
    }
}

impl MethodAdapter for NotFoundAdapter {
    fn info(&self) -> &MethodInfo {
        &self.info
    }

    fn send(&self, cx: &mut Invocation<'_>, _args: Args) {
        tracing::warn!(address = %cx.address, method = %self.info.name, "send to unknown method");
    }

    fn query(&self, cx: &mut Invocation<'_>, _args: Args, reply: ReplySink) {
        reply.fail(self.error(cx));
    }

    fn stream(&self, cx: &mut Invocation<'_>, _args: Args, sink: StreamSink) {
        sink.fail(self.error(cx));
    }

    fn pipe(&self, cx: &mut Invocation<'_>, _args: Args, pipe: PipeOut) {
        pipe.fail(self.error(cx));
    }
}

/// What one delivered batch did, passed to the after-batch hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Messages delivered to this stub in the batch
    pub delivered: usize,
    /// Whether any modify method ran
    pub modified: bool,
}

/// A child stub produced by a lookup hook
pub struct Child {
    pub(crate) bean: Box<Bean>,
    pub(crate) table: Arc<MethodTable>,
}

impl Child {
    /// Pair a bean with its method table
    pub fn new<C: Send + 'static>(bean: C, table: Arc<MethodTable>) -> Result<Self, RegistrationError> {
        table.check_bean::<C>()?;
        Ok(Self {
            bean: Box::new(bean),
            table,
        })
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("bean", &self.table.bean_type_name)
            .finish()
    }
}

/// Deferred state update produced by a load hook and applied on the delivery path
pub(crate) type Loaded = Box<dyn FnOnce(&mut Bean) -> anyhow::Result<()> + Send>;

type InitHook = Box<dyn Fn(&mut Bean) -> anyhow::Result<()> + Send + Sync>;
type LoadHook = Box<dyn Fn(&Bean) -> BoxFuture<'static, anyhow::Result<Loaded>> + Send + Sync>;
type SaveHook = Box<dyn Fn(&Bean) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ShutdownHook = Box<dyn Fn(&mut Bean, ShutdownMode) + Send + Sync>;
type LookupHook = Box<dyn Fn(&mut Bean, &str) -> Option<Child> + Send + Sync>;
type BatchHook = Box<dyn Fn(&mut Bean) + Send + Sync>;
type AfterBatchHook = Box<dyn Fn(&mut Bean, &BatchSummary) + Send + Sync>;
type UnsubscribeHook = Box<dyn Fn(&mut Bean, PipeId) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    init: Option<InitHook>,
    load: Option<LoadHook>,
    save: Option<SaveHook>,
    shutdown: Option<ShutdownHook>,
    lookup: Option<LookupHook>,
    before_batch: Option<BatchHook>,
    after_batch: Option<AfterBatchHook>,
    unsubscribe: Option<UnsubscribeHook>,
}

/// Read-only method table for one service type
pub struct MethodTable {
    methods: BTreeMap<String, Arc<dyn MethodAdapter>>,
    bean_type: TypeId,
    bean_type_name: &'static str,
    hooks: Hooks,
}

impl MethodTable {
    /// Start building a table for bean type `B`
    pub fn builder<B: Send + 'static>() -> MethodTableBuilder<B> {
        MethodTableBuilder {
            methods: Vec::new(),
            hooks: Hooks::default(),
            _bean: PhantomData,
        }
    }

    /// Adapter for `name`; unknown names get an adapter that always fails
    pub fn get(&self, name: &str) -> Arc<dyn MethodAdapter> {
        match self.methods.get(name) {
            Some(adapter) => adapter.clone(),
            None => Arc::new(NotFoundAdapter::new(name)),
        }
    }

    /// Whether a method named `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Description of `name`, if it exists
    pub fn info(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.get(name).map(|adapter| adapter.info())
    }

    /// All adapters, ordered by name
    pub fn methods(&self) -> impl Iterator<Item = &Arc<dyn MethodAdapter>> {
        self.methods.values()
    }

    /// Name of the bean type the table was built for
    pub fn bean_type_name(&self) -> &'static str {
        self.bean_type_name
    }

    /// Whether the table declares an init, load, or save hook
    pub fn needs_load(&self) -> bool {
        self.hooks.init.is_some() || self.hooks.load.is_some() || self.hooks.save.is_some()
    }

    /// Whether checkpoints persist anything
    pub fn has_save(&self) -> bool {
        self.hooks.save.is_some()
    }

    /// Whether the table can produce child stubs
    pub fn has_lookup(&self) -> bool {
        self.hooks.lookup.is_some()
    }

    pub(crate) fn check_bean<B: 'static>(&self) -> Result<(), RegistrationError> {
        if TypeId::of::<B>() == self.bean_type {
            Ok(())
        } else {
            Err(RegistrationError::BeanMismatch {
                expected: self.bean_type_name.to_string(),
                actual: std::any::type_name::<B>().to_string(),
            })
        }
    }

    pub(crate) fn init(&self, bean: &mut Bean) -> anyhow::Result<()> {
        match &self.hooks.init {
            Some(hook) => guarded("on_init", || hook(bean)),
            None => Ok(()),
        }
    }

    pub(crate) fn load(&self, bean: &Bean) -> Option<BoxFuture<'static, anyhow::Result<Loaded>>> {
        let hook = self.hooks.load.as_ref()?;
        Some(match guarded("on_load", || Ok(hook(bean))) {
            Ok(future) => future,
            Err(err) => futures::future::ready(Err::<Loaded, _>(err)).boxed(),
        })
    }

    pub(crate) fn save(&self, bean: &Bean) -> Option<BoxFuture<'static, anyhow::Result<()>>> {
        let hook = self.hooks.save.as_ref()?;
        Some(match guarded("on_save", || Ok(hook(bean))) {
            Ok(future) => future,
            Err(err) => futures::future::ready(Err::<(), _>(err)).boxed(),
        })
    }

    pub(crate) fn shutdown(&self, bean: &mut Bean, mode: ShutdownMode) {
        if let Some(hook) = &self.hooks.shutdown {
            if let Err(err) = guarded("on_shutdown", || {
                hook(bean, mode);
                Ok(())
            }) {
                tracing::warn!(error = %err, "shutdown hook failed");
            }
        }
    }

    pub(crate) fn lookup(&self, bean: &mut Bean, path: &str) -> Option<Child> {
        let hook = self.hooks.lookup.as_ref()?;
        match guarded("on_lookup", || Ok(hook(bean, path))) {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(path, error = %err, "lookup hook failed");
                None
            }
        }
    }

    pub(crate) fn before_batch(&self, bean: &mut Bean) {
        if let Some(hook) = &self.hooks.before_batch {
            if let Err(err) = guarded("before_batch", || {
                hook(bean);
                Ok(())
            }) {
                tracing::warn!(error = %err, "before-batch hook failed");
            }
        }
    }

    pub(crate) fn after_batch(&self, bean: &mut Bean, summary: &BatchSummary) {
        if let Some(hook) = &self.hooks.after_batch {
            if let Err(err) = guarded("after_batch", || {
                hook(bean, summary);
                Ok(())
            }) {
                tracing::warn!(error = %err, "after-batch hook failed");
            }
        }
    }

    pub(crate) fn unsubscribe(&self, bean: &mut Bean, pipe: PipeId) {
        if let Some(hook) = &self.hooks.unsubscribe {
            if let Err(err) = guarded("on_unsubscribe", || {
                hook(bean, pipe);
                Ok(())
            }) {
                tracing::warn!(%pipe, error = %err, "unsubscribe hook failed");
            }
        }
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("bean", &self.bean_type_name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Definition of one method for bean type `B`
pub struct MethodDef<B> {
    name: String,
    modify: bool,
    direct: bool,
    arity: Option<usize>,
    handler: Handler,
    _bean: PhantomData<fn(&mut B)>,
}

impl<B: Send + 'static> MethodDef<B> {
    fn with_handler(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            modify: false,
            direct: false,
            arity: None,
            handler,
            _bean: PhantomData,
        }
    }

    /// Fire-and-forget method
    pub fn send<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut B, &Args) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_handler(
            name,
            Handler::Send(Box::new(move |bean: &mut Bean, args: &Args| {
                f(downcast::<B>(bean)?, args)
            })),
        )
    }

    /// Method returning one serializable result
    pub fn query<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut B, &Args) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        Self::with_handler(
            name,
            Handler::Query(Box::new(move |bean: &mut Bean, args: &Args| {
                let result = f(downcast::<B>(bean)?, args)?;
                Ok(serde_json::to_value(result)?)
            })),
        )
    }

    /// Query method that resolves its reply itself, possibly later
    pub fn query_with<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut B, &Args, ReplySink) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_handler(
            name,
            Handler::Reply(Box::new(move |bean: &mut Bean, args: &Args, reply| {
                f(downcast::<B>(bean)?, args, reply)
            })),
        )
    }

    /// Method publishing a finite stream; completed when the body returns
    pub fn stream<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut B, &Args, &StreamSink) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_handler(
            name,
            Handler::Stream(Box::new(move |bean: &mut Bean, args: &Args, sink: &StreamSink| {
                f(downcast::<B>(bean)?, args, sink)
            })),
        )
    }

    /// Method receiving a credit-bounded publisher it may keep
    pub fn pipe<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut B, &Args, PipeOut) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_handler(
            name,
            Handler::Pipe(Box::new(move |bean: &mut Bean, args: &Args, pipe| {
                f(downcast::<B>(bean)?, args, pipe)
            })),
        )
    }

    /// Journal calls and mark the stub modified
    pub fn modify(mut self) -> Self {
        self.modify = true;
        self
    }

    /// Admit calls past the inbox capacity bound
    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    /// Require exactly `n` arguments
    pub fn arity(mut self, n: usize) -> Self {
        self.arity = Some(n);
        self
    }

    fn into_adapter(self) -> Result<(String, Arc<dyn MethodAdapter>), RegistrationError> {
        let kind = self.handler.kind();
        if self.modify && self.direct {
            return Err(RegistrationError::DirectModify(self.name));
        }
        if self.modify && !matches!(kind, MethodKind::Send | MethodKind::Query) {
            return Err(RegistrationError::ModifyShape(self.name));
        }
        let info = MethodInfo {
            name: self.name.clone(),
            kind,
            modify: self.modify,
            direct: self.direct,
            arity: self.arity,
            found: true,
        };
        let adapter = FnAdapter {
            info: info.clone(),
            handler: self.handler,
        };
        let adapter: Arc<dyn MethodAdapter> = if self.modify {
            Arc::new(ModifyAdapter {
                info,
                delegate: Box::new(adapter),
            })
        } else {
            Arc::new(adapter)
        };
        Ok((self.name, adapter))
    }
}

/// Builder for a [`MethodTable`]
pub struct MethodTableBuilder<B> {
    methods: Vec<MethodDef<B>>,
    hooks: Hooks,
    _bean: PhantomData<fn(&mut B)>,
}

impl<B: Send + 'static> MethodTableBuilder<B> {
    /// Add a method
    pub fn method(mut self, def: MethodDef<B>) -> Self {
        self.methods.push(def);
        self
    }

    /// Synchronous initialization before any load or replay
    pub fn on_init<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks.init = Some(Box::new(move |bean: &mut Bean| f(downcast::<B>(bean)?)));
        self
    }

    /// Asynchronous load: `fetch` runs off the delivery path and `apply`
    /// installs its result on the bean before replay
    pub fn on_load<F, Fut, T, A>(mut self, fetch: F, apply: A) -> Self
    where
        F: Fn(&B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        A: Fn(&mut B, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let apply = Arc::new(apply);
        self.hooks.load = Some(Box::new(move |bean: &Bean| {
            let Some(bean) = bean.downcast_ref::<B>() else {
                return futures::future::ready(Err(anyhow::anyhow!(
                    "bean is not a {}",
                    std::any::type_name::<B>()
                )))
                .boxed();
            };
            let apply = apply.clone();
            fetch(bean)
                .map(move |fetched| {
                    fetched.map(|value| {
                        Box::new(move |bean: &mut Bean| apply(downcast::<B>(bean)?, value)) as Loaded
                    })
                })
                .boxed()
        }));
        self
    }

    /// Asynchronous checkpoint; the closure snapshots the bean and returns
    /// the write
    pub fn on_save<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.save = Some(Box::new(move |bean: &Bean| match bean.downcast_ref::<B>() {
            Some(bean) => f(bean).boxed(),
            None => futures::future::ready(Err(anyhow::anyhow!(
                "bean is not a {}",
                std::any::type_name::<B>()
            )))
            .boxed(),
        }));
        self
    }

    /// Called once when the stub closes
    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B, ShutdownMode) + Send + Sync + 'static,
    {
        self.hooks.shutdown = Some(Box::new(move |bean: &mut Bean, mode| {
            if let Some(bean) = bean.downcast_mut::<B>() {
                f(bean, mode);
            }
        }));
        self
    }

    /// Produce a child stub for a lookup path
    pub fn on_lookup<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B, &str) -> Option<Child> + Send + Sync + 'static,
    {
        self.hooks.lookup = Some(Box::new(move |bean: &mut Bean, path: &str| {
            bean.downcast_mut::<B>().and_then(|bean| f(bean, path))
        }));
        self
    }

    /// Called once before each delivered batch
    pub fn before_batch<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B) + Send + Sync + 'static,
    {
        self.hooks.before_batch = Some(Box::new(move |bean: &mut Bean| {
            if let Some(bean) = bean.downcast_mut::<B>() {
                f(bean);
            }
        }));
        self
    }

    /// Called once after each delivered batch
    pub fn after_batch<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B, &BatchSummary) + Send + Sync + 'static,
    {
        self.hooks.after_batch = Some(Box::new(move |bean: &mut Bean, summary: &BatchSummary| {
            if let Some(bean) = bean.downcast_mut::<B>() {
                f(bean, summary);
            }
        }));
        self
    }

    /// Called when a consumer cancels a pipe this stub publishes
    pub fn on_unsubscribe<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut B, PipeId) + Send + Sync + 'static,
    {
        self.hooks.unsubscribe = Some(Box::new(move |bean: &mut Bean, pipe| {
            if let Some(bean) = bean.downcast_mut::<B>() {
                f(bean, pipe);
            }
        }));
        self
    }

    /// Validate and freeze the table
    pub fn build(self) -> Result<Arc<MethodTable>, RegistrationError> {
        let mut seen = HashSet::new();
        let mut methods = BTreeMap::new();
        for def in self.methods {
            if !seen.insert(def.name.clone()) {
                return Err(RegistrationError::DuplicateMethod(def.name));
            }
            let (name, adapter) = def.into_adapter()?;
            methods.insert(name, adapter);
        }
        Ok(Arc::new(MethodTable {
            methods,
            bean_type: TypeId::of::<B>(),
            bean_type_name: std::any::type_name::<B>(),
            hooks: self.hooks,
        }))
    }
}

impl<B: Send + Serialize + DeserializeOwned + 'static> MethodTableBuilder<B> {
    /// Load the bean from `vault` document `id` and checkpoint it back there
    pub fn vault(self, vault: Arc<dyn Vault>, id: impl Into<String>) -> Self {
        let id: Arc<str> = Arc::from(id.into());
        let load_vault = vault.clone();
        let load_id = id.clone();
        self.on_load(
            move |_bean: &B| load_vault.load(&load_id),
            |bean: &mut B, document: Option<Value>| {
                if let Some(document) = document {
                    *bean = serde_json::from_value(document)?;
                }
                Ok(())
            },
        )
        .on_save(move |bean: &B| {
            let document = serde_json::to_value(bean);
            let vault = vault.clone();
            let id = id.clone();
            async move { vault.save(&id, document?).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    fn counter_table() -> Arc<MethodTable> {
        MethodTable::builder::<Counter>()
            .method(
                MethodDef::send("add", |c: &mut Counter, args| {
                    c.value += args.get::<i64>(0)?;
                    Ok(())
                })
                .modify()
                .arity(1),
            )
            .method(MethodDef::query("get", |c: &mut Counter, _| Ok(c.value)))
            .method(MethodDef::query("fail", |_: &mut Counter, _| -> anyhow::Result<i64> {
                anyhow::bail!("nope")
            }))
            .method(MethodDef::query("panic", |_: &mut Counter, _| -> anyhow::Result<i64> {
                panic!("kaboom")
            }))
            .method(MethodDef::stream("range", |c: &mut Counter, args, sink| {
                let n = args.get::<i64>(0)?;
                for i in 0..n {
                    sink.next(json!(c.value + i));
                }
                Ok(())
            }))
            .method(MethodDef::pipe("feed", |_: &mut Counter, _, pipe| {
                pipe.try_next(json!("hello"))?;
                Ok(())
            }))
            .build()
            .unwrap()
    }

    struct Fixture {
        bean: Box<Bean>,
        address: Address,
        modified: bool,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bean: Box::new(Counter::default()),
                address: Address::parse("counter").unwrap(),
                modified: false,
            }
        }

        fn cx(&mut self) -> Invocation<'_> {
            Invocation::new(self.bean.as_mut(), &self.address, &mut self.modified)
        }

        fn value(&self) -> i64 {
            self.bean.downcast_ref::<Counter>().unwrap().value
        }
    }

    #[tokio::test]
    async fn test_send_then_query() {
        let table = counter_table();
        let mut fx = Fixture::new();

        table.get("add").send(&mut fx.cx(), Args::new(vec![json!(5)]));
        assert_eq!(fx.value(), 5);
        assert!(fx.modified);

        let (reply, result) = ReplySink::channel("counter");
        table.get("get").query(&mut fx.cx(), Args::empty(), reply);
        assert_eq!(result.await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_argument_mismatch_is_illegal_argument() {
        let table = counter_table();
        let mut fx = Fixture::new();

        let (reply, result) = ReplySink::channel("counter");
        table.get("add").query(&mut fx.cx(), Args::empty(), reply);
        assert!(matches!(
            result.await,
            Err(DispatchError::IllegalArgument { .. })
        ));

        let (reply, result) = ReplySink::channel("counter");
        table
            .get("add")
            .query(&mut fx.cx(), Args::new(vec![json!("five")]), reply);
        assert!(matches!(
            result.await,
            Err(DispatchError::IllegalArgument { .. })
        ));
    }

    #[tokio::test]
    async fn test_modify_marks_even_on_failure() {
        let table = counter_table();
        let mut fx = Fixture::new();
        let (reply, result) = ReplySink::channel("counter");
        table.get("add").query(&mut fx.cx(), Args::empty(), reply);
        assert!(result.await.is_err());
        assert!(fx.modified);
    }

    #[tokio::test]
    async fn test_user_error_and_panic_are_caught() {
        let table = counter_table();
        let mut fx = Fixture::new();

        let (reply, result) = ReplySink::channel("counter");
        table.get("fail").query(&mut fx.cx(), Args::empty(), reply);
        assert_eq!(result.await, Err(DispatchError::Service("nope".into())));

        let (reply, result) = ReplySink::channel("counter");
        table.get("panic").query(&mut fx.cx(), Args::empty(), reply);
        match result.await {
            Err(DispatchError::Service(detail)) => assert!(detail.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let table = counter_table();
        let mut fx = Fixture::new();
        let adapter = table.get("missing");
        assert!(!adapter.info().found);

        let (reply, result) = ReplySink::channel("counter");
        adapter.query(&mut fx.cx(), Args::empty(), reply);
        assert_eq!(
            result.await,
            Err(DispatchError::method_not_found("counter", "missing"))
        );
    }

    #[tokio::test]
    async fn test_shape_mismatches() {
        let table = counter_table();
        let mut fx = Fixture::new();
        fx.bean.downcast_mut::<Counter>().unwrap().value = 7;

        // send-shaped as query replies null
        let (reply, result) = ReplySink::channel("counter");
        table
            .get("add")
            .query(&mut fx.cx(), Args::new(vec![json!(1)]), reply);
        assert_eq!(result.await, Ok(Value::Null));

        // query-shaped as stream emits one value
        let (sink, stream) = StreamSink::channel("counter");
        table.get("get").stream(&mut fx.cx(), Args::empty(), sink);
        assert_eq!(stream.collect_values().await.unwrap(), vec![json!(8)]);

        // stream-shaped as stream
        let (sink, stream) = StreamSink::channel("counter");
        table
            .get("range")
            .stream(&mut fx.cx(), Args::new(vec![json!(3)]), sink);
        assert_eq!(
            stream.collect_values().await.unwrap(),
            vec![json!(8), json!(9), json!(10)]
        );

        // query-shaped as pipe fails the pipe
        let (out, mut input) =
            super::super::pipe::pipe(super::super::credits::FlowMode::Credit { initial: 1 }, "counter");
        table.get("get").pipe(&mut fx.cx(), Args::empty(), out);
        use futures::StreamExt;
        assert!(matches!(
            input.next().await,
            Some(Err(DispatchError::IllegalArgument { .. }))
        ));
    }

    #[test]
    fn test_build_rejects_invalid_tables() {
        let duplicate = MethodTable::builder::<Counter>()
            .method(MethodDef::send("a", |_: &mut Counter, _| Ok(())))
            .method(MethodDef::send("a", |_: &mut Counter, _| Ok(())))
            .build();
        assert_eq!(
            duplicate.unwrap_err(),
            RegistrationError::DuplicateMethod("a".into())
        );

        let direct_modify = MethodTable::builder::<Counter>()
            .method(MethodDef::send("a", |_: &mut Counter, _| Ok(())).modify().direct())
            .build();
        assert_eq!(
            direct_modify.unwrap_err(),
            RegistrationError::DirectModify("a".into())
        );

        let modify_stream = MethodTable::builder::<Counter>()
            .method(MethodDef::stream("s", |_: &mut Counter, _, _| Ok(())).modify())
            .build();
        assert_eq!(
            modify_stream.unwrap_err(),
            RegistrationError::ModifyShape("s".into())
        );
    }

    #[test]
    fn test_table_metadata() {
        let table = counter_table();
        assert!(!table.needs_load());
        assert!(table.contains("range"));
        assert_eq!(table.info("add").unwrap().kind, MethodKind::Send);
        assert!(table.info("add").unwrap().modify);
        assert!(table.check_bean::<Counter>().is_ok());
        assert!(table.check_bean::<String>().is_err());
        assert_eq!(table.methods().count(), 6);
    }
}
