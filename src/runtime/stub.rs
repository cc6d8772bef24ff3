//! Stubs: the per-address owners of a service bean
//!
//! A service is a tree of stubs held in an arena and owned by one delivery
//! loop. The root is the registered bean; children are produced on demand by
//! the root's lookup hook and share the root's inbox. Each stub moves through
//! the load states, buffers arrivals while loading, journals modify calls
//! before running them, and checkpoints through its save hook.
//!
//! Loads, replays, and saves run as futures on the delivery loop's op set;
//! their outcomes come back through [`StubTree::complete`], so all bean access
//! stays on the delivery path.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::error::{DispatchError, JournalResult};
use super::inbox::Ops;
use super::journal::{JournalEntry, JournalStore, StubJournal};
use super::lifecycle::{LoadState, ShutdownMode};
use super::message::{Address, Args, Body, Message, Sink, Value};
use super::method::{BatchSummary, Bean, Invocation, Loaded, MethodTable, guarded};
use super::pipe::{PipeId, PipeOut};
use super::sink::ReplySink;

/// Arena index of a stub
pub(crate) type StubId = usize;

const ROOT: StubId = 0;

/// Result of an asynchronous stub operation
pub(crate) enum OpOutcome {
    Loaded(anyhow::Result<Loaded>),
    Replayed(JournalResult<Vec<JournalEntry>>),
    Saved(anyhow::Result<()>),
}

/// Settings shared by every stub of one service
#[derive(Clone)]
pub(crate) struct StubSettings {
    pub(crate) journal: Arc<dyn JournalStore>,
    pub(crate) save_interval: u64,
    pub(crate) load_timeout: Duration,
}

pub(crate) struct Stub {
    address: Address,
    bean: Box<Bean>,
    table: Arc<MethodTable>,
    state: LoadState,
    journal: StubJournal,
    parent: Option<StubId>,
    children: Vec<StubId>,
    /// Arrivals held while the stub is not yet active
    pending: VecDeque<Message>,
    pipes: HashMap<PipeId, PipeOut>,

    // Per-batch bookkeeping
    touched: bool,
    delivered: usize,
    modified: bool,

    checkpoint_requested: bool,
    checkpoint_waiters: Vec<ReplySink>,
    save_waiters: Vec<ReplySink>,
    closing: Option<ShutdownMode>,
    shutdown_waiters: Vec<ReplySink>,
}

impl Stub {
    fn new(
        address: Address,
        bean: Box<Bean>,
        table: Arc<MethodTable>,
        journal: StubJournal,
        parent: Option<StubId>,
    ) -> Self {
        // Nothing to load or replay: skip straight to active.
        let state = if table.needs_load() || journal.is_durable() {
            LoadState::New
        } else {
            LoadState::Active
        };
        Self {
            address,
            bean,
            table,
            state,
            journal,
            parent,
            children: Vec::new(),
            pending: VecDeque::new(),
            pipes: HashMap::new(),
            touched: false,
            delivered: 0,
            modified: false,
            checkpoint_requested: false,
            checkpoint_waiters: Vec::new(),
            save_waiters: Vec::new(),
            closing: None,
            shutdown_waiters: Vec::new(),
        }
    }

    fn closed_error(&self) -> DispatchError {
        DispatchError::ServiceClosed(self.address.to_string())
    }

    fn set_state(&mut self, next: LoadState) {
        if self.state.can_transition_to(next) {
            tracing::trace!(address = %self.address, from = %self.state, to = %next, "load state");
            self.state = next;
        } else {
            tracing::warn!(address = %self.address, from = %self.state, to = %next, "ignoring illegal load state transition");
        }
    }

    /// Run one method call against the bean
    fn invoke(&mut self, method: &str, args: Args, sink: Sink, replay: bool) {
        let adapter = self.table.get(method);

        if adapter.is_modify() && !replay {
            let written = match sink {
                Sink::None => self.journal.write_send(method, &args),
                _ => self.journal.write_query(method, &args),
            };
            if let Err(err) = written {
                let err = DispatchError::JournalWriteFailed(err.to_string());
                tracing::warn!(address = %self.address, method, error = %err, "continuing without durability");
            }
        }

        let mut cx = Invocation::new(&mut *self.bean, &self.address, &mut self.modified);
        match sink {
            Sink::None => adapter.send(&mut cx, args),
            Sink::Reply(reply) => adapter.query(&mut cx, args, reply),
            Sink::Stream(stream) => adapter.stream(&mut cx, args, stream),
            Sink::Pipe(pipe) => {
                let registered = pipe.clone();
                adapter.pipe(&mut cx, args, pipe);
                if !registered.is_closed() {
                    self.pipes.insert(registered.id(), registered);
                }
            }
        }
        self.delivered += 1;
    }

    fn flush_journal(&mut self) {
        if let Err(err) = self.journal.flush() {
            tracing::warn!(address = %self.address, error = %err, "journal flush failed");
        }
    }
}

/// Resolve a message that will never be dispatched
fn reject(message: Message, err: DispatchError) {
    match message.body {
        Body::Shutdown {
            reply: Some(reply), ..
        } => {
            reply.ok(Value::Null);
        }
        body => Message { body, ..message }.fail(err),
    }
}

enum Target {
    Stub(StubId),
    Defer,
    Missing(DispatchError),
}

/// All stubs of one service
pub(crate) struct StubTree {
    stubs: Vec<Stub>,
    by_path: HashMap<String, StubId>,
    settings: StubSettings,
    depth: usize,
}

impl StubTree {
    pub(crate) fn new(
        address: Address,
        bean: Box<Bean>,
        table: Arc<MethodTable>,
        journal_key: String,
        settings: StubSettings,
    ) -> Self {
        let journal = StubJournal::new(settings.journal.clone(), journal_key, settings.save_interval);
        let root = Stub::new(address, bean, table, journal, None);
        Self {
            stubs: vec![root],
            by_path: HashMap::new(),
            settings,
            depth: 0,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stubs[ROOT].state.is_terminal()
    }

    #[cfg(test)]
    fn state(&self, path: Option<&str>) -> Option<LoadState> {
        let id = match path {
            None => ROOT,
            Some(path) => *self.by_path.get(path)?,
        };
        Some(self.stubs[id].state)
    }

    /// Deliver one batch taken from the inbox
    pub(crate) fn deliver_batch(&mut self, batch: Vec<Message>, ops: &Ops) {
        self.in_batch(ops, |tree, ops| {
            for message in batch {
                tree.route(message, ops);
            }
        });
    }

    /// Apply the outcome of a load, replay, or save
    pub(crate) fn complete(&mut self, id: StubId, outcome: OpOutcome, ops: &Ops) {
        match outcome {
            OpOutcome::Loaded(result) => {
                if self.stubs[id].state != LoadState::Loading {
                    tracing::debug!(address = %self.stubs[id].address, "discarding load result for stub that is no longer loading");
                    return;
                }
                let applied = result.and_then(|apply| {
                    let stub = &mut self.stubs[id];
                    guarded("on_load", || apply(&mut *stub.bean))
                });
                match applied {
                    Ok(()) => self.begin_replay(id, ops),
                    Err(err) => self.fail_load(id, DispatchError::Service(format!("load failed: {err:#}"))),
                }
            }
            OpOutcome::Replayed(result) => {
                if self.stubs[id].state != LoadState::Replaying {
                    return;
                }
                match result {
                    Ok(entries) => {
                        self.replay(id, entries);
                        self.activate(id, ops);
                    }
                    Err(err) => self.fail_load(id, DispatchError::ReplayFailed(err.to_string())),
                }
            }
            OpOutcome::Saved(result) => self.finish_save(id, result, true, ops),
        }
    }

    /// Close every stub, root last
    pub(crate) fn close_all(&mut self, mode: ShutdownMode) {
        for id in (0..self.stubs.len()).rev() {
            self.close(id, mode);
        }
    }

    fn in_batch(&mut self, ops: &Ops, f: impl FnOnce(&mut Self, &Ops)) {
        self.depth += 1;
        f(self, ops);
        self.depth -= 1;
        if self.depth == 0 {
            self.finish_batch(ops);
        }
    }

    fn resolve(&mut self, address: &Address) -> Target {
        let Some(path) = address.path() else {
            return Target::Stub(ROOT);
        };
        if let Some(&id) = self.by_path.get(path) {
            return Target::Stub(id);
        }

        let id = self.stubs.len();
        let root = &mut self.stubs[ROOT];
        match root.state {
            LoadState::Active if root.closing.is_none() => {}
            LoadState::Active | LoadState::Closed => return Target::Missing(root.closed_error()),
            LoadState::New | LoadState::Loading | LoadState::Replaying => return Target::Defer,
        }
        let Some(child) = root.table.lookup(&mut *root.bean, path) else {
            return Target::Missing(DispatchError::ServiceNotFound(address.to_string()));
        };

        let key = format!("{}/{}", root.journal.key(), path);
        root.children.push(id);
        let journal = StubJournal::new(self.settings.journal.clone(), key, self.settings.save_interval);
        self.stubs.push(Stub::new(address.clone(), child.bean, child.table, journal, Some(ROOT)));
        self.by_path.insert(path.to_string(), id);
        tracing::debug!(%address, "child stub created");
        Target::Stub(id)
    }

    fn route(&mut self, message: Message, ops: &Ops) {
        match self.resolve(&message.address) {
            Target::Stub(id) => self.route_to(id, message, ops),
            Target::Defer => {
                self.stubs[ROOT].pending.push_back(message);
                self.begin_load(ROOT, ops);
            }
            Target::Missing(err) => reject(message, err),
        }
    }

    fn route_to(&mut self, id: StubId, message: Message, ops: &Ops) {
        let state = self.stubs[id].state;
        match message.body {
            Body::Cancel { pipe } if state.defers() => {
                // The pipe call it cancels may still be pending.
                self.stubs[id].pending.push_back(Message {
                    body: Body::Cancel { pipe },
                    ..message
                });
            }
            Body::Cancel { pipe } => self.cancel_pipe(id, pipe),
            Body::Shutdown { mode, reply } if mode == ShutdownMode::Graceful && state.is_loading() => {
                self.stubs[id].pending.push_back(Message {
                    body: Body::Shutdown { mode, reply },
                    ..message
                });
            }
            Body::Shutdown { mode, reply } => self.shutdown(id, mode, reply, ops),
            body => {
                let message = Message { body, ..message };
                let stub = &mut self.stubs[id];
                if state.accepts_dispatch() && stub.closing.is_none() {
                    self.dispatch(id, message);
                } else if state.defers() {
                    stub.pending.push_back(message);
                    if state == LoadState::New {
                        self.begin_load(id, ops);
                    }
                } else {
                    let err = stub.closed_error();
                    reject(message, err);
                }
            }
        }
    }

    /// Deliver one message to an active stub
    fn dispatch(&mut self, id: StubId, message: Message) {
        if message.is_expired() {
            let what = message.method().unwrap_or("control").to_string();
            tracing::debug!(address = %message.address, correlation = %message.correlation_id(), method = %what, "deadline passed before delivery");
            let err = DispatchError::Timeout(format!("{}.{what}", message.address));
            message.fail(err);
            return;
        }

        self.touch(id);
        let stub = &mut self.stubs[id];
        let Message { headers, body, .. } = message;
        match body {
            Body::Call { method, args, sink } => stub.invoke(&method, args, sink, headers.replay),
            Body::Activate { reply } => {
                if let Some(reply) = reply {
                    reply.ok(Value::Null);
                }
            }
            Body::Checkpoint { reply } => {
                stub.checkpoint_waiters.extend(reply);
                stub.checkpoint_requested = true;
            }
            // Routed before dispatch.
            Body::Shutdown { reply, .. } => {
                if let Some(reply) = reply {
                    reply.ok(Value::Null);
                }
            }
            Body::Cancel { .. } => {}
        }
    }

    /// Run before-batch hooks the first time a stub sees a message in this batch
    fn touch(&mut self, id: StubId) {
        if self.stubs[id].touched {
            return;
        }
        if let Some(parent) = self.stubs[id].parent {
            self.touch(parent);
        }
        let stub = &mut self.stubs[id];
        stub.touched = true;
        stub.table.before_batch(&mut *stub.bean);
    }

    fn finish_batch(&mut self, ops: &Ops) {
        // Children have larger ids, so they finish before their parent.
        for id in (0..self.stubs.len()).rev() {
            if !self.stubs[id].touched {
                continue;
            }
            if let Some(parent) = self.after_batch(id) {
                self.stubs[parent].modified = true;
            }
            self.maybe_save(id, ops);
        }
    }

    /// Returns the parent to propagate modification to
    fn after_batch(&mut self, id: StubId) -> Option<StubId> {
        let stub = &mut self.stubs[id];
        let summary = BatchSummary {
            delivered: stub.delivered,
            modified: stub.modified,
        };
        stub.touched = false;
        stub.delivered = 0;
        stub.table.after_batch(&mut *stub.bean, &summary);
        stub.pipes.retain(|_, pipe| !pipe.is_closed() && !pipe.is_cancelled());

        if !summary.modified {
            return None;
        }
        stub.modified = false;
        stub.flush_journal();
        if stub.table.has_save() && stub.journal.is_save_request() {
            stub.checkpoint_requested = true;
        }
        tracing::trace!(address = %stub.address, delivered = summary.delivered, "modified batch flushed");
        stub.parent
    }

    fn maybe_save(&mut self, id: StubId, ops: &Ops) {
        let stub = &self.stubs[id];
        if stub.checkpoint_requested && !stub.journal.is_saving() && stub.state == LoadState::Active {
            self.begin_save(id, ops);
        }
    }

    fn begin_load(&mut self, id: StubId, ops: &Ops) {
        let stub = &mut self.stubs[id];
        if stub.state != LoadState::New {
            return;
        }
        if let Err(err) = stub.table.init(&mut *stub.bean) {
            self.fail_load(id, DispatchError::Service(format!("init failed: {err:#}")));
            return;
        }
        match stub.table.load(&*stub.bean) {
            Some(future) => {
                stub.set_state(LoadState::Loading);
                tracing::debug!(address = %stub.address, "loading");
                let timeout = self.settings.load_timeout;
                ops.push(
                    async move {
                        let result = match tokio::time::timeout(timeout, future).await {
                            Ok(result) => result,
                            Err(_) => Err(anyhow::anyhow!("load timed out after {timeout:?}")),
                        };
                        (id, OpOutcome::Loaded(result))
                    }
                    .boxed(),
                );
            }
            None => self.begin_replay(id, ops),
        }
    }

    fn begin_replay(&mut self, id: StubId, ops: &Ops) {
        let stub = &mut self.stubs[id];
        if !stub.journal.is_durable() {
            self.activate(id, ops);
            return;
        }
        stub.set_state(LoadState::Replaying);
        let source = stub.journal.replay_source();
        ops.push(async move { (id, OpOutcome::Replayed(source.await)) }.boxed());
    }

    /// Re-run journaled calls in their original order
    fn replay(&mut self, id: StubId, entries: Vec<JournalEntry>) {
        let stub = &mut self.stubs[id];
        stub.journal.observe_replay(&entries);
        let count = entries.len();
        for entry in entries {
            stub.invoke(&entry.method, entry.to_args(), Sink::None, true);
        }
        // Replayed state is already durable.
        stub.modified = false;
        stub.delivered = 0;
        if count > 0 {
            tracing::info!(address = %stub.address, entries = count, "journal replayed");
        }
    }

    fn activate(&mut self, id: StubId, ops: &Ops) {
        let stub = &mut self.stubs[id];
        if !stub.state.can_transition_to(LoadState::Active) {
            return;
        }
        stub.set_state(LoadState::Active);
        let pending: Vec<Message> = stub.pending.drain(..).collect();
        tracing::debug!(address = %stub.address, pending = pending.len(), "active");
        if pending.is_empty() {
            return;
        }
        // The whole backlog is delivered as one batch before any new arrival.
        self.in_batch(ops, |tree, ops| {
            for message in pending {
                tree.route(message, ops);
            }
        });
    }

    fn fail_load(&mut self, id: StubId, reason: DispatchError) {
        let stub = &mut self.stubs[id];
        tracing::error!(address = %stub.address, error = %reason, "load failed; closing");
        stub.set_state(LoadState::Closed);
        let closed = stub.closed_error();
        for message in stub.pending.drain(..) {
            match message.body {
                Body::Activate {
                    reply: Some(reply),
                } => {
                    reply.fail(reason.clone());
                }
                body => reject(Message { body, ..message }, closed.clone()),
            }
        }
        for reply in stub.shutdown_waiters.drain(..) {
            reply.ok(Value::Null);
        }
        let children = stub.children.clone();
        for child in children {
            self.close(child, ShutdownMode::Forced);
        }
    }

    fn begin_save(&mut self, id: StubId, ops: &Ops) {
        let stub = &mut self.stubs[id];
        stub.checkpoint_requested = false;
        stub.save_waiters.append(&mut stub.checkpoint_waiters);
        if let Err(err) = stub.journal.save_start() {
            tracing::warn!(address = %stub.address, error = %err, "journal flush before checkpoint failed");
        }
        match stub.table.save(&*stub.bean) {
            Some(future) => {
                tracing::debug!(address = %stub.address, "checkpoint started");
                ops.push(async move { (id, OpOutcome::Saved(future.await)) }.boxed());
            }
            // Nothing persisted, so the journal must be kept.
            None => self.finish_save(id, Ok(()), false, ops),
        }
    }

    fn finish_save(&mut self, id: StubId, result: anyhow::Result<()>, persisted: bool, ops: &Ops) {
        let stub = &mut self.stubs[id];
        if let Err(err) = stub.journal.save_end(persisted && result.is_ok()) {
            tracing::warn!(address = %stub.address, error = %err, "journal update after checkpoint failed");
        }
        let waiters = std::mem::take(&mut stub.save_waiters);
        match result {
            Ok(()) => {
                tracing::debug!(address = %stub.address, "checkpoint complete");
                for reply in waiters {
                    reply.ok(Value::Null);
                }
            }
            Err(err) => {
                tracing::error!(address = %stub.address, error = %format!("{err:#}"), "checkpoint failed");
                let err = DispatchError::Service(format!("checkpoint failed: {err:#}"));
                for reply in waiters {
                    reply.fail(err.clone());
                }
            }
        }

        if let Some(mode) = stub.closing {
            self.close(id, mode);
            return;
        }
        self.maybe_save(id, ops);
    }

    fn shutdown(&mut self, id: StubId, mode: ShutdownMode, reply: Option<ReplySink>, ops: &Ops) {
        let stub = &mut self.stubs[id];
        if stub.state.is_terminal() {
            if let Some(reply) = reply {
                reply.ok(Value::Null);
            }
            return;
        }
        stub.shutdown_waiters.extend(reply);

        match mode {
            ShutdownMode::Forced => self.close(id, mode),
            ShutdownMode::Graceful if stub.state != LoadState::Active => self.close(id, mode),
            ShutdownMode::Graceful => {
                if stub.closing.is_some() {
                    return;
                }
                stub.closing = Some(mode);
                tracing::info!(address = %stub.address, "graceful shutdown; final checkpoint");
                let children = stub.children.clone();
                for child in children {
                    self.shutdown(child, mode, None, ops);
                }
                if !self.stubs[id].journal.is_saving() {
                    self.begin_save(id, ops);
                }
            }
        }
    }

    fn close(&mut self, id: StubId, mode: ShutdownMode) {
        let stub = &mut self.stubs[id];
        if stub.state.is_terminal() {
            return;
        }
        let was_active = stub.state == LoadState::Active;
        stub.set_state(LoadState::Closed);
        stub.closing = None;
        if let Err(err) = stub.journal.save_end(false) {
            tracing::warn!(address = %stub.address, error = %err, "releasing held journal entries failed");
        }
        stub.flush_journal();
        if was_active {
            stub.table.shutdown(&mut *stub.bean, mode);
        }

        let closed = stub.closed_error();
        for message in stub.pending.drain(..) {
            reject(message, closed.clone());
        }
        for reply in stub.checkpoint_waiters.drain(..).chain(stub.save_waiters.drain(..)) {
            reply.fail(closed.clone());
        }
        for (_, pipe) in stub.pipes.drain() {
            pipe.close();
        }
        for reply in stub.shutdown_waiters.drain(..) {
            reply.ok(Value::Null);
        }
        tracing::info!(address = %stub.address, ?mode, "closed");

        // Children in a graceful shutdown close themselves after their save.
        let children = stub.children.clone();
        for child in children {
            if self.stubs[child].closing.is_none() {
                self.close(child, mode);
            }
        }
    }

    fn cancel_pipe(&mut self, id: StubId, pipe: PipeId) {
        if self.stubs[id].state != LoadState::Active {
            return;
        }
        self.touch(id);
        let stub = &mut self.stubs[id];
        match stub.pipes.remove(&pipe) {
            Some(out) => {
                out.close();
            }
            None => tracing::debug!(address = %stub.address, %pipe, "cancel for pipe no longer tracked"),
        }
        stub.table.unsubscribe(&mut *stub.bean, pipe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::journal::{MemoryJournal, NullJournal};
    use crate::runtime::method::{Child, MethodDef};
    use crate::runtime::sink::ReplySink;
    use futures::StreamExt;
    use futures::stream::FuturesUnordered;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Ledger {
        entries: Vec<i64>,
        batches: Arc<Mutex<Vec<BatchSummary>>>,
    }

    fn ledger_table(gate: Option<Arc<Mutex<Option<oneshot::Receiver<()>>>>>) -> Arc<MethodTable> {
        let mut builder = MethodTable::builder::<Ledger>()
            .method(
                MethodDef::send("push", |l: &mut Ledger, args| {
                    l.entries.push(args.get(0)?);
                    Ok(())
                })
                .modify(),
            )
            .method(MethodDef::query("all", |l: &mut Ledger, _| Ok(l.entries.clone())))
            .after_batch(|l: &mut Ledger, summary| l.batches.lock().push(*summary))
            .on_lookup(|_: &mut Ledger, path| {
                (path == "sub").then(|| Child::new(Ledger::default(), ledger_table(None)).ok())?
            });
        if let Some(gate) = gate {
            builder = builder.on_load(
                move |_: &Ledger| {
                    let rx = gate.lock().take();
                    async move {
                        if let Some(rx) = rx {
                            rx.await?;
                        }
                        Ok::<(), anyhow::Error>(())
                    }
                },
                |_: &mut Ledger, ()| Ok(()),
            );
        }
        builder.build().unwrap()
    }

    fn settings(journal: Arc<dyn JournalStore>) -> StubSettings {
        StubSettings {
            journal,
            save_interval: 100,
            load_timeout: Duration::from_secs(5),
        }
    }

    fn push(address: &Address, n: i64) -> Message {
        Message::call(address.clone(), "push", Args::new(vec![json!(n)]), Sink::None)
    }

    fn query(address: &Address) -> (Message, crate::runtime::sink::Reply) {
        let (reply, pending) = ReplySink::channel(address.as_str());
        (
            Message::call(address.clone(), "all", Args::empty(), Sink::Reply(reply)),
            pending,
        )
    }

    async fn drive(tree: &mut StubTree, ops: &mut Ops) {
        while let Some((id, outcome)) = ops.next().await {
            tree.complete(id, outcome, ops);
        }
    }

    fn ledger(address: &Address, table: Arc<MethodTable>, journal: Arc<dyn JournalStore>) -> StubTree {
        StubTree::new(
            address.clone(),
            Box::new(Ledger::default()),
            table,
            "ledger".into(),
            settings(journal),
        )
    }

    #[tokio::test]
    async fn test_pending_messages_dispatch_in_arrival_order() {
        let (open, gate) = oneshot::channel();
        let table = ledger_table(Some(Arc::new(Mutex::new(Some(gate)))));
        let address = Address::parse("ledger").unwrap();
        let mut tree = ledger(&address, table, Arc::new(NullJournal));
        let mut ops: Ops = FuturesUnordered::new();

        tree.deliver_batch(vec![push(&address, 1), push(&address, 2)], &ops);
        assert_eq!(tree.state(None), Some(LoadState::Loading));
        let (q, result) = query(&address);
        tree.deliver_batch(vec![push(&address, 3), q], &ops);

        open.send(()).unwrap();
        drive(&mut tree, &mut ops).await;
        assert_eq!(tree.state(None), Some(LoadState::Active));
        assert_eq!(result.await, Ok(json!([1, 2, 3])));
    }

    #[tokio::test]
    async fn test_replay_restores_without_rejournaling() {
        let journal = Arc::new(MemoryJournal::new());
        let address = Address::parse("ledger").unwrap();
        let mut ops: Ops = FuturesUnordered::new();

        let mut tree = ledger(&address, ledger_table(None), journal.clone());
        tree.deliver_batch(vec![push(&address, 4), push(&address, 5)], &ops);
        assert_eq!(tree.state(None), Some(LoadState::Replaying));
        drive(&mut tree, &mut ops).await;
        assert_eq!(journal.entries("ledger").len(), 2);

        let mut restarted = ledger(&address, ledger_table(None), journal.clone());
        let (q, result) = query(&address);
        restarted.deliver_batch(vec![q], &ops);
        drive(&mut restarted, &mut ops).await;
        assert_eq!(result.await, Ok(json!([4, 5])));
        assert_eq!(journal.entries("ledger").len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects() {
        let address = Address::parse("ledger").unwrap();
        let mut tree = ledger(&address, ledger_table(None), Arc::new(NullJournal));
        let ops: Ops = FuturesUnordered::new();

        let (reply, done) = ReplySink::channel("ledger");
        let shutdown = Message::new(
            address.clone(),
            Body::Shutdown {
                mode: ShutdownMode::Graceful,
                reply: Some(reply),
            },
        );
        let (q, rejected) = query(&address);
        tree.deliver_batch(vec![shutdown, q], &ops);
        assert!(tree.is_closed());
        assert_eq!(done.await, Ok(Value::Null));
        assert_eq!(
            rejected.await,
            Err(DispatchError::ServiceClosed("ledger".into()))
        );
    }

    #[tokio::test]
    async fn test_child_batches_propagate_modification() {
        let address = Address::parse("ledger").unwrap();
        let child = address.child("sub").unwrap();
        let root_batches = Arc::new(Mutex::new(Vec::new()));
        let bean = Ledger {
            entries: Vec::new(),
            batches: root_batches.clone(),
        };
        let mut tree = StubTree::new(
            address.clone(),
            Box::new(bean),
            ledger_table(None),
            "ledger".into(),
            settings(Arc::new(NullJournal)),
        );
        let ops: Ops = FuturesUnordered::new();

        let (q, result) = query(&child);
        tree.deliver_batch(vec![push(&child, 9), q], &ops);
        assert_eq!(result.await, Ok(json!([9])));
        assert_eq!(tree.state(Some("sub")), Some(LoadState::Active));
        assert_eq!(
            *root_batches.lock(),
            vec![BatchSummary {
                delivered: 0,
                modified: true
            }]
        );

        let (reply, missing) = ReplySink::channel("ledger/nope");
        let nope = Message::call(
            address.child("nope").unwrap(),
            "all",
            Args::empty(),
            Sink::Reply(reply),
        );
        tree.deliver_batch(vec![nope], &ops);
        assert_eq!(
            missing.await,
            Err(DispatchError::ServiceNotFound("ledger/nope".into()))
        );
    }
}
