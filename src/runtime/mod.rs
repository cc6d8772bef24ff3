//! Runtime orchestrator and public API
//!
//! The [`Runtime`] owns the storage root, the journal store shared by its
//! services, and the registry. Services are started from a bean and its
//! method table through a [`ServiceBuilder`]; each one gets an inbox and a
//! delivery loop task.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod credits;
pub mod error;
pub mod inbox;
pub mod journal;
pub mod lifecycle;
pub mod message;
pub mod method;
pub mod pipe;
pub mod registry;
pub mod sink;
pub mod storage;
pub mod vault;

mod stub;

use error::{RegistrationError, Result, RuntimeError};
use inbox::{BlockThenFail, DeliveryLoop, Inbox, QueueFullHandler};
use journal::{FileJournal, JournalStore, MemoryJournal, NullJournal};
use lifecycle::ShutdownMode;
use message::Address;
use method::{Bean, MethodTable};
use registry::{CallDefaults, Registry, ServiceRef};
use storage::Storage;
use stub::{StubSettings, StubTree};

/// Where service journals are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// No journaling; state lives only in the bean and its vault
    #[default]
    Disabled,
    /// Process-lifetime journal
    Memory,
    /// Append-only log files under `<root>/journal/`
    File,
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for runtime storage (default: .quartet/)
    pub root: PathBuf,

    /// Journal backend shared by services
    pub journal: JournalMode,

    /// Most messages delivered in one batch
    pub max_batch: usize,

    /// Default inbox capacity; None is unbounded
    pub inbox_capacity: Option<usize>,

    /// How long an offer waits for inbox capacity
    pub offer_timeout_ms: u64,

    /// Upper bound on a load hook
    pub load_timeout_ms: u64,

    /// Prefetch window for subscriptions that use the default
    pub prefetch_window: u32,

    /// Journal entries between automatic checkpoint requests
    pub save_interval: u64,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".quartet"),
            journal: JournalMode::Disabled,
            max_batch: 64,
            inbox_capacity: None,
            offer_timeout_ms: 1000,
            load_timeout_ms: 30_000,
            prefetch_window: 32,
            save_interval: 1024,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_batch == 0 {
            return Err(RuntimeError::Config("max_batch must be at least 1".into()));
        }
        if self.prefetch_window == 0 {
            return Err(RuntimeError::Config("prefetch_window must be at least 1".into()));
        }
        if self.save_interval == 0 {
            return Err(RuntimeError::Config("save_interval must be at least 1".into()));
        }
        Ok(())
    }

    /// Offer timeout as a duration
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    /// Load timeout as a duration
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    fn call_defaults(&self) -> CallDefaults {
        CallDefaults {
            offer_timeout: self.offer_timeout(),
            prefetch_window: self.prefetch_window,
        }
    }
}

/// The main runtime orchestrator
#[derive(Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    storage: Storage,
    journal: Arc<dyn JournalStore>,
    registry: Registry,
}

impl Runtime {
    /// Create a runtime, opening (and repairing) the configured journal
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let storage = Storage::new(config.root.clone());
        let journal: Arc<dyn JournalStore> = match config.journal {
            JournalMode::Disabled => Arc::new(NullJournal),
            JournalMode::Memory => Arc::new(MemoryJournal::new()),
            JournalMode::File => Arc::new(FileJournal::open(storage.clone())?),
        };
        Self::with_journal(config, journal)
    }

    /// Create a runtime around an existing journal store
    pub fn with_journal(config: RuntimeConfig, journal: Arc<dyn JournalStore>) -> Result<Self> {
        config.validate()?;
        let storage = Storage::new(config.root.clone());
        let registry = Registry::new(config.call_defaults());
        tracing::debug!(root = %config.root.display(), journal = ?config.journal, "runtime created");
        Ok(Self {
            config,
            storage,
            journal,
            registry,
        })
    }

    /// Initialize runtime storage directories and metadata
    pub fn init(config: RuntimeConfig) -> Result<()> {
        config.validate()?;
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load an existing runtime from storage
    pub fn load(root: PathBuf) -> Result<Self> {
        let config = storage::load_config(&root)?;
        Self::new(config)
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the storage manager
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Journal store shared by services
    pub fn journal(&self) -> Arc<dyn JournalStore> {
        self.journal.clone()
    }

    /// Service registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prepare a service named `name` around `bean`
    pub fn service<B: Send + 'static>(
        &self,
        name: &str,
        bean: B,
        table: Arc<MethodTable>,
    ) -> ServiceBuilder<'_> {
        ServiceBuilder {
            runtime: self,
            name: name.to_string(),
            bean_check: table.check_bean::<B>(),
            bean: Box::new(bean),
            table,
            capacity: self.config.inbox_capacity,
            max_batch: self.config.max_batch,
            journal: Some(self.journal.clone()),
            journal_key: None,
            handler: Arc::new(BlockThenFail),
        }
    }

    /// Handle for a service or child address
    pub fn resolve(&self, address: &str) -> error::DispatchResult<ServiceRef> {
        self.registry.resolve(address)
    }

    /// Shut down every registered service
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        for name in self.registry.names() {
            let service = self.registry.resolve(&name)?;
            service.shutdown(mode).await?;
        }
        tracing::info!(?mode, "runtime shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("services", &self.registry.names())
            .finish()
    }
}

/// Per-service settings, applied by [`ServiceBuilder::start`]
pub struct ServiceBuilder<'r> {
    runtime: &'r Runtime,
    name: String,
    bean: Box<Bean>,
    bean_check: std::result::Result<(), RegistrationError>,
    table: Arc<MethodTable>,
    capacity: Option<usize>,
    max_batch: usize,
    journal: Option<Arc<dyn JournalStore>>,
    journal_key: Option<String>,
    handler: Arc<dyn QueueFullHandler>,
}

impl ServiceBuilder<'_> {
    /// Bound the inbox; None is unbounded
    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Most messages per batch
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Turn journaling on (the runtime's store) or off
    pub fn journal(mut self, enabled: bool) -> Self {
        self.journal = enabled.then(|| self.runtime.journal.clone());
        self
    }

    /// Journal to a specific store
    pub fn journal_store(mut self, store: Arc<dyn JournalStore>) -> Self {
        self.journal = Some(store);
        self
    }

    /// Journal key for the root stub (defaults to the service name)
    pub fn journal_key(mut self, key: impl Into<String>) -> Self {
        self.journal_key = Some(key.into());
        self
    }

    /// Policy for offers to a full inbox
    pub fn queue_full_handler(mut self, handler: impl QueueFullHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Register the service and spawn its delivery loop
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> Result<ServiceRef> {
        self.bean_check?;
        let address = Address::parse(&self.name)?;
        if address.path().is_some() {
            return Err(RegistrationError::InvalidAddress(self.name).into());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|err| RuntimeError::Init(format!("no tokio runtime to start '{address}': {err}")))?;

        let config = &self.runtime.config;
        let (inbox, receiver) = Inbox::new(address.clone(), self.capacity, self.handler, self.max_batch);
        let settings = StubSettings {
            journal: self.journal.unwrap_or_else(|| Arc::new(NullJournal)),
            save_interval: config.save_interval,
            load_timeout: config.load_timeout(),
        };
        let key = self.journal_key.unwrap_or_else(|| address.to_string());
        let tree = StubTree::new(address.clone(), self.bean, self.table.clone(), key, settings);

        self.runtime
            .registry
            .insert(&address, inbox.clone(), self.table)?;
        handle.spawn(DeliveryLoop::new(tree, inbox.downgrade(), receiver).run());
        tracing::info!(%address, "service started");
        Ok(self.runtime.registry.resolve(address.as_str())?)
    }
}
