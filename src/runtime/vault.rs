//! Entity persistence drivers consumed by load and save hooks
//!
//! The runtime never interprets documents; a vault only maps an id to one
//! JSON document.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::message::Value;
use super::storage::{Storage, key_file_name};

/// Predicate used by [`Vault::find_one`]
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Narrow load/save contract for entity storage
pub trait Vault: Send + Sync {
    /// Load the document stored under `id`
    fn load(&self, id: &str) -> BoxFuture<'static, anyhow::Result<Option<Value>>>;

    /// Replace the document stored under `id`
    fn save(&self, id: &str, document: Value) -> BoxFuture<'static, anyhow::Result<()>>;

    /// First document (by id order) matching `predicate`
    fn find_one(&self, predicate: Predicate) -> BoxFuture<'static, anyhow::Result<Option<(String, Value)>>>;
}

/// In-process vault
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    documents: Arc<Mutex<BTreeMap<String, Value>>>,
    saves: Arc<AtomicUsize>,
}

impl MemoryVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    /// Current document for `id`
    pub fn get(&self, id: &str) -> Option<Value> {
        self.documents.lock().get(id).cloned()
    }

    /// Store a document without counting it as a save
    pub fn insert(&self, id: impl Into<String>, document: Value) {
        self.documents.lock().insert(id.into(), document);
    }
}

impl Vault for MemoryVault {
    fn load(&self, id: &str) -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
        let document = self.get(id);
        futures::future::ready(Ok(document)).boxed()
    }

    fn save(&self, id: &str, document: Value) -> BoxFuture<'static, anyhow::Result<()>> {
        self.documents.lock().insert(id.to_string(), document);
        self.saves.fetch_add(1, Ordering::AcqRel);
        futures::future::ready(Ok(())).boxed()
    }

    fn find_one(&self, predicate: Predicate) -> BoxFuture<'static, anyhow::Result<Option<(String, Value)>>> {
        let found = self
            .documents
            .lock()
            .iter()
            .find(|(_, document)| predicate(document))
            .map(|(id, document)| (id.clone(), document.clone()));
        futures::future::ready(Ok(found)).boxed()
    }
}

/// One JSON file per document under `<root>/vault/`
#[derive(Debug, Clone)]
pub struct FileVault {
    storage: Storage,
}

impl FileVault {
    /// Open (and create) the vault directory under `storage`
    pub fn new(storage: Storage) -> anyhow::Result<Self> {
        storage.create_dir_all(&storage.vault_dir())?;
        Ok(Self { storage })
    }

    fn read(storage: &Storage, path: &std::path::Path) -> anyhow::Result<Option<Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = storage.read_file(path)?;
        let envelope: (String, Value) = serde_json::from_slice(&data)?;
        Ok(Some(envelope.1))
    }
}

impl Vault for FileVault {
    fn load(&self, id: &str) -> BoxFuture<'static, anyhow::Result<Option<Value>>> {
        let storage = self.storage.clone();
        let path = storage.vault_dir().join(key_file_name(id, "json"));
        async move {
            tokio::task::spawn_blocking(move || Self::read(&storage, &path)).await?
        }
        .boxed()
    }

    fn save(&self, id: &str, document: Value) -> BoxFuture<'static, anyhow::Result<()>> {
        let storage = self.storage.clone();
        let path = storage.vault_dir().join(key_file_name(id, "json"));
        let id = id.to_string();
        async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                // The id is stored alongside the document so find_one can report it.
                let data = serde_json::to_vec(&(id, document))?;
                storage.write_atomic(&path, &data)?;
                Ok(())
            })
            .await?
        }
        .boxed()
    }

    fn find_one(&self, predicate: Predicate) -> BoxFuture<'static, anyhow::Result<Option<(String, Value)>>> {
        let storage = self.storage.clone();
        async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<Option<(String, Value)>> {
                let mut matches = Vec::new();
                for path in storage.list_dir(&storage.vault_dir(), "json")? {
                    let data = storage.read_file(&path)?;
                    let (id, document): (String, Value) = serde_json::from_slice(&data)?;
                    if predicate(&document) {
                        matches.push((id, document));
                    }
                }
                matches.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(matches.into_iter().next())
            })
            .await?
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_vault() {
        let vault = MemoryVault::new();
        assert_eq!(vault.load("a").await.unwrap(), None);

        vault.save("a", json!({"n": 1})).await.unwrap();
        vault.save("b", json!({"n": 2})).await.unwrap();
        assert_eq!(vault.save_count(), 2);
        assert_eq!(vault.load("a").await.unwrap(), Some(json!({"n": 1})));

        let found = vault
            .find_one(Arc::new(|doc: &Value| doc["n"] == json!(2)))
            .await
            .unwrap();
        assert_eq!(found, Some(("b".to_string(), json!({"n": 2}))));
    }

    #[tokio::test]
    async fn test_file_vault_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());

        let vault = FileVault::new(storage.clone()).unwrap();
        vault.save("acct/1", json!({"balance": 10})).await.unwrap();
        vault.save("acct/2", json!({"balance": 20})).await.unwrap();
        vault.save("acct/1", json!({"balance": 15})).await.unwrap();

        let reopened = FileVault::new(storage).unwrap();
        assert_eq!(
            reopened.load("acct/1").await.unwrap(),
            Some(json!({"balance": 15}))
        );
        assert_eq!(reopened.load("acct/3").await.unwrap(), None);

        let rich = reopened
            .find_one(Arc::new(|doc: &Value| doc["balance"].as_i64() > Some(16)))
            .await
            .unwrap();
        assert_eq!(rich.map(|(id, _)| id), Some("acct/2".to_string()));
    }
}
