//! Filesystem layout helpers and atomic write operations
//!
//! Manages the `.quartet/` directory: `config.json`, one journal log per
//! stub key under `journal/`, and one vault document per id under `vault/`.
//! Whole-file writes go through temp file, fsync, rename, directory fsync.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use super::error::{StorageError, StorageResult};

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the journal directory path
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Get the vault directory path
    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("vault")
    }

    /// Write data atomically to a file
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        let failed = |detail: String| StorageError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .map_err(|e| failed(format!("create {}: {e}", temp_path.display())))?;
        file.write_all(data)
            .map_err(|e| failed(format!("write: {e}")))?;
        file.sync_all().map_err(|e| failed(format!("sync: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path).map_err(|e| failed(format!("rename: {e}")))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new().read(true).open(parent)?;
            dir.sync_all()?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        match fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::PathNotFound(path.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    /// List files in a directory with the given extension
    pub fn list_dir(&self, path: &Path, extension: &str) -> StorageResult<Vec<PathBuf>> {
        let mut entries = Vec::new();
        if !path.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(path)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == extension) {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// File name for a journal key or vault id
///
/// Keys may contain `/` and other characters unsafe in file names, so the
/// readable part is sanitized and a short digest of the full key keeps
/// distinct keys from colliding.
pub fn key_file_name(key: &str, extension: &str) -> String {
    let readable: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    let digest = blake3::hash(key.as_bytes()).to_hex();
    format!("{readable}-{}.{extension}", &digest.as_str()[..12])
}

/// Initialize storage directories for a new runtime
pub fn init_storage(root: &Path) -> StorageResult<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.journal_dir())?;
    storage.create_dir_all(&storage.vault_dir())?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> StorageResult<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config)?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> StorageResult<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::super::JournalMode;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("state");

        init_storage(&root).unwrap();

        assert!(root.join("journal").is_dir());
        assert!(root.join("vault").is_dir());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            journal: JournalMode::Memory,
            max_batch: 16,
            inbox_capacity: Some(128),
            debug: true,
            ..RuntimeConfig::default()
        };

        write_config(&config).unwrap();
        let loaded = load_config(&root).unwrap();

        assert_eq!(loaded.journal, JournalMode::Memory);
        assert_eq!(loaded.max_batch, 16);
        assert_eq!(loaded.inbox_capacity, Some(128));
        assert!(loaded.debug);
    }

    #[test]
    fn test_missing_config() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            load_config(temp.path()),
            Err(StorageError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        storage.write_atomic(&test_file, b"first").unwrap();
        storage.write_atomic(&test_file, b"second").unwrap();

        assert_eq!(storage.read_file(&test_file).unwrap(), b"second");
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn test_key_file_name() {
        let a = key_file_name("bank/acct-7", "log");
        let b = key_file_name("bank_acct-7", "log");
        assert!(a.starts_with("bank_acct-7-"));
        assert!(a.ends_with(".log"));
        assert_ne!(a, b);
        assert_eq!(a, key_file_name("bank/acct-7", "log"));
    }
}
