//! Write-ahead journal of modify-method calls
//!
//! Each stub appends one [`JournalEntry`] per accepted modify call, flushes
//! once per batch, and on restart replays the durable entries in sequence
//! order before accepting new work. A completed checkpoint truncates the
//! entries it covers.
//!
//! On disk ([`FileJournal`]) each key has its own append-only log of records
//! framed as `[u32 LE length][JSON payload][32-byte blake3 digest]`. A crash
//! mid-append leaves a torn tail, which [`FileJournal::validate_and_repair`]
//! truncates on open.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::error::{JournalError, JournalResult};
use super::message::{Args, Value};
use super::storage::{Storage, key_file_name};

/// Upper bound on a single record payload
const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

const DIGEST_SIZE: usize = 32;

/// Call shape that produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Fire-and-forget send
    Send,
    /// Query (any call with a result sink)
    Query,
}

/// One journaled modify call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Journal key of the stub
    pub key: String,
    /// Strictly increasing per key
    pub seq: u64,
    /// Call shape
    pub kind: EntryKind,
    /// Method name
    pub method: String,
    /// Serialized positional arguments
    pub args: Vec<Value>,
    /// Wall-clock time the call was accepted
    pub recorded_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Frame the entry as a checksummed record
    pub fn encode(&self) -> JournalResult<Vec<u8>> {
        let payload =
            serde_json::to_vec(self).map_err(|e| JournalError::Encoding(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_SIZE)
            .ok_or_else(|| JournalError::Encoding(format!("record of {} bytes", payload.len())))?;

        let mut record = Vec::with_capacity(4 + payload.len() + DIGEST_SIZE);
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(blake3::hash(&payload).as_bytes());
        Ok(record)
    }

    /// Arguments as an [`Args`] list for re-dispatch
    pub fn to_args(&self) -> Args {
        Args::new(self.args.clone())
    }
}

/// Result of reading one record
enum Record {
    Entry(JournalEntry, u64),
    End,
    Torn(String),
}

/// Fill `buf`; false on EOF before it is full
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record<R: Read>(reader: &mut R) -> JournalResult<Record> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(Record::End);
    }
    if filled < len_buf.len() {
        return Ok(Record::Torn("truncated length prefix".into()));
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_SIZE {
        return Ok(Record::Torn(format!("implausible record length {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(Record::Torn("truncated payload".into()));
    }
    let mut digest = [0u8; DIGEST_SIZE];
    if !read_full(reader, &mut digest)? {
        return Ok(Record::Torn("truncated digest".into()));
    }
    if blake3::hash(&payload).as_bytes() != &digest {
        return Ok(Record::Torn("checksum mismatch".into()));
    }
    match serde_json::from_slice(&payload) {
        Ok(entry) => Ok(Record::Entry(entry, 4 + u64::from(len) + DIGEST_SIZE as u64)),
        Err(e) => Ok(Record::Torn(format!("undecodable payload: {e}"))),
    }
}

/// Durable ordered log of entries, keyed by stub journal key
pub trait JournalStore: Send + Sync {
    /// Stage an entry; not durable until `flush`
    fn append(&self, entry: &JournalEntry) -> JournalResult<()>;

    /// Make every staged entry for `key` durable
    fn flush(&self, key: &str) -> JournalResult<()>;

    /// Durable entries for `key`, in sequence order
    fn read(&self, key: &str) -> JournalResult<Vec<JournalEntry>>;

    /// Drop entries with `seq < before_seq`
    fn truncate(&self, key: &str, before_seq: u64) -> JournalResult<()>;

    /// Whether entries survive a restart
    fn is_durable(&self) -> bool {
        true
    }
}

/// Journal that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullJournal;

impl JournalStore for NullJournal {
    fn append(&self, _entry: &JournalEntry) -> JournalResult<()> {
        Ok(())
    }

    fn flush(&self, _key: &str) -> JournalResult<()> {
        Ok(())
    }

    fn read(&self, _key: &str) -> JournalResult<Vec<JournalEntry>> {
        Ok(Vec::new())
    }

    fn truncate(&self, _key: &str, _before_seq: u64) -> JournalResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct KeyLog {
    staged: Vec<JournalEntry>,
    durable: Vec<JournalEntry>,
}

/// Process-lifetime journal
///
/// Keeps staged and flushed entries apart so flush boundaries are
/// observable.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    logs: Mutex<HashMap<String, KeyLog>>,
    flushes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Flushed entries for `key`
    pub fn entries(&self, key: &str) -> Vec<JournalEntry> {
        self.logs
            .lock()
            .get(key)
            .map(|log| log.durable.clone())
            .unwrap_or_default()
    }

    /// Appended but unflushed entries for `key`
    pub fn staged(&self, key: &str) -> Vec<JournalEntry> {
        self.logs
            .lock()
            .get(key)
            .map(|log| log.staged.clone())
            .unwrap_or_default()
    }

    /// Number of flushes that made at least one entry durable
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    /// Make every append fail with an IO error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl JournalStore for MemoryJournal {
    fn append(&self, entry: &JournalEntry) -> JournalResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(JournalError::Io(std::io::Error::other("journal writes disabled")));
        }
        self.logs
            .lock()
            .entry(entry.key.clone())
            .or_default()
            .staged
            .push(entry.clone());
        Ok(())
    }

    fn flush(&self, key: &str) -> JournalResult<()> {
        let mut logs = self.logs.lock();
        if let Some(log) = logs.get_mut(key) {
            if !log.staged.is_empty() {
                let staged = std::mem::take(&mut log.staged);
                log.durable.extend(staged);
                self.flushes.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(())
    }

    fn read(&self, key: &str) -> JournalResult<Vec<JournalEntry>> {
        Ok(self.entries(key))
    }

    fn truncate(&self, key: &str, before_seq: u64) -> JournalResult<()> {
        if let Some(log) = self.logs.lock().get_mut(key) {
            log.durable.retain(|entry| entry.seq >= before_seq);
            log.staged.retain(|entry| entry.seq >= before_seq);
        }
        Ok(())
    }
}

/// One append-only log file per key under `<root>/journal/`
///
/// `flush` and `truncate` are synchronous and run on the delivery task that
/// calls them. A flush blocks for one `fsync` of the key's log and happens at
/// most once per modified batch. A truncate rewrites the surviving tail of one
/// log and happens once per completed checkpoint, so its cost is bounded by
/// the entries journaled since the previous checkpoint. Only replay reads run
/// on the blocking pool.
pub struct FileJournal {
    storage: Storage,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

impl FileJournal {
    /// Open the journal directory, repairing torn tails
    pub fn open(storage: Storage) -> JournalResult<Self> {
        std::fs::create_dir_all(storage.journal_dir())?;
        let journal = Self {
            storage,
            writers: Mutex::new(HashMap::new()),
        };
        journal.repair_all()?;
        Ok(journal)
    }

    /// Log file for `key`
    pub fn log_path(&self, key: &str) -> PathBuf {
        self.storage.journal_dir().join(key_file_name(key, "log"))
    }

    /// Validate every log, truncating torn tails; returns the repaired paths
    pub fn repair_all(&self) -> JournalResult<Vec<PathBuf>> {
        let logs = self.storage.list_dir(&self.storage.journal_dir(), "log")?;
        let mut repaired = Vec::new();
        for path in logs {
            if Self::validate_and_repair(&path)?.is_some() {
                repaired.push(path);
            }
        }
        Ok(repaired)
    }

    /// Validate one log and truncate it after the last intact record
    ///
    /// Returns the new length if the file was truncated.
    pub fn validate_and_repair(path: &Path) -> JournalResult<Option<u64>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut last_valid_offset = 0u64;

        let torn = loop {
            match read_record(&mut reader)? {
                Record::Entry(_, size) => last_valid_offset += size,
                Record::End => break None,
                Record::Torn(detail) => break Some(detail),
            }
        };

        let Some(detail) = torn else {
            return Ok(None);
        };
        tracing::warn!(
            path = %path.display(),
            offset = last_valid_offset,
            %detail,
            "corrupted journal record"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(last_valid_offset)?;
        file.sync_all()?;
        tracing::info!(
            path = %path.display(),
            len = last_valid_offset,
            "truncated journal"
        );
        Ok(Some(last_valid_offset))
    }

    fn read_path(path: &Path, key: &str) -> JournalResult<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        let mut offset = 0u64;
        loop {
            match read_record(&mut reader)? {
                Record::Entry(entry, size) => {
                    offset += size;
                    entries.push(entry);
                }
                Record::End => return Ok(entries),
                Record::Torn(detail) => {
                    return Err(JournalError::Corrupted {
                        key: key.to_string(),
                        offset,
                        detail,
                    });
                }
            }
        }
    }
}

impl JournalStore for FileJournal {
    fn append(&self, entry: &JournalEntry) -> JournalResult<()> {
        let record = entry.encode()?;
        let mut writers = self.writers.lock();
        let writer = match writers.entry(entry.key.clone()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.log_path(&entry.key))?;
                slot.insert(BufWriter::new(file))
            }
        };
        writer.write_all(&record)?;
        Ok(())
    }

    /// Blocks the caller for one `fsync`
    fn flush(&self, key: &str) -> JournalResult<()> {
        if let Some(writer) = self.writers.lock().get_mut(key) {
            writer.flush()?;
            writer.get_mut().sync_all()?;
        }
        Ok(())
    }

    fn read(&self, key: &str) -> JournalResult<Vec<JournalEntry>> {
        Self::read_path(&self.log_path(key), key)
    }

    /// Blocks the caller while the kept tail is rewritten atomically
    fn truncate(&self, key: &str, before_seq: u64) -> JournalResult<()> {
        let mut writers = self.writers.lock();
        if let Some(mut writer) = writers.remove(key) {
            writer.flush()?;
            writer.get_mut().sync_all()?;
        }
        let path = self.log_path(key);
        let kept: Vec<JournalEntry> = Self::read_path(&path, key)?
            .into_iter()
            .filter(|entry| entry.seq >= before_seq)
            .collect();

        let mut data = Vec::new();
        for entry in &kept {
            data.extend(entry.encode()?);
        }
        self.storage.write_atomic(&path, &data)?;
        tracing::debug!(key, before_seq, kept = kept.len(), "journal truncated");
        Ok(())
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("dir", &self.storage.journal_dir())
            .finish()
    }
}

/// Primary journal chained to a peer replica
///
/// The primary decides success; peer failures are logged.
pub struct ReplicatedJournal {
    primary: Arc<dyn JournalStore>,
    peer: Arc<dyn JournalStore>,
}

impl ReplicatedJournal {
    /// Chain `peer` behind `primary`
    pub fn new(primary: Arc<dyn JournalStore>, peer: Arc<dyn JournalStore>) -> Self {
        Self { primary, peer }
    }

    fn replicate(&self, op: &str, key: &str, result: JournalResult<()>) {
        if let Err(err) = result {
            tracing::warn!(op, key, error = %err, "peer journal failed");
        }
    }
}

impl JournalStore for ReplicatedJournal {
    fn append(&self, entry: &JournalEntry) -> JournalResult<()> {
        self.primary.append(entry)?;
        self.replicate("append", &entry.key, self.peer.append(entry));
        Ok(())
    }

    fn flush(&self, key: &str) -> JournalResult<()> {
        self.primary.flush(key)?;
        self.replicate("flush", key, self.peer.flush(key));
        Ok(())
    }

    fn read(&self, key: &str) -> JournalResult<Vec<JournalEntry>> {
        self.primary.read(key)
    }

    fn truncate(&self, key: &str, before_seq: u64) -> JournalResult<()> {
        self.primary.truncate(key, before_seq)?;
        self.replicate("truncate", key, self.peer.truncate(key, before_seq));
        Ok(())
    }

    fn is_durable(&self) -> bool {
        self.primary.is_durable()
    }
}

/// Per-stub view of a journal store
///
/// Assigns sequence numbers, counts entries since the last checkpoint, and
/// implements the save bracket: entries written between `save_start` and
/// `save_end` are held back and only appended and flushed once the
/// checkpoint has finished.
pub(crate) struct StubJournal {
    store: Arc<dyn JournalStore>,
    key: String,
    next_seq: u64,
    unflushed: usize,
    held: Vec<JournalEntry>,
    save_mark: Option<u64>,
    since_checkpoint: u64,
    save_interval: u64,
}

impl StubJournal {
    pub(crate) fn new(store: Arc<dyn JournalStore>, key: String, save_interval: u64) -> Self {
        Self {
            store,
            key,
            next_seq: 0,
            unflushed: 0,
            held: Vec::new(),
            save_mark: None,
            since_checkpoint: 0,
            save_interval: save_interval.max(1),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.store.is_durable()
    }

    pub(crate) fn write_send(&mut self, method: &str, args: &Args) -> JournalResult<()> {
        self.write(EntryKind::Send, method, args)
    }

    pub(crate) fn write_query(&mut self, method: &str, args: &Args) -> JournalResult<()> {
        self.write(EntryKind::Query, method, args)
    }

    fn write(&mut self, kind: EntryKind, method: &str, args: &Args) -> JournalResult<()> {
        let entry = JournalEntry {
            key: self.key.clone(),
            seq: self.next_seq,
            kind,
            method: method.to_string(),
            args: args.values().to_vec(),
            recorded_at: Utc::now(),
        };
        self.next_seq += 1;
        self.since_checkpoint += 1;

        if self.save_mark.is_some() {
            self.held.push(entry);
            return Ok(());
        }
        self.store.append(&entry)?;
        self.unflushed += 1;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> JournalResult<()> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.store.flush(&self.key)?;
        self.unflushed = 0;
        Ok(())
    }

    /// Enough entries accumulated that a checkpoint should run
    pub(crate) fn is_save_request(&self) -> bool {
        if self.save_mark.is_some() || self.since_checkpoint == 0 {
            return false;
        }
        !self.store.is_durable() || self.since_checkpoint >= self.save_interval
    }

    pub(crate) fn is_saving(&self) -> bool {
        self.save_mark.is_some()
    }

    /// Open the save bracket; everything written so far is covered
    pub(crate) fn save_start(&mut self) -> JournalResult<()> {
        let flushed = self.flush();
        self.save_mark = Some(self.next_seq);
        flushed
    }

    /// Close the save bracket, truncating covered entries if the save completed
    pub(crate) fn save_end(&mut self, complete: bool) -> JournalResult<()> {
        let Some(mark) = self.save_mark.take() else {
            return Ok(());
        };
        let truncated = if complete {
            self.since_checkpoint = self.held.len() as u64;
            self.store.truncate(&self.key, mark)
        } else {
            Ok(())
        };

        let mut released = Ok(());
        for entry in std::mem::take(&mut self.held) {
            match self.store.append(&entry) {
                Ok(()) => self.unflushed += 1,
                Err(err) => {
                    released = Err(err);
                    break;
                }
            }
        }
        let flushed = self.flush();
        truncated.and(released).and(flushed)
    }

    /// Read the durable entries on a blocking thread
    pub(crate) fn replay_source(
        &self,
    ) -> impl std::future::Future<Output = JournalResult<Vec<JournalEntry>>> + Send + 'static {
        let store = self.store.clone();
        let key = self.key.clone();
        async move {
            let read_key = key.clone();
            let entries = tokio::task::spawn_blocking(move || store.read(&read_key))
                .await
                .map_err(|e| JournalError::Aborted(e.to_string()))??;
            check_order(&key, &entries)?;
            Ok::<_, JournalError>(entries)
        }
    }

    /// Continue numbering after replayed entries
    pub(crate) fn observe_replay(&mut self, entries: &[JournalEntry]) {
        if let Some(last) = entries.last() {
            self.next_seq = self.next_seq.max(last.seq + 1);
        }
        self.since_checkpoint = entries.len() as u64;
    }
}

fn check_order(key: &str, entries: &[JournalEntry]) -> JournalResult<()> {
    for pair in entries.windows(2) {
        if pair[1].seq <= pair[0].seq {
            return Err(JournalError::OutOfOrder {
                key: key.to_string(),
                seq: pair[1].seq,
                previous: pair[0].seq,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str, seq: u64, method: &str) -> JournalEntry {
        JournalEntry {
            key: key.to_string(),
            seq,
            kind: EntryKind::Send,
            method: method.to_string(),
            args: vec![json!(seq)],
            recorded_at: Utc::now(),
        }
    }

    fn file_journal(temp: &TempDir) -> FileJournal {
        FileJournal::open(Storage::new(temp.path().to_path_buf())).unwrap()
    }

    #[test]
    fn test_record_roundtrip() {
        let original = entry("bank", 3, "deposit");
        let bytes = original.encode().unwrap();
        let mut cursor = std::io::Cursor::new(bytes.clone());
        match read_record(&mut cursor).unwrap() {
            Record::Entry(decoded, size) => {
                assert_eq!(decoded, original);
                assert_eq!(size, bytes.len() as u64);
            }
            _ => panic!("expected entry"),
        }
        assert!(matches!(read_record(&mut cursor).unwrap(), Record::End));
    }

    #[test]
    fn test_file_journal_flush_and_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let journal = file_journal(&temp);
            journal.append(&entry("bank", 0, "deposit")).unwrap();
            journal.append(&entry("bank", 1, "withdraw")).unwrap();
            journal.append(&entry("other", 0, "noop")).unwrap();
            journal.flush("bank").unwrap();
            journal.flush("other").unwrap();
        }

        let journal = file_journal(&temp);
        let entries = journal.read("bank").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].method, "deposit");
        assert_eq!(entries[1].seq, 1);
        assert_eq!(journal.read("other").unwrap().len(), 1);
        assert!(journal.read("missing").unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail_is_repaired() {
        let temp = TempDir::new().unwrap();
        let path = {
            let journal = file_journal(&temp);
            journal.append(&entry("bank", 0, "deposit")).unwrap();
            journal.append(&entry("bank", 1, "deposit")).unwrap();
            journal.flush("bank").unwrap();
            journal.log_path("bank")
        };

        // Half of a third record
        let partial = entry("bank", 2, "deposit").encode().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let journal = FileJournal::open(Storage::new(temp.path().to_path_buf())).unwrap();
        let entries = journal.read("bank").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(FileJournal::validate_and_repair(&path).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let temp = TempDir::new().unwrap();
        let journal = file_journal(&temp);
        journal.append(&entry("bank", 0, "deposit")).unwrap();
        journal.flush("bank").unwrap();

        let path = journal.log_path("bank");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            journal.read("bank"),
            Err(JournalError::Corrupted { offset: 0, .. })
        ));
        assert_eq!(FileJournal::validate_and_repair(&path).unwrap(), Some(0));
        assert!(journal.read("bank").unwrap().is_empty());
    }

    #[test]
    fn test_file_truncate_keeps_later_entries() {
        let temp = TempDir::new().unwrap();
        let journal = file_journal(&temp);
        for seq in 0..5 {
            journal.append(&entry("bank", seq, "deposit")).unwrap();
        }
        journal.flush("bank").unwrap();

        journal.truncate("bank", 3).unwrap();
        journal.append(&entry("bank", 5, "deposit")).unwrap();
        journal.flush("bank").unwrap();

        let seqs: Vec<u64> = journal.read("bank").unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_truncated_log_holds_only_the_kept_tail() {
        let temp = TempDir::new().unwrap();
        let journal = file_journal(&temp);
        let entries: Vec<JournalEntry> = (0..6).map(|seq| entry("bank", seq, "deposit")).collect();
        for e in &entries {
            journal.append(e).unwrap();
        }
        journal.flush("bank").unwrap();

        journal.truncate("bank", 4).unwrap();
        let kept: u64 = entries[4..]
            .iter()
            .map(|e| e.encode().unwrap().len() as u64)
            .sum();
        let path = journal.log_path("bank");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), kept);

        journal.truncate("bank", 6).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(journal.read("bank").unwrap().is_empty());
    }

    #[test]
    fn test_memory_journal_flush_boundary() {
        let journal = MemoryJournal::new();
        journal.append(&entry("k", 0, "a")).unwrap();
        assert_eq!(journal.staged("k").len(), 1);
        assert!(journal.read("k").unwrap().is_empty());

        journal.flush("k").unwrap();
        assert!(journal.staged("k").is_empty());
        assert_eq!(journal.entries("k").len(), 1);
        assert_eq!(journal.flush_count(), 1);

        journal.flush("k").unwrap();
        assert_eq!(journal.flush_count(), 1);
    }

    #[test]
    fn test_replicated_peer_failure_is_not_fatal() {
        let primary = Arc::new(MemoryJournal::new());
        let peer = Arc::new(MemoryJournal::new());
        peer.set_fail_writes(true);
        let journal = ReplicatedJournal::new(primary.clone(), peer.clone());

        journal.append(&entry("k", 0, "a")).unwrap();
        journal.flush("k").unwrap();
        assert_eq!(primary.entries("k").len(), 1);
        assert!(peer.entries("k").is_empty());

        peer.set_fail_writes(false);
        journal.append(&entry("k", 1, "b")).unwrap();
        journal.flush("k").unwrap();
        assert_eq!(peer.entries("k").len(), 1);
    }

    #[test]
    fn test_stub_journal_sequences_and_flush() {
        let store = Arc::new(MemoryJournal::new());
        let mut journal = StubJournal::new(store.clone(), "bank".into(), 100);

        journal.write_send("deposit", &Args::new(vec![json!(1)])).unwrap();
        journal.write_query("withdraw", &Args::new(vec![json!(2)])).unwrap();
        assert_eq!(store.staged("bank").len(), 2);

        journal.flush().unwrap();
        let entries = store.entries("bank");
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[1].seq, 1);
        assert_eq!(entries[1].kind, EntryKind::Query);
        assert!(!journal.is_save_request());
    }

    #[test]
    fn test_save_interval_requests_checkpoint() {
        let store = Arc::new(MemoryJournal::new());
        let mut journal = StubJournal::new(store, "k".into(), 3);
        for _ in 0..2 {
            journal.write_send("m", &Args::empty()).unwrap();
        }
        assert!(!journal.is_save_request());
        journal.write_send("m", &Args::empty()).unwrap();
        assert!(journal.is_save_request());
    }

    #[test]
    fn test_null_journal_requests_save_after_any_write() {
        let mut journal = StubJournal::new(Arc::new(NullJournal), "k".into(), 1000);
        assert!(!journal.is_save_request());
        journal.write_send("m", &Args::empty()).unwrap();
        assert!(journal.is_save_request());
    }

    #[test]
    fn test_save_bracket_holds_and_truncates() {
        let store = Arc::new(MemoryJournal::new());
        let mut journal = StubJournal::new(store.clone(), "k".into(), 1000);
        journal.write_send("a", &Args::empty()).unwrap();
        journal.write_send("b", &Args::empty()).unwrap();

        journal.save_start().unwrap();
        assert_eq!(store.entries("k").len(), 2);
        assert!(journal.is_saving());

        journal.write_send("c", &Args::empty()).unwrap();
        journal.flush().unwrap();
        assert!(store.staged("k").is_empty());
        assert_eq!(store.entries("k").len(), 2);

        journal.save_end(true).unwrap();
        let entries = store.entries("k");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "c");
        assert_eq!(entries[0].seq, 2);
        assert!(!journal.is_saving());
    }

    #[test]
    fn test_failed_save_keeps_entries() {
        let store = Arc::new(MemoryJournal::new());
        let mut journal = StubJournal::new(store.clone(), "k".into(), 1000);
        journal.write_send("a", &Args::empty()).unwrap();
        journal.save_start().unwrap();
        journal.write_send("b", &Args::empty()).unwrap();
        journal.save_end(false).unwrap();
        assert_eq!(store.entries("k").len(), 2);
    }

    #[tokio::test]
    async fn test_replay_source_and_observe() {
        let store = Arc::new(MemoryJournal::new());
        for seq in [0, 1, 4] {
            store.append(&entry("k", seq, "m")).unwrap();
        }
        store.flush("k").unwrap();

        let mut journal = StubJournal::new(store, "k".into(), 1000);
        let entries = journal.replay_source().await.unwrap();
        assert_eq!(entries.len(), 3);
        journal.observe_replay(&entries);
        journal.write_send("m", &Args::empty()).unwrap();
        assert_eq!(journal.next_seq, 6);
    }

    #[tokio::test]
    async fn test_replay_rejects_out_of_order() {
        let store = Arc::new(MemoryJournal::new());
        store.append(&entry("k", 2, "m")).unwrap();
        store.append(&entry("k", 1, "m")).unwrap();
        store.flush("k").unwrap();

        let journal = StubJournal::new(store, "k".into(), 1000);
        assert!(matches!(
            journal.replay_source().await,
            Err(JournalError::OutOfOrder { seq: 1, previous: 2, .. })
        ));
    }
}
