//! Durable key-value backend: snapshot + append-only journal

use super::kv::{
    BatchOp, BatchedMutations, IterDirection, KvStore, collect_key_range, collect_range,
    prefixed_keys, realm_key,
};
use crate::core::{CacheError, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const STORE_SNAPSHOT_FILE: &str = "store.snapshot";
pub const STORE_JOURNAL_FILE: &str = "store.journal";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync after every journal append
    Sync,
    /// Leave syncing to the OS (or to an explicit `flush`)
    #[default]
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    pub durability: DurabilityMode,
    /// Rewrite the snapshot and truncate the journal after this many records
    pub compact_after: usize,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Async,
            compact_after: 1000,
        }
    }
}

impl FileStoreConfig {
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn compact_after(mut self, records: usize) -> Self {
        self.compact_after = records;
        self
    }
}

// ============================================================================
// On-disk records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalRecord {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeletePrefix { prefix: Vec<u8> },
    Batch(Vec<BatchOp>),
}

impl JournalRecord {
    fn apply(self, tree: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        match self {
            JournalRecord::Set { key, value } => {
                tree.insert(key, value);
            }
            JournalRecord::Delete { key } => {
                tree.remove(&key);
            }
            JournalRecord::DeletePrefix { prefix } => {
                for key in prefixed_keys(tree, &prefix) {
                    tree.remove(&key);
                }
            }
            JournalRecord::Batch(ops) => {
                for op in ops {
                    op.apply(tree);
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub created_at_ms: i64,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StoreSnapshot {
    fn new(tree: &BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            created_at_ms: Utc::now().timestamp_millis(),
            entries: tree.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at_ms)
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(|e| CacheError::IoError(format!("Failed to read snapshot: {}", e)))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| CacheError::DecodeError(format!("Failed to deserialize snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(CacheError::StorageError(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    /// Writes to a temp file in the same directory and renames it over `path`
    fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let serialized = rmp_serde::to_vec(self)
            .map_err(|e| CacheError::EncodeError(format!("Failed to serialize snapshot: {}", e)))?;
        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| CacheError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| CacheError::IoError(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| CacheError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(path)
            .map_err(|e| CacheError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// Journal
// ============================================================================

struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    durability: DurabilityMode,
    records_since_compaction: usize,
    // Length of the file up to the last complete record
    len: u64,
}

impl Journal {
    fn open(path: PathBuf, durability: DurabilityMode, existing_records: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CacheError::IoError(format!("Failed to open journal: {}", e)))?;
        let len = file
            .metadata()
            .map_err(|e| CacheError::IoError(format!("Failed to stat journal: {}", e)))?
            .len();
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            durability,
            records_since_compaction: existing_records,
            len,
        })
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let serialized = rmp_serde::to_vec(record)
            .map_err(|e| CacheError::EncodeError(format!("Failed to serialize journal record: {}", e)))?;
        let len = serialized.len() as u32;
        let written = self
            .writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| self.writer.write_all(&serialized))
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            self.rewind();
            return Err(CacheError::IoError(format!("Failed to write journal: {}", e)));
        }
        self.len += 4 + serialized.len() as u64;
        if self.durability == DurabilityMode::Sync {
            self.sync()?;
        }
        self.records_since_compaction += 1;
        Ok(())
    }

    /// Drops whatever a failed append left behind, buffered or on disk
    fn rewind(&mut self) {
        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|file| file.set_len(self.len).map(|_| file));
        match reopened {
            Ok(file) => {
                let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
                // into_parts hands back the buffer instead of flushing it on drop
                let _ = failed.into_parts();
            }
            Err(e) => warn!(
                "Failed to rewind journal {} to {} bytes: {}",
                self.path.display(),
                self.len,
                e
            ),
        }
    }

    fn sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| CacheError::IoError(format!("Failed to flush journal: {}", e)))?;
        self.writer
            .get_mut()
            .sync_all()
            .map_err(|e| CacheError::IoError(format!("Failed to sync journal: {}", e)))
    }

    fn truncate(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| CacheError::IoError(format!("Failed to truncate journal: {}", e)))?;
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| CacheError::IoError(format!("Failed to reopen journal: {}", e)))?;
        self.writer = BufWriter::new(file);
        self.records_since_compaction = 0;
        self.len = 0;
        Ok(())
    }

    /// Reads every complete record along with the byte length they span.
    /// A torn tail (crash mid-append) ends the replay.
    fn read_all(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = File::open(path)
            .map_err(|e| CacheError::IoError(format!("Failed to open journal for reading: {}", e)))?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(CacheError::IoError(format!(
                        "Failed to read journal record length: {}",
                        e
                    )));
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(
                        "Journal {} ends with a torn record; ignoring {} trailing bytes",
                        path.display(),
                        len
                    );
                    break;
                }
                Err(e) => {
                    return Err(CacheError::IoError(format!(
                        "Failed to read journal record: {}",
                        e
                    )));
                }
            }
            let record: JournalRecord = rmp_serde::from_slice(&data).map_err(|e| {
                CacheError::DecodeError(format!("Failed to deserialize journal record: {}", e))
            })?;
            records.push(record);
            valid_len += 4 + len as u64;
        }
        Ok((records, valid_len))
    }

    /// Cuts a torn tail off so new appends start on a record boundary
    fn truncate_torn_tail(path: &Path, valid_len: u64) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| CacheError::IoError(format!("Failed to open journal: {}", e)))?;
        let actual = file
            .metadata()
            .map_err(|e| CacheError::IoError(format!("Failed to stat journal: {}", e)))?
            .len();
        if actual > valid_len {
            warn!(
                "Truncating journal {} from {} to {} bytes",
                path.display(),
                actual,
                valid_len
            );
            file.set_len(valid_len)
                .and_then(|_| file.sync_all())
                .map_err(|e| CacheError::IoError(format!("Failed to truncate journal: {}", e)))?;
        }
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

struct FileInner {
    dir: PathBuf,
    tree: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    // Lock order: journal, then tree. Holding the journal lock while applying keeps
    // the on-disk order identical to the in-memory order.
    journal: Mutex<Journal>,
    config: FileStoreConfig,
}

impl FileInner {
    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(STORE_SNAPSHOT_FILE)
    }

    fn write(&self, record: JournalRecord) -> Result<()> {
        let mut journal = self.journal.lock();
        journal.append(&record)?;
        record.apply(&mut self.tree.write());
        if self.config.compact_after > 0 && journal.records_since_compaction >= self.config.compact_after
        {
            // The record is already durable in the journal; compaction retries on the next write
            if let Err(e) = self.compact_locked(&mut journal) {
                warn!("Compaction of {} failed: {}", self.dir.display(), e);
            }
        }
        Ok(())
    }

    fn compact_locked(&self, journal: &mut Journal) -> Result<()> {
        let snapshot = StoreSnapshot::new(&self.tree.read());
        snapshot.save(&self.snapshot_path())?;
        journal.truncate()?;
        debug!(
            "Compacted store at {} ({} keys)",
            self.dir.display(),
            snapshot.entries.len()
        );
        Ok(())
    }
}

/// Statistics reported by [`FileStore::stats`]
#[derive(Debug, Clone)]
pub struct FileStoreStats {
    pub keys: usize,
    pub journal_records: usize,
    pub snapshot_created_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for FileStoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} keys, {} journal records since last compaction, snapshot: {}",
            self.keys,
            self.journal_records,
            self.snapshot_created_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "none".to_string())
        )
    }
}

/// Durable ordered store living in one directory.
///
/// All data is held in memory; the journal makes every mutation durable and the
/// snapshot bounds replay time.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileInner>,
    realm: Vec<u8>,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P, config: FileStoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| CacheError::IoError(format!("Failed to create store directory: {}", e)))?;

        let mut tree = BTreeMap::new();
        if let Some(snapshot) = StoreSnapshot::load(&dir.join(STORE_SNAPSHOT_FILE))? {
            tree.extend(snapshot.entries);
        }

        let journal_path = dir.join(STORE_JOURNAL_FILE);
        let (records, valid_len) = Journal::read_all(&journal_path)?;
        Journal::truncate_torn_tail(&journal_path, valid_len)?;
        let replayed = records.len();
        for record in records {
            record.apply(&mut tree);
        }
        info!(
            "Opened store at {} ({} keys, {} journal records replayed)",
            dir.display(),
            tree.len(),
            replayed
        );

        let journal = Journal::open(journal_path, config.durability, replayed)?;
        Ok(Self {
            inner: Arc::new(FileInner {
                dir,
                tree: RwLock::new(tree),
                journal: Mutex::new(journal),
                config,
            }),
            realm: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Writes a fresh snapshot and truncates the journal
    pub fn compact(&self) -> Result<()> {
        let mut journal = self.inner.journal.lock();
        self.inner.compact_locked(&mut journal)
    }

    pub fn stats(&self) -> Result<FileStoreStats> {
        let journal_records = self.inner.journal.lock().records_since_compaction;
        let snapshot_created_at = StoreSnapshot::load(&self.inner.snapshot_path())?
            .and_then(|snapshot| snapshot.created_at());
        Ok(FileStoreStats {
            keys: prefixed_keys(&self.inner.tree.read(), &self.realm).len(),
            journal_records,
            snapshot_created_at,
        })
    }
}

impl KvStore for FileStore {
    fn realm(&self) -> &[u8] {
        &self.realm
    }

    fn with_realm(&self, realm: &[u8]) -> Arc<dyn KvStore> {
        Arc::new(FileStore {
            inner: Arc::clone(&self.inner),
            realm: realm_key(&self.realm, realm),
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .tree
            .read()
            .get(&realm_key(&self.realm, key))
            .cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write(JournalRecord::Set {
            key: realm_key(&self.realm, key),
            value: value.to_vec(),
        })
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self
            .inner
            .tree
            .read()
            .contains_key(&realm_key(&self.realm, key)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write(JournalRecord::Delete {
            key: realm_key(&self.realm, key),
        })
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.inner.write(JournalRecord::DeletePrefix {
            prefix: realm_key(&self.realm, prefix),
        })
    }

    fn iterate(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let entries = collect_range(
            &self.inner.tree.read(),
            &realm_key(&self.realm, prefix),
            direction,
        );
        for (key, value) in entries {
            if !consumer(&key[self.realm.len()..], &value) {
                break;
            }
        }
        Ok(())
    }

    fn iterate_keys(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        let keys = collect_key_range(
            &self.inner.tree.read(),
            &realm_key(&self.realm, prefix),
            direction,
        );
        for key in keys {
            if !consumer(&key[self.realm.len()..]) {
                break;
            }
        }
        Ok(())
    }

    fn batched(&self) -> Box<dyn BatchedMutations> {
        Box::new(FileBatch {
            inner: Arc::clone(&self.inner),
            realm: self.realm.clone(),
            ops: Vec::new(),
        })
    }

    fn flush(&self) -> Result<()> {
        self.inner.journal.lock().sync()
    }
}

/// Buffered mutations written as a single journal record
struct FileBatch {
    inner: Arc<FileInner>,
    realm: Vec<u8>,
    ops: Vec<BatchOp>,
}

impl BatchedMutations for FileBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Set {
            key: realm_key(&self.realm, key),
            value: value.to_vec(),
        });
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete {
            key: realm_key(&self.realm, key),
        });
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let FileBatch { inner, ops, .. } = *self;
        if ops.is_empty() {
            return Ok(());
        }
        inner.write(JournalRecord::Batch(ops))
    }

    fn cancel(self: Box<Self>) {
        debug!("Cancelled batch of {} mutations", self.ops.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_replays_journal() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
            store.set(b"a", b"1").unwrap();
            store.set(b"b", b"2").unwrap();
            store.delete(b"a").unwrap();
        }

        let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.stats().unwrap().journal_records, 3);
    }

    #[test]
    fn test_compaction_truncates_journal() {
        let temp_dir = TempDir::new().unwrap();
        let config = FileStoreConfig::default().compact_after(4);
        {
            let store = FileStore::open(temp_dir.path(), config.clone()).unwrap();
            for i in 0..5u8 {
                store.set(&[i], &[i]).unwrap();
            }
            let stats = store.stats().unwrap();
            assert_eq!(stats.keys, 5);
            assert_eq!(stats.journal_records, 1);
            assert!(stats.snapshot_created_at.is_some());
        }

        assert!(temp_dir.path().join(STORE_SNAPSHOT_FILE).exists());
        let store = FileStore::open(temp_dir.path(), config).unwrap();
        for i in 0..5u8 {
            assert_eq!(store.get(&[i]).unwrap(), Some(vec![i]));
        }
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
            store.set(b"kept", b"1").unwrap();
        }
        let mut journal = OpenOptions::new()
            .append(true)
            .open(temp_dir.path().join(STORE_JOURNAL_FILE))
            .unwrap();
        journal.write_all(&64u32.to_le_bytes()).unwrap();
        journal.write_all(b"short").unwrap();
        drop(journal);

        let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_writes_after_torn_tail_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
            store.set(b"kept", b"1").unwrap();
        }
        let journal_path = temp_dir.path().join(STORE_JOURNAL_FILE);
        let clean_len = fs::metadata(&journal_path).unwrap().len();
        let mut journal = OpenOptions::new().append(true).open(&journal_path).unwrap();
        journal.write_all(&64u32.to_le_bytes()).unwrap();
        journal.write_all(b"short").unwrap();
        drop(journal);

        {
            let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
            assert_eq!(fs::metadata(&journal_path).unwrap().len(), clean_len);
            store.set(b"after_crash", b"2").unwrap();
        }

        let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"after_crash").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.stats().unwrap().journal_records, 2);
    }

    #[test]
    fn test_rewind_discards_partial_append() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(STORE_JOURNAL_FILE);
        let mut journal = Journal::open(path.clone(), DurabilityMode::Async, 0).unwrap();
        journal
            .append(&JournalRecord::Set {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            })
            .unwrap();
        let good_len = journal.len;

        // Simulate a write that failed halfway: bytes in the buffer and on disk
        journal.writer.write_all(&[0xAB; 3]).unwrap();
        journal.writer.flush().unwrap();
        journal.writer.write_all(&[0xCD; 2]).unwrap();
        journal.rewind();
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        journal
            .append(&JournalRecord::Set {
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            })
            .unwrap();
        drop(journal);

        let (records, valid_len) = Journal::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_failed_compaction_keeps_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path(), FileStoreConfig::default().compact_after(1))
            .unwrap();
        // A directory squatting on the snapshot path makes the rename fail
        fs::create_dir(temp_dir.path().join(STORE_SNAPSHOT_FILE)).unwrap();

        store.set(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        drop(store);

        fs::remove_dir(temp_dir.path().join(STORE_SNAPSHOT_FILE)).unwrap();
        let store = FileStore::open(temp_dir.path(), FileStoreConfig::default()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_batch_is_one_journal_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(
            temp_dir.path(),
            FileStoreConfig::default().durability(DurabilityMode::Sync),
        )
        .unwrap();
        let realm = store.with_realm(b"r/");

        let mut batch = realm.batched();
        batch.set(b"x", b"1");
        batch.set(b"y", b"2");
        batch.commit().unwrap();

        assert_eq!(store.stats().unwrap().journal_records, 1);
        assert_eq!(store.get(b"r/x").unwrap(), Some(b"1".to_vec()));

        realm.delete_prefix(b"").unwrap();
        assert!(!store.has(b"r/y").unwrap());
    }
}
