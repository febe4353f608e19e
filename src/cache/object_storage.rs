//! Reference-counted write-back cache of entities over a [`KvStore`].
//!
//! Every key has at most one resident [`CacheEntry`]. Handles count references to it;
//! once the count drops to zero an eviction check is scheduled on the storage's
//! [`TimedExecutor`]. The check writes modified state back and removes the entry.
//!
//! Lock order: cache map, then entry state, then the executor queue. Backend I/O never
//! runs under the map lock.

use super::aliases::AliasRegistry;
use super::cached_object::{CacheEntry, CachedObject, EntryState, LoadState};
use super::config::ObjectStorageConfig;
use super::entity::Entity;
use super::partitions::{PartitionPin, PartitionsManager};
use crate::core::{CacheError, Result};
use crate::executor::{ShutdownPolicy, TimedExecutor};
use crate::storage::{IterDirection, KvStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, event, info_span};

/// Outcome of an eviction attempt, reported to the eviction callback
pub enum EvictionEvent<'a, T> {
    /// The entry was written back (if needed) and left the cache.
    /// `value` is `None` for deleted or never-existing entities.
    Evicted { key: &'a [u8], value: Option<&'a T> },
    /// Write-back failed; the entry stays resident and is retried later
    Failed { key: &'a [u8], error: &'a CacheError },
}

pub type EvictionCallback<T> = Arc<dyn Fn(&EvictionEvent<'_, T>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_back_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_back_failures: AtomicU64,
}

enum Acquired<T: Entity> {
    /// The key was already resident; the unused seed is handed back
    Resident(CachedObject<T>, Option<T>),
    /// This call created the entry
    Created(CachedObject<T>),
}

impl<T: Entity> Acquired<T> {
    fn into_handle(self) -> CachedObject<T> {
        match self {
            Acquired::Resident(handle, _) | Acquired::Created(handle) => handle,
        }
    }
}

enum WriteOp {
    Set(Vec<u8>),
    Delete,
    Skip,
}

pub(crate) struct StorageCore<T: Entity> {
    backend: Arc<dyn KvStore>,
    config: ObjectStorageConfig,
    cache: RwLock<HashMap<Vec<u8>, Arc<CacheEntry<T>>>>,
    executor: TimedExecutor,
    residency: Arc<PartitionsManager>,
    pins: Arc<PartitionsManager>,
    aliases: AliasRegistry,
    on_eviction: Option<EvictionCallback<T>>,
    failures: Mutex<Vec<String>>,
    counters: Counters,
    closing: AtomicBool,
}

impl<T: Entity> StorageCore<T> {
    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(CacheError::StorageShutdown);
        }
        Ok(())
    }

    fn cache_time(&self) -> Duration {
        self.config.cache_time_duration()
    }

    fn retry_delay(&self) -> Duration {
        self.cache_time().max(self.config.pin_recheck_duration())
    }

    fn partition_of(&self, key: &[u8]) -> Vec<String> {
        let mut rest = key;
        let mut path = Vec::new();
        for &length in &self.config.key_partitions {
            if rest.is_empty() {
                break;
            }
            let (segment, tail) = rest.split_at(length.min(rest.len()));
            path.push(hex::encode(segment));
            rest = tail;
        }
        path
    }

    fn read_backend(&self, key: &[u8]) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(bytes) => T::from_bytes(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn retain_entry(&self, entry: &CacheEntry<T>) {
        let mut state = entry.state.lock();
        // Pruned entries are detached but their handles stay usable.
        debug_assert!(
            !state.evicted || entry.flags.is_deleted(),
            "retained an evicted cache entry"
        );
        state.ref_count += 1;
        if let Some(task) = state.pending_release.take() {
            task.cancel();
        }
    }

    pub(crate) fn release_entry(self: &Arc<Self>, entry: &Arc<CacheEntry<T>>, force: bool) {
        let mut state = entry.state.lock();
        assert!(
            state.ref_count > 0,
            "released cache entry {} with no outstanding references",
            hex::encode(&entry.key)
        );
        state.ref_count -= 1;
        if state.ref_count > 0 || state.evicted {
            return;
        }
        state.last_release = Some(Instant::now());
        let delay = if force { Duration::ZERO } else { self.cache_time() };
        self.schedule_check(entry, &mut state, delay, force);
    }

    fn schedule_check(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry<T>>,
        state: &mut EntryState,
        delay: Duration,
        force: bool,
    ) {
        if let Some(previous) = state.pending_release.take() {
            previous.cancel();
        }
        let core = Arc::downgrade(self);
        let target = Arc::clone(entry);
        let scheduled = self.executor.execute_after(delay, move || {
            if let Some(core) = core.upgrade() {
                core.try_evict(&target, force);
            }
        });
        match scheduled {
            Ok(task) => state.pending_release = Some(task),
            Err(err) => event!(
                Level::DEBUG,
                key = %self.aliases.describe(&entry.key),
                error = %err,
                "eviction check not scheduled"
            ),
        }
    }

    fn retain_resident(
        &self,
        cache: &HashMap<Vec<u8>, Arc<CacheEntry<T>>>,
        key: &[u8],
    ) -> Option<Arc<CacheEntry<T>>> {
        let entry = cache.get(key)?;
        self.retain_entry(entry);
        Some(Arc::clone(entry))
    }

    /// Returns a counted handle for `key`, creating the entry when it is not resident.
    ///
    /// A new entry holds `seed` when given, otherwise it is loaded from the backend while
    /// concurrent callers for the same key wait for the result.
    fn acquire(self: &Arc<Self>, key: &[u8], seed: Option<T>) -> Result<Acquired<T>> {
        self.ensure_open()?;

        let resident = {
            let cache = self.cache.read();
            self.retain_resident(&cache, key)
        };
        if let Some(entry) = resident {
            return self.await_resident(entry, seed);
        }

        let mut cache = self.cache.write();
        if let Some(entry) = self.retain_resident(&cache, key) {
            drop(cache);
            return self.await_resident(entry, seed);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let partition = self.partition_of(key);
        let persistence = self.config.persistence_enabled;
        let entry = Arc::new(match seed {
            Some(value) => CacheEntry::ready(key.to_vec(), partition, value, persistence),
            None => CacheEntry::loading(key.to_vec(), partition, persistence),
        });
        cache.insert(key.to_vec(), Arc::clone(&entry));
        self.residency.retain(&entry.partition);
        drop(cache);

        let handle = CachedObject::adopt(Arc::clone(self), Arc::clone(&entry));
        if entry.is_ready() {
            return Ok(Acquired::Created(handle));
        }

        match self.read_backend(key) {
            Ok(value) => {
                *entry.value.write() = value;
                entry.finish_load(LoadState::Ready);
                Ok(Acquired::Created(handle))
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    key = %self.aliases.describe(key),
                    error = %err,
                    "object load failed"
                );
                self.discard_failed_load(handle, &err);
                Err(err)
            }
        }
    }

    fn await_resident(
        self: &Arc<Self>,
        entry: Arc<CacheEntry<T>>,
        seed: Option<T>,
    ) -> Result<Acquired<T>> {
        let handle = CachedObject::adopt(Arc::clone(self), entry);
        match handle.entry().wait_loaded() {
            LoadState::Failed(reason) => Err(CacheError::LoadFailed {
                key: self.aliases.describe(handle.key()),
                reason,
            }),
            _ => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Acquired::Resident(handle, seed))
            }
        }
    }

    fn discard_failed_load(&self, handle: CachedObject<T>, err: &CacheError) {
        let entry = Arc::clone(handle.entry());
        {
            let mut cache = self.cache.write();
            let mut state = entry.state.lock();
            state.evicted = true;
            if self.detach(&mut cache, &entry) {
                self.residency.release(&entry.partition);
            }
        }
        entry.finish_load(LoadState::Failed(err.to_string()));
        drop(handle);
    }

    /// Forgets an entry whose creating write failed. Entries other callers already
    /// hold stay resident.
    fn discard_created(&self, handle: CachedObject<T>) {
        let entry = Arc::clone(handle.entry());
        {
            let mut cache = self.cache.write();
            let mut state = entry.state.lock();
            if state.ref_count > 1 {
                return;
            }
            state.evicted = true;
            entry.flags.set_modified(false);
            if self.detach(&mut cache, &entry) {
                self.residency.release(&entry.partition);
            }
        }
        drop(handle);
    }

    /// Removes `entry` from the map if it is still the resident one for its key
    fn detach(
        &self,
        cache: &mut HashMap<Vec<u8>, Arc<CacheEntry<T>>>,
        entry: &Arc<CacheEntry<T>>,
    ) -> bool {
        if cache
            .get(&entry.key)
            .is_some_and(|resident| Arc::ptr_eq(resident, entry))
        {
            cache.remove(&entry.key);
            return true;
        }
        false
    }

    /// Eviction check. Returns `true` when the entry left the cache.
    fn try_evict(self: &Arc<Self>, entry: &Arc<CacheEntry<T>>, force: bool) -> bool {
        let closing = self.closing.load(Ordering::Acquire);
        {
            let mut state = entry.state.lock();
            if state.evicted || state.evicting || state.ref_count > 0 {
                return false;
            }
            if let Some(task) = state.pending_release.take() {
                if task.is_pending() {
                    if !force {
                        // A later check is already queued.
                        state.pending_release = Some(task);
                        return false;
                    }
                    task.cancel();
                }
            }
            if !force && !closing {
                if let Some(released) = state.last_release {
                    let elapsed = released.elapsed();
                    if elapsed < self.cache_time() {
                        self.schedule_check(entry, &mut state, self.cache_time() - elapsed, false);
                        return false;
                    }
                }
            }
            if self.pins.covers(&entry.partition) {
                if !closing {
                    let delay = self.retry_delay();
                    self.schedule_check(entry, &mut state, delay, force);
                }
                return false;
            }
            state.evicting = true;
        }

        if let Err(err) = self.write_back(entry) {
            self.report_failure(entry, &err);
            let mut state = entry.state.lock();
            state.evicting = false;
            if state.ref_count == 0 && !closing {
                let delay = self.retry_delay();
                self.schedule_check(entry, &mut state, delay, false);
            }
            return false;
        }

        let evicted = {
            let mut cache = self.cache.write();
            let mut state = entry.state.lock();
            state.evicting = false;
            let dirty = entry.flags.is_modified() && entry.flags.persistence_enabled();
            // A release that landed during the write-back restarts the cache time
            let remaining = match state.last_release {
                Some(released) if !force && !closing => self
                    .cache_time()
                    .checked_sub(released.elapsed())
                    .filter(|left| !left.is_zero()),
                _ => None,
            };
            if state.ref_count > 0 || dirty || remaining.is_some() {
                let queued = state
                    .pending_release
                    .as_ref()
                    .is_some_and(|task| task.is_pending());
                if state.ref_count == 0 && !queued && !closing {
                    let delay = remaining.unwrap_or_else(|| self.cache_time());
                    self.schedule_check(entry, &mut state, delay, false);
                }
                false
            } else {
                state.evicted = true;
                if self.detach(&mut cache, entry) {
                    self.residency.release(&entry.partition);
                }
                true
            }
        };

        if evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            event!(
                Level::TRACE,
                key = %self.aliases.describe(&entry.key),
                "object evicted"
            );
            if let Some(callback) = &self.on_eviction {
                let value = entry.value.read();
                let value = if entry.flags.is_deleted() {
                    None
                } else {
                    value.as_ref()
                };
                callback(&EvictionEvent::Evicted {
                    key: &entry.key,
                    value,
                });
            }
        }
        evicted
    }

    fn report_failure(&self, entry: &CacheEntry<T>, err: &CacheError) {
        let key = self.aliases.describe(&entry.key);
        self.counters
            .write_back_failures
            .fetch_add(1, Ordering::Relaxed);
        event!(Level::ERROR, key = %key, error = %err, "object write-back failed");
        self.failures.lock().push(format!("{}: {}", key, err));
        if let Some(callback) = &self.on_eviction {
            callback(&EvictionEvent::Failed {
                key: &entry.key,
                error: err,
            });
        }
    }

    fn pending_write(&self, entry: &CacheEntry<T>) -> Result<WriteOp> {
        if entry.flags.is_deleted() {
            return Ok(WriteOp::Delete);
        }
        let value = entry.value.read();
        match value.as_ref() {
            Some(value) => Ok(WriteOp::Set(value.to_bytes()?)),
            None => Ok(WriteOp::Skip),
        }
    }

    /// Single-entry write-back; the modified flag is restored on failure
    fn write_back(&self, entry: &CacheEntry<T>) -> Result<()> {
        if !entry.flags.persistence_enabled() {
            entry.flags.set_modified(false);
            return Ok(());
        }
        if !entry.flags.take_modified() {
            return Ok(());
        }
        let result = match self.pending_write(entry) {
            Ok(WriteOp::Set(bytes)) => self.backend.set(&entry.key, &bytes),
            Ok(WriteOp::Delete) => self.backend.delete(&entry.key),
            Ok(WriteOp::Skip) => Ok(()),
            Err(err) => Err(err),
        };
        if result.is_err() {
            entry.flags.set_modified(true);
        }
        result
    }

    /// Writes the modified entries of `entries` in one backend batch
    fn write_back_batch(&self, entries: &[Arc<CacheEntry<T>>]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut batch = self.backend.batched();
        let mut written = Vec::new();

        for entry in entries {
            if !entry.flags.persistence_enabled() {
                entry.flags.set_modified(false);
                continue;
            }
            if !entry.flags.take_modified() {
                continue;
            }
            match self.pending_write(entry) {
                Ok(WriteOp::Set(bytes)) => {
                    batch.set(&entry.key, &bytes);
                    written.push(entry);
                }
                Ok(WriteOp::Delete) => {
                    batch.delete(&entry.key);
                    written.push(entry);
                }
                Ok(WriteOp::Skip) => {}
                Err(err) => {
                    entry.flags.set_modified(true);
                    let key = self.aliases.describe(&entry.key);
                    event!(Level::ERROR, key = %key, error = %err, "object encode failed");
                    errors.push(format!("{}: {}", key, err));
                }
            }
        }

        if batch.is_empty() {
            batch.cancel();
        } else if let Err(err) = batch.commit() {
            for entry in &written {
                entry.flags.set_modified(true);
            }
            event!(
                Level::ERROR,
                entries = written.len(),
                error = %err,
                "write-back batch failed"
            );
            errors.push(format!("batch of {} entries: {}", written.len(), err));
        }
        errors
    }

    fn flush_all(&self) -> Vec<String> {
        let dirty: Vec<Arc<CacheEntry<T>>> = self
            .cache
            .read()
            .values()
            .filter(|entry| entry.flags.is_modified())
            .cloned()
            .collect();

        let mut errors = Vec::new();
        for chunk in dirty.chunks(self.config.eviction_batch_size) {
            errors.extend(self.write_back_batch(chunk));
        }
        if let Err(err) = self.backend.flush() {
            errors.push(format!("backend flush: {}", err));
        }
        event!(
            Level::DEBUG,
            entries = dirty.len(),
            failures = errors.len(),
            "object storage flushed"
        );
        errors
    }

    /// The backend delete runs first so a failure leaves the entry untouched
    fn mark_deleted(&self, handle: &CachedObject<T>) -> Result<()> {
        if self.config.delete_write_through {
            self.backend.delete(handle.key())?;
        }
        handle.delete();
        Ok(())
    }

    fn collect_keys(&self, prefix: &[u8], skip_cache: bool) -> Result<Vec<Vec<u8>>> {
        let mut keys = BTreeSet::new();
        self.backend
            .iterate_keys(prefix, IterDirection::Forward, &mut |key| {
                keys.insert(key.to_vec());
                true
            })?;

        if !skip_cache {
            let cache = self.cache.read();
            for (key, entry) in cache.iter().filter(|(key, _)| key.starts_with(prefix)) {
                if !entry.is_ready() {
                    continue;
                }
                if entry.exists() {
                    keys.insert(key.clone());
                } else if entry.flags.is_deleted() {
                    keys.remove(key);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }
}

impl<T: Entity> Drop for StorageCore<T> {
    fn drop(&mut self) {
        let errors = self.flush_all();
        if !errors.is_empty() {
            event!(
                Level::ERROR,
                failures = errors.len(),
                "object storage dropped with unwritten changes"
            );
        }
    }
}

/// Write-back object cache of `T` entities over a [`KvStore`].
///
/// Clones share the same cache.
pub struct ObjectStorage<T: Entity> {
    inner: Arc<StorageCore<T>>,
}

impl<T: Entity> Clone for ObjectStorage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> ObjectStorage<T> {
    pub fn new(backend: Arc<dyn KvStore>, config: ObjectStorageConfig) -> Result<Self> {
        Self::build(backend, config, None)
    }

    pub fn with_eviction_callback(
        backend: Arc<dyn KvStore>,
        config: ObjectStorageConfig,
        callback: EvictionCallback<T>,
    ) -> Result<Self> {
        Self::build(backend, config, Some(callback))
    }

    fn build(
        backend: Arc<dyn KvStore>,
        config: ObjectStorageConfig,
        on_eviction: Option<EvictionCallback<T>>,
    ) -> Result<Self> {
        config.validate().map_err(CacheError::InvalidConfig)?;
        let executor = TimedExecutor::with_name("object-release", config.release_workers)?;

        event!(
            Level::DEBUG,
            realm = %hex::encode(backend.realm()),
            cache_time_ms = config.cache_time_ms,
            workers = config.release_workers,
            "object storage started"
        );

        Ok(Self {
            inner: Arc::new(StorageCore {
                backend,
                config,
                cache: RwLock::new(HashMap::new()),
                executor,
                residency: Arc::new(PartitionsManager::new()),
                pins: Arc::new(PartitionsManager::new()),
                aliases: AliasRegistry::new(),
                on_eviction,
                failures: Mutex::new(Vec::new()),
                counters: Counters::default(),
                closing: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ObjectStorageConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn KvStore> {
        &self.inner.backend
    }

    /// Key names used in this storage's log output
    pub fn aliases(&self) -> &AliasRegistry {
        &self.inner.aliases
    }

    /// Counted handle for `key`. A key missing from the backend yields a handle whose
    /// [`CachedObject::exists`] is false; the miss is cached like a hit.
    pub fn load(&self, key: &[u8]) -> Result<CachedObject<T>> {
        Ok(self.inner.acquire(key, None)?.into_handle())
    }

    /// Makes `entity` the current version of its key and marks it modified.
    ///
    /// A resident version absorbs it through [`Entity::merge_from`], so holders of
    /// existing handles see the new state.
    pub fn store(&self, entity: T) -> Result<CachedObject<T>> {
        let key = entity.storage_key();
        match self.inner.acquire(&key, Some(entity))? {
            Acquired::Created(handle) => {
                handle.set_modified(true);
                if self.inner.config.store_on_creation {
                    if let Err(err) = self.inner.write_back(handle.entry()) {
                        self.inner.discard_created(handle);
                        return Err(err);
                    }
                }
                Ok(handle)
            }
            Acquired::Resident(handle, seed) => {
                if let Some(entity) = seed {
                    let mut value = handle.entry().value.write();
                    match value.as_mut() {
                        Some(current) => current.merge_from(entity),
                        None => *value = Some(entity),
                    }
                    handle.flags().set_deleted(false);
                    handle.set_modified(true);
                }
                Ok(handle)
            }
        }
    }

    /// Inserts `entity` unless its key already holds an existing entity, here or in the
    /// backend. Of several racing callers exactly one gets `true`.
    pub fn store_if_absent(&self, entity: T) -> Result<(CachedObject<T>, bool)> {
        let key = entity.storage_key();
        let handle = self.load(&key)?;
        let inserted = Self::fill_if_absent(&handle, || entity);
        Ok((handle, inserted))
    }

    /// Loads `key`, creating it with `factory` when absent. The factory runs at most once
    /// per key no matter how many callers race.
    pub fn compute_if_absent<F>(&self, key: &[u8], factory: F) -> Result<CachedObject<T>>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let handle = self.load(key)?;
        Self::fill_if_absent(&handle, || {
            let entity = factory(key);
            debug_assert_eq!(entity.storage_key(), key, "factory produced a foreign key");
            entity
        });
        Ok(handle)
    }

    fn fill_if_absent(handle: &CachedObject<T>, make: impl FnOnce() -> T) -> bool {
        let mut value = handle.entry().value.write();
        if value.is_some() && !handle.is_deleted() {
            return false;
        }
        *value = Some(make());
        handle.flags().set_deleted(false);
        handle.set_modified(true);
        true
    }

    /// Deletes `key`. A resident entry is marked deleted; the backend key is removed
    /// right away unless `delete_write_through` is off.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.ensure_open()?;
        {
            let cache = self.inner.cache.read();
            if !cache.contains_key(key) {
                // Holding the map lock keeps a concurrent load from caching the old value.
                return self.inner.backend.delete(key);
            }
        }
        let handle = self.load(key)?;
        self.inner.mark_deleted(&handle)
    }

    /// Like [`ObjectStorage::delete`] but reports whether an existing entity was removed
    pub fn delete_if_present(&self, key: &[u8]) -> Result<bool> {
        let handle = self.load(key)?;
        if !handle.exists() {
            return Ok(false);
        }
        self.inner.mark_deleted(&handle)?;
        Ok(true)
    }

    /// True if an entry for `key` is resident in memory
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.cache.read().contains_key(key)
    }

    /// True if the backend holds `key`, ignoring unwritten in-memory state
    pub fn exists_in_store(&self, key: &[u8]) -> Result<bool> {
        self.inner.backend.has(key)
    }

    /// Resident entries, including cached misses and entries awaiting eviction
    pub fn cached_len(&self) -> usize {
        self.inner.cache.read().len()
    }

    /// Visits existing entities under `prefix` in ascending key order until `consumer`
    /// returns `false`. Resident versions win over backend payloads.
    ///
    /// Resident entities are lent under their read lock; `consumer` must not mutate them
    /// through another handle.
    pub fn for_each<F>(&self, prefix: &[u8], mut consumer: F) -> Result<()>
    where
        F: FnMut(&[u8], &T) -> bool,
    {
        self.inner.ensure_open()?;
        for key in self.inner.collect_keys(prefix, false)? {
            let resident = self.inner.cache.read().get(&key).cloned();
            let keep_going = match resident {
                Some(entry) if entry.is_ready() => {
                    let value = entry.value.read();
                    match value.as_ref() {
                        Some(value) if !entry.flags.is_deleted() => consumer(&key, value),
                        _ => true,
                    }
                }
                _ => match self.inner.read_backend(&key)? {
                    Some(value) => consumer(&key, &value),
                    None => true,
                },
            };
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Key-only variant of [`ObjectStorage::for_each`]. With `skip_cache` only backend keys
    /// are listed.
    pub fn for_each_key_only<F>(&self, prefix: &[u8], skip_cache: bool, mut consumer: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> bool,
    {
        self.inner.ensure_open()?;
        for key in self.inner.collect_keys(prefix, skip_cache)? {
            if !consumer(&key) {
                break;
            }
        }
        Ok(())
    }

    /// Drops every resident entry without writing it back and clears the backend realm
    pub fn prune(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let detached = {
            let mut cache = self.inner.cache.write();
            let entries: Vec<Arc<CacheEntry<T>>> = cache.drain().map(|(_, entry)| entry).collect();
            for entry in &entries {
                let mut state = entry.state.lock();
                state.evicted = true;
                if let Some(task) = state.pending_release.take() {
                    task.cancel();
                }
                entry.flags.set_deleted(true);
                entry.flags.set_modified(false);
            }
            self.inner.residency.clear();
            entries.len()
        };
        self.inner.backend.delete_prefix(&[])?;
        event!(
            Level::INFO,
            realm = %hex::encode(self.inner.backend.realm()),
            detached,
            "object storage pruned"
        );
        Ok(())
    }

    /// Writes every modified entity back without evicting anything
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let span = info_span!(
            "object_storage.flush",
            realm = %hex::encode(self.inner.backend.realm())
        );
        let _enter = span.enter();

        let errors = self.inner.flush_all();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CacheError::WriteBack(errors))
        }
    }

    /// Evicts every unreferenced entry now, writing modified ones back in batches.
    /// Returns the number of evicted entries.
    pub fn free_memory(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let idle: Vec<Arc<CacheEntry<T>>> = self
            .inner
            .cache
            .read()
            .values()
            .filter(|entry| {
                let state = entry.state.lock();
                state.ref_count == 0 && !state.evicting && !state.evicted
            })
            .cloned()
            .collect();

        let mut errors = Vec::new();
        for chunk in idle.chunks(self.inner.config.eviction_batch_size) {
            errors.extend(self.inner.write_back_batch(chunk));
        }

        let mut evicted = 0;
        for entry in &idle {
            if entry.flags.is_modified() && entry.flags.persistence_enabled() {
                continue;
            }
            if self.inner.try_evict(entry, true) {
                evicted += 1;
            }
        }
        event!(Level::DEBUG, candidates = idle.len(), evicted, "memory freed");

        if errors.is_empty() {
            Ok(evicted)
        } else {
            Err(CacheError::WriteBack(errors))
        }
    }

    /// Runs pending eviction checks immediately, stops the release workers and writes
    /// back whatever is still modified. Reports every write-back failure seen so far,
    /// including ones from background evictions.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return Err(CacheError::StorageShutdown);
        }
        let span = info_span!(
            "object_storage.shutdown",
            realm = %hex::encode(self.inner.backend.realm())
        );
        let _enter = span.enter();

        self.inner.executor.shutdown(ShutdownPolicy::drain());
        let mut errors = std::mem::take(&mut *self.inner.failures.lock());
        errors.extend(self.inner.flush_all());

        if errors.is_empty() {
            event!(Level::INFO, "object storage shut down");
            Ok(())
        } else {
            event!(
                Level::ERROR,
                failures = errors.len(),
                "object storage shut down with write-back failures"
            );
            Err(CacheError::WriteBack(errors))
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Keeps every entry under `key_prefix` resident until the pin is dropped.
    ///
    /// Prefixes are matched on `key_partitions` boundaries; without partitioning a pin
    /// covers the whole storage.
    pub fn pin_partition(&self, key_prefix: &[u8]) -> PartitionPin {
        PartitionPin::new(
            Arc::clone(&self.inner.pins),
            self.inner.partition_of(key_prefix),
        )
    }

    /// True while a resident entry or a pin lives at or below `key_prefix`'s partition
    pub fn is_partition_retained(&self, key_prefix: &[u8]) -> bool {
        let path = self.inner.partition_of(key_prefix);
        self.inner.residency.is_retained(&path) || self.inner.pins.is_retained(&path)
    }

    /// Write-back failures recorded by background evictions and not yet reported
    pub fn take_failures(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.failures.lock())
    }

    pub fn stats(&self) -> StorageStats {
        let counters = &self.inner.counters;
        StorageStats {
            resident: self.cached_len(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            write_back_failures: counters.write_back_failures.load(Ordering::Relaxed),
        }
    }
}
