use super::entity::Entity;
use super::flags::EntityFlags;
use super::object_storage::StorageCore;
use crate::executor::ScheduledTask;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoadState {
    Loading,
    Ready,
    Failed(String),
}

/// Reference bookkeeping of one resident entry, guarded by the entry mutex
#[derive(Debug, Default)]
pub(crate) struct EntryState {
    pub(crate) ref_count: usize,
    pub(crate) last_release: Option<Instant>,
    pub(crate) evicted: bool,
    /// An eviction check is writing this entry back
    pub(crate) evicting: bool,
    pub(crate) pending_release: Option<ScheduledTask>,
}

/// The single authoritative in-memory copy of a key
pub(crate) struct CacheEntry<T: Entity> {
    pub(crate) key: Vec<u8>,
    pub(crate) partition: Vec<String>,
    pub(crate) value: RwLock<Option<T>>,
    pub(crate) flags: EntityFlags,
    pub(crate) state: Mutex<EntryState>,
    load: Mutex<LoadState>,
    loaded: Condvar,
}

impl<T: Entity> CacheEntry<T> {
    /// Placeholder published before the backend read; peers wait on it
    pub(crate) fn loading(key: Vec<u8>, partition: Vec<String>, persistence_enabled: bool) -> Self {
        Self::with_state(key, partition, None, persistence_enabled, LoadState::Loading)
    }

    pub(crate) fn ready(
        key: Vec<u8>,
        partition: Vec<String>,
        value: T,
        persistence_enabled: bool,
    ) -> Self {
        Self::with_state(
            key,
            partition,
            Some(value),
            persistence_enabled,
            LoadState::Ready,
        )
    }

    fn with_state(
        key: Vec<u8>,
        partition: Vec<String>,
        value: Option<T>,
        persistence_enabled: bool,
        load: LoadState,
    ) -> Self {
        Self {
            key,
            partition,
            value: RwLock::new(value),
            flags: EntityFlags::new(persistence_enabled),
            state: Mutex::new(EntryState {
                ref_count: 1,
                ..EntryState::default()
            }),
            load: Mutex::new(load),
            loaded: Condvar::new(),
        }
    }

    pub(crate) fn finish_load(&self, outcome: LoadState) {
        *self.load.lock() = outcome;
        self.loaded.notify_all();
    }

    /// Blocks while the entry is still loading
    pub(crate) fn wait_loaded(&self) -> LoadState {
        let mut load = self.load.lock();
        while *load == LoadState::Loading {
            self.loaded.wait(&mut load);
        }
        load.clone()
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.load.lock() == LoadState::Ready
    }

    pub(crate) fn exists(&self) -> bool {
        !self.flags.is_deleted() && self.value.read().is_some()
    }
}

/// Counted reference to a cached entity.
///
/// Holding a `CachedObject` keeps its entity resident. Cloning retains; dropping releases.
/// When the last reference goes away the storage schedules an eviction check instead of
/// evicting on the spot, so a release followed by a quick re-load stays in memory.
pub struct CachedObject<T: Entity> {
    entry: Arc<CacheEntry<T>>,
    core: Arc<StorageCore<T>>,
    force_release: bool,
}

impl<T: Entity> CachedObject<T> {
    /// Wraps a reference the caller already counted
    pub(crate) fn adopt(core: Arc<StorageCore<T>>, entry: Arc<CacheEntry<T>>) -> Self {
        Self {
            entry,
            core,
            force_release: false,
        }
    }

    pub(crate) fn entry(&self) -> &Arc<CacheEntry<T>> {
        &self.entry
    }

    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }

    /// Another reference to the same entity
    pub fn retain(&self) -> Self {
        self.core.retain_entry(&self.entry);
        Self::adopt(Arc::clone(&self.core), Arc::clone(&self.entry))
    }

    pub fn release(self) {
        drop(self);
    }

    /// Releases and asks for eviction without waiting for the cache time to pass
    pub fn release_force(mut self) {
        self.force_release = true;
        drop(self);
    }

    /// True when the entity has a value and is not marked deleted
    pub fn exists(&self) -> bool {
        self.entry.exists()
    }

    /// Runs `f` on the entity with exclusive access, marks it modified, then releases.
    ///
    /// Returns `None` without calling `f` when the entity does not exist.
    pub fn consume<R>(self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.transaction(f)
    }

    /// Runs `f` with exclusive access and marks the entity modified; keeps the reference
    pub fn transaction<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut value = self.entry.value.write();
        if self.entry.flags.is_deleted() {
            return None;
        }
        let entity = value.as_mut()?;
        let result = f(entity);
        self.entry.flags.set_modified(true);
        Some(result)
    }

    /// Runs `f` with shared access
    pub fn r_transaction<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let value = self.entry.value.read();
        if self.entry.flags.is_deleted() {
            return None;
        }
        value.as_ref().map(f)
    }

    /// Marks the entity deleted; the backend key goes away at write-back
    pub fn delete(&self) {
        self.entry.flags.set_deleted(true);
        self.entry.flags.set_modified(true);
    }

    pub fn flags(&self) -> &EntityFlags {
        &self.entry.flags
    }

    pub fn is_modified(&self) -> bool {
        self.entry.flags.is_modified()
    }

    pub fn set_modified(&self, modified: bool) {
        self.entry.flags.set_modified(modified);
    }

    pub fn is_deleted(&self) -> bool {
        self.entry.flags.is_deleted()
    }

    pub fn persistence_enabled(&self) -> bool {
        self.entry.flags.persistence_enabled()
    }

    pub fn set_persistence_enabled(&self, enabled: bool) {
        self.entry.flags.set_persistence_enabled(enabled);
    }

    /// Live references to this entity, this one included
    pub fn ref_count(&self) -> usize {
        self.entry.state.lock().ref_count
    }
}

impl<T: Entity> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<T: Entity> Drop for CachedObject<T> {
    fn drop(&mut self) {
        self.core.release_entry(&self.entry, self.force_release);
    }
}

impl<T: Entity + std::fmt::Debug> std::fmt::Debug for CachedObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedObject")
            .field("key", &hex::encode(&self.entry.key))
            .field("value", &*self.entry.value.read())
            .field("flags", &self.entry.flags)
            .finish()
    }
}
