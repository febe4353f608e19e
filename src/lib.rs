// ============================================================================
// memocache Library
// ============================================================================

//! Reference-counted, write-back object cache over an ordered key-value store.
//!
//! Entities implement [`Entity`] and live in an [`ObjectStorage`]. Callers hold
//! [`CachedObject`] handles; an entity stays in memory while referenced and for
//! `cache_time` afterwards, then its changes are written back to the [`KvStore`] and it
//! is evicted.
//!
//! ```
//! use memocache::{Entity, ObjectStorage, ObjectStorageConfig, MemoryStore, Result};
//! use memocache::{decode_msgpack, encode_msgpack};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Counter {
//!     name: String,
//!     hits: u64,
//! }
//!
//! impl Entity for Counter {
//!     fn storage_key(&self) -> Vec<u8> {
//!         self.name.as_bytes().to_vec()
//!     }
//!
//!     fn to_bytes(&self) -> Result<Vec<u8>> {
//!         encode_msgpack(self)
//!     }
//!
//!     fn from_bytes(_key: &[u8], bytes: &[u8]) -> Result<Self> {
//!         decode_msgpack(bytes)
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let storage: ObjectStorage<Counter> =
//!     ObjectStorage::new(Arc::new(MemoryStore::new()), ObjectStorageConfig::default())?;
//!
//! let counter = storage.store(Counter { name: "home".into(), hits: 0 })?;
//! counter.transaction(|c| c.hits += 1);
//! drop(counter);
//!
//! let hits = storage.load(b"home")?.r_transaction(|c| c.hits);
//! assert_eq!(hits, Some(1));
//! storage.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod core;
pub mod executor;
pub mod storage;

pub use cache::{
    AliasRegistry, CachedObject, Entity, EntityFlags, EvictionCallback, EvictionEvent,
    ObjectStorage, ObjectStorageConfig, PartitionPin, PartitionsManager, StorageStats,
    decode_msgpack, encode_msgpack,
};
pub use core::{CacheError, Result};
pub use executor::{PendingTasks, ScheduledTask, ShutdownPolicy, TimedExecutor};
pub use storage::{
    BatchedMutations, DurabilityMode, FileStore, FileStoreConfig, IterDirection, KvStore,
    MemoryStore, SyncedStore,
};
