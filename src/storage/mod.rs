pub mod kv;
pub mod memory;
pub mod persistence;
pub mod synced;

pub use kv::{BatchOp, BatchedMutations, IterDirection, KvStore};
pub use memory::MemoryStore;
pub use persistence::{DurabilityMode, FileStore, FileStoreConfig, FileStoreStats};
pub use synced::SyncedStore;
