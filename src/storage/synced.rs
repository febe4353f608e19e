use super::kv::{BatchedMutations, IterDirection, KvStore};
use crate::core::Result;
use std::sync::Arc;

/// Decorator that flushes the wrapped store to stable storage after every mutation.
///
/// Trades write latency for durability without changing the [`KvStore`] contract.
#[derive(Clone)]
pub struct SyncedStore {
    inner: Arc<dyn KvStore>,
}

impl SyncedStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn KvStore> {
        &self.inner
    }
}

impl KvStore for SyncedStore {
    fn realm(&self) -> &[u8] {
        self.inner.realm()
    }

    fn with_realm(&self, realm: &[u8]) -> Arc<dyn KvStore> {
        Arc::new(SyncedStore::new(self.inner.with_realm(realm)))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.set(key, value)?;
        self.inner.flush()
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        self.inner.has(key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)?;
        self.inner.flush()
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.inner.delete_prefix(prefix)?;
        self.inner.flush()
    }

    fn iterate(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        self.inner.iterate(prefix, direction, consumer)
    }

    fn iterate_keys(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        self.inner.iterate_keys(prefix, direction, consumer)
    }

    fn batched(&self) -> Box<dyn BatchedMutations> {
        Box::new(SyncedBatch {
            batch: self.inner.batched(),
            store: Arc::clone(&self.inner),
        })
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

struct SyncedBatch {
    batch: Box<dyn BatchedMutations>,
    store: Arc<dyn KvStore>,
}

impl BatchedMutations for SyncedBatch {
    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.batch.set(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.batch.delete(key);
    }

    fn len(&self) -> usize {
        self.batch.len()
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.batch.commit()?;
        self.store.flush()
    }

    fn cancel(self: Box<Self>) {
        self.batch.cancel();
    }
}
