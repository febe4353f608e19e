//! Shared fixtures for integration tests

#![allow(dead_code)]

use memocache::{
    BatchedMutations, CacheError, Entity, IterDirection, KvStore, MemoryStore, Result,
    decode_msgpack, encode_msgpack,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub value: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Item {
    pub fn new(id: &str, value: i64) -> Self {
        Self {
            id: id.to_string(),
            value,
            tags: Vec::new(),
        }
    }
}

impl Entity for Item {
    fn storage_key(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_msgpack(self)
    }

    fn from_bytes(_key: &[u8], bytes: &[u8]) -> Result<Self> {
        decode_msgpack(bytes)
    }

    /// Keeps tags from both versions
    fn merge_from(&mut self, other: Self) {
        self.value = other.value;
        for tag in other.tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Memory store that counts reads and can be told to fail or stall writes
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub gets: Arc<AtomicUsize>,
    pub fail_writes: Arc<AtomicBool>,
    pub write_delay_ms: Arc<AtomicU64>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Every single-key `set` sleeps this long before writing
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::StorageError("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl KvStore for FlakyStore {
    fn realm(&self) -> &[u8] {
        self.inner.realm()
    }

    fn with_realm(&self, realm: &[u8]) -> Arc<dyn KvStore> {
        self.inner.with_realm(realm)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.check_writes()?;
        self.inner.set(key, value)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        self.inner.has(key)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writes()?;
        self.inner.delete(key)
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.check_writes()?;
        self.inner.delete_prefix(prefix)
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
        Box::new(FlakyBatch {
            batch: self.inner.batched(),
            fail_writes: Arc::clone(&self.fail_writes),
        })
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

struct FlakyBatch {
    batch: Box<dyn BatchedMutations>,
    fail_writes: Arc<AtomicBool>,
}

impl BatchedMutations for FlakyBatch {
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
        if self.fail_writes.load(Ordering::SeqCst) {
            self.batch.cancel();
            return Err(CacheError::StorageError("injected batch failure".to_string()));
        }
        self.batch.commit()
    }

    fn cancel(self: Box<Self>) {
        self.batch.cancel();
    }
}
