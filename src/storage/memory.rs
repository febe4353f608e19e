use super::kv::{
    BatchOp, BatchedMutations, IterDirection, KvStore, collect_key_range, collect_range,
    prefixed_keys, realm_key,
};
use crate::core::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type Tree = Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// Volatile ordered store. Realm views created with `with_realm` share one tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Tree,
    realm: Vec<u8>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in this realm
    pub fn len(&self) -> usize {
        prefixed_keys(&self.tree.read(), &self.realm).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn realm(&self) -> &[u8] {
        &self.realm
    }

    fn with_realm(&self, realm: &[u8]) -> Arc<dyn KvStore> {
        Arc::new(MemoryStore {
            tree: Arc::clone(&self.tree),
            realm: realm_key(&self.realm, realm),
        })
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.read().get(&realm_key(&self.realm, key)).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree
            .write()
            .insert(realm_key(&self.realm, key), value.to_vec());
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.read().contains_key(&realm_key(&self.realm, key)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.write().remove(&realm_key(&self.realm, key));
        Ok(())
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        let full_prefix = realm_key(&self.realm, prefix);
        let mut tree = self.tree.write();
        for key in prefixed_keys(&tree, &full_prefix) {
            tree.remove(&key);
        }
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let entries = collect_range(&self.tree.read(), &realm_key(&self.realm, prefix), direction);
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
        let keys = collect_key_range(&self.tree.read(), &realm_key(&self.realm, prefix), direction);
        for key in keys {
            if !consumer(&key[self.realm.len()..]) {
                break;
            }
        }
        Ok(())
    }

    fn batched(&self) -> Box<dyn BatchedMutations> {
        Box::new(MemoryBatch {
            tree: Arc::clone(&self.tree),
            realm: self.realm.clone(),
            ops: Vec::new(),
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryBatch {
    tree: Tree,
    realm: Vec<u8>,
    ops: Vec<BatchOp>,
}

impl BatchedMutations for MemoryBatch {
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
        let MemoryBatch { tree, ops, .. } = *self;
        let mut tree = tree.write();
        for op in ops {
            op.apply(&mut tree);
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store = MemoryStore::new();
        store.set(b"k1", b"v1").unwrap();

        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(store.has(b"k1").unwrap());
        assert!(!store.has(b"k2").unwrap());

        store.delete(b"k1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn test_realms_are_isolated() {
        let root = MemoryStore::new();
        let users = root.with_realm(b"users/");
        let orders = root.with_realm(b"orders/");

        users.set(b"1", b"alice").unwrap();
        orders.set(b"1", b"order").unwrap();

        assert_eq!(users.get(b"1").unwrap(), Some(b"alice".to_vec()));
        assert_eq!(orders.get(b"1").unwrap(), Some(b"order".to_vec()));
        assert_eq!(root.get(b"users/1").unwrap(), Some(b"alice".to_vec()));

        let nested = users.with_realm(b"x/");
        assert_eq!(nested.realm(), b"users/x/");

        users.delete_prefix(b"").unwrap();
        assert!(!users.has(b"1").unwrap());
        assert!(orders.has(b"1").unwrap());
    }

    #[test]
    fn test_iterate_strips_realm_and_stops() {
        let root = MemoryStore::new();
        let realm = root.with_realm(b"r/");
        for key in [&b"a"[..], b"b", b"c"] {
            realm.set(key, b"v").unwrap();
        }
        root.set(b"other", b"v").unwrap();

        let mut seen = Vec::new();
        realm
            .iterate(b"", IterDirection::Forward, &mut |key, _| {
                seen.push(key.to_vec());
                seen.len() < 2
            })
            .unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);

        let mut keys = Vec::new();
        realm
            .iterate_keys(b"", IterDirection::Backward, &mut |key| {
                keys.push(key.to_vec());
                true
            })
            .unwrap();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_consumer_may_write_during_iteration() {
        let store = MemoryStore::new();
        store.set(b"a", b"1").unwrap();
        store
            .iterate(b"", IterDirection::Forward, &mut |key, _| {
                store.set(&[key, &b"-copy"[..]].concat(), b"2").unwrap();
                true
            })
            .unwrap();
        assert!(store.has(b"a-copy").unwrap());
    }

    #[test]
    fn test_batch_commit_and_cancel() {
        let store = MemoryStore::new();
        store.set(b"gone", b"x").unwrap();

        let mut batch = store.batched();
        batch.set(b"a", b"1");
        batch.delete(b"gone");
        assert_eq!(batch.len(), 2);
        assert!(store.has(b"gone").unwrap());
        batch.commit().unwrap();

        assert!(store.has(b"a").unwrap());
        assert!(!store.has(b"gone").unwrap());

        let mut cancelled = store.batched();
        cancelled.set(b"never", b"1");
        cancelled.cancel();
        assert!(!store.has(b"never").unwrap());
    }
}
