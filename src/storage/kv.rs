use crate::core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Iteration order over a key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterDirection {
    #[default]
    Forward,
    Backward,
}

/// Ordered, prefixable key-value store - the backend an object storage persists into.
///
/// Every store is scoped to a realm: a byte prefix prepended to all keys it touches.
/// Keys passed in and handed out are always realm-relative.
pub trait KvStore: Send + Sync {
    /// Returns the realm prefix of this view
    fn realm(&self) -> &[u8];

    /// Returns a view scoped to `realm` below the current realm
    fn with_realm(&self, realm: &[u8]) -> Arc<dyn KvStore>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Deletes every key starting with `prefix`
    fn delete_prefix(&self, prefix: &[u8]) -> Result<()>;

    /// Visits key/value pairs under `prefix` until the consumer returns `false`
    fn iterate(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()>;

    /// Like [`KvStore::iterate`] but without materializing values
    fn iterate_keys(
        &self,
        prefix: &[u8],
        direction: IterDirection,
        consumer: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()>;

    /// Starts an atomic multi-key mutation
    fn batched(&self) -> Box<dyn BatchedMutations>;

    /// Forces buffered writes to stable storage
    fn flush(&self) -> Result<()>;
}

/// A set of mutations applied all at once on commit
pub trait BatchedMutations: Send {
    fn set(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    /// Number of queued mutations
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(self: Box<Self>) -> Result<()>;

    /// Drops all queued mutations without applying them
    fn cancel(self: Box<Self>);
}

/// One queued mutation, keyed by the full (realm-prefixed) key
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BatchOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub(crate) fn apply(self, tree: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        match self {
            BatchOp::Set { key, value } => {
                tree.insert(key, value);
            }
            BatchOp::Delete { key } => {
                tree.remove(&key);
            }
        }
    }
}

pub(crate) fn realm_key(realm: &[u8], key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(realm.len() + key.len());
    full.extend_from_slice(realm);
    full.extend_from_slice(key);
    full
}

/// Keys under `full_prefix`, in tree order
pub(crate) fn prefixed_keys(
    tree: &BTreeMap<Vec<u8>, Vec<u8>>,
    full_prefix: &[u8],
) -> Vec<Vec<u8>> {
    tree.range(full_prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(full_prefix))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Copies the matching entries out of the tree so consumers run without the lock held
pub(crate) fn collect_range(
    tree: &BTreeMap<Vec<u8>, Vec<u8>>,
    full_prefix: &[u8],
    direction: IterDirection,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = tree
        .range(full_prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(full_prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if direction == IterDirection::Backward {
        entries.reverse();
    }
    entries
}

pub(crate) fn collect_key_range(
    tree: &BTreeMap<Vec<u8>, Vec<u8>>,
    full_prefix: &[u8],
    direction: IterDirection,
) -> Vec<Vec<u8>> {
    let mut keys = prefixed_keys(tree, full_prefix);
    if direction == IterDirection::Backward {
        keys.reverse();
    }
    keys
}
