//! Path-keyed retention tree.
//!
//! A path is a sequence of segments. Retaining a path keeps that node and, implicitly,
//! every prefix of it alive; nodes that drop to zero with no children are pruned.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Default)]
struct PartitionNode {
    retain_count: usize,
    children: HashMap<String, PartitionNode>,
}

impl PartitionNode {
    fn is_empty(&self) -> bool {
        self.retain_count == 0 && self.children.is_empty()
    }

    /// Returns `Some(true)` when this node became empty and can be removed from its parent,
    /// `None` when the path was never retained.
    fn release<S: AsRef<str>>(&mut self, path: &[S]) -> Option<bool> {
        match path.split_first() {
            None => {
                if self.retain_count == 0 {
                    return None;
                }
                self.retain_count -= 1;
            }
            Some((head, rest)) => {
                let child = self.children.get_mut(head.as_ref())?;
                if child.release(rest)? {
                    self.children.remove(head.as_ref());
                }
            }
        }
        Some(self.is_empty())
    }
}

#[derive(Debug, Default)]
pub struct PartitionsManager {
    root: Mutex<PartitionNode>,
}

impl PartitionsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain<S: AsRef<str>>(&self, path: &[S]) {
        let mut root = self.root.lock();
        let mut node = &mut *root;
        for segment in path {
            node = node
                .children
                .entry(segment.as_ref().to_string())
                .or_default();
        }
        node.retain_count += 1;
    }

    /// Releases one retain of `path`. Returns `false` if the path held no retain.
    pub fn release<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let released = self.root.lock().release(path).is_some();
        if !released {
            event!(
                Level::WARN,
                path = %join(path),
                "partition released without a matching retain"
            );
        }
        released
    }

    /// True if the node at `path` or any node below it holds a retain
    pub fn is_retained<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let root = self.root.lock();
        let mut node = &*root;
        for segment in path {
            match node.children.get(segment.as_ref()) {
                Some(child) => node = child,
                None => return false,
            }
        }
        // Empty nodes are pruned, so any surviving child implies a retained descendant.
        !node.is_empty()
    }

    /// True if `path` itself or one of its prefixes holds a direct retain
    pub fn covers<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let root = self.root.lock();
        let mut node = &*root;
        if node.retain_count > 0 {
            return true;
        }
        for segment in path {
            match node.children.get(segment.as_ref()) {
                Some(child) => node = child,
                None => return false,
            }
            if node.retain_count > 0 {
                return true;
            }
        }
        false
    }

    /// Direct retain count of the node at `path`
    pub fn retain_count<S: AsRef<str>>(&self, path: &[S]) -> usize {
        let root = self.root.lock();
        let mut node = &*root;
        for segment in path {
            match node.children.get(segment.as_ref()) {
                Some(child) => node = child,
                None => return 0,
            }
        }
        node.retain_count
    }

    pub fn is_empty(&self) -> bool {
        self.root.lock().is_empty()
    }

    /// Drops every retain
    pub fn clear(&self) {
        *self.root.lock() = PartitionNode::default();
    }
}

/// RAII retain of a partition path; released on drop
pub struct PartitionPin {
    manager: Arc<PartitionsManager>,
    path: Vec<String>,
}

impl PartitionPin {
    pub(crate) fn new(manager: Arc<PartitionsManager>, path: Vec<String>) -> Self {
        manager.retain(&path);
        Self { manager, path }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }
}

impl Drop for PartitionPin {
    fn drop(&mut self) {
        self.manager.release(&self.path);
    }
}

impl std::fmt::Debug for PartitionPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PartitionPin({})", join(&self.path))
    }
}

fn join<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(|segment| segment.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_implies_prefixes() {
        let manager = PartitionsManager::new();
        manager.retain(&["A", "B"]);

        assert!(manager.is_retained(&["A"]));
        assert!(manager.is_retained(&["A", "B"]));
        assert!(!manager.is_retained(&["A", "B", "C"]));
        assert!(!manager.is_retained(&["X"]));

        assert!(manager.release(&["A", "B"]));
        assert!(!manager.is_retained(&["A", "B"]));
        assert!(!manager.is_retained(&["A"]));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_releasing_ancestor_keeps_descendant() {
        let manager = PartitionsManager::new();
        manager.retain(&["A"]);
        manager.retain(&["A", "B"]);

        assert!(manager.release(&["A"]));
        assert!(manager.is_retained(&["A", "B"]));
        assert!(manager.is_retained(&["A"]));
        assert_eq!(manager.retain_count(&["A"]), 0);
        assert_eq!(manager.retain_count(&["A", "B"]), 1);
    }

    #[test]
    fn test_counts_stack() {
        let manager = PartitionsManager::new();
        manager.retain(&["A"]);
        manager.retain(&["A"]);
        manager.release(&["A"]);
        assert!(manager.is_retained(&["A"]));
        manager.release(&["A"]);
        assert!(!manager.is_retained(&["A"]));
    }

    #[test]
    fn test_release_without_retain() {
        let manager = PartitionsManager::new();
        manager.retain(&["A", "B"]);
        assert!(!manager.release(&["A"]));
        assert!(!manager.release(&["Z"]));
        assert!(manager.is_retained(&["A", "B"]));
    }

    #[test]
    fn test_covers_checks_prefixes_only() {
        let manager = PartitionsManager::new();
        manager.retain(&["A"]);

        assert!(manager.covers(&["A"]));
        assert!(manager.covers(&["A", "B", "C"]));
        assert!(!manager.covers(&["B"]));

        let deep = PartitionsManager::new();
        deep.retain(&["A", "B"]);
        assert!(!deep.covers(&["A"]));
        assert!(deep.covers(&["A", "B", "C"]));

        let root = PartitionsManager::new();
        root.retain::<&str>(&[]);
        assert!(root.covers(&["anything"]));
    }

    #[test]
    fn test_pin_releases_on_drop() {
        let manager = Arc::new(PartitionsManager::new());
        {
            let pin = PartitionPin::new(Arc::clone(&manager), vec!["p".to_string()]);
            assert_eq!(pin.path(), ["p".to_string()]);
            assert!(manager.is_retained(&["p"]));
        }
        assert!(!manager.is_retained(&["p"]));
    }
}
