use parking_lot::RwLock;
use std::collections::HashMap;

/// Human readable names for byte keys, used in diagnostics.
///
/// Each [`ObjectStorage`](super::ObjectStorage) owns its own registry; aliases go away
/// with the storage that registered them.
#[derive(Debug, Default)]
pub struct AliasRegistry {
    aliases: RwLock<HashMap<Vec<u8>, String>>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `alias` for `key`, returning the alias it replaced
    pub fn register(&self, key: &[u8], alias: impl Into<String>) -> Option<String> {
        self.aliases.write().insert(key.to_vec(), alias.into())
    }

    pub fn unregister(&self, key: &[u8]) -> Option<String> {
        self.aliases.write().remove(key)
    }

    pub fn alias(&self, key: &[u8]) -> Option<String> {
        self.aliases.read().get(key).cloned()
    }

    /// The alias if one is registered, otherwise the hex rendering of the key
    pub fn describe(&self, key: &[u8]) -> String {
        match self.aliases.read().get(key) {
            Some(alias) => alias.clone(),
            None => hex::encode(key),
        }
    }

    pub fn len(&self) -> usize {
        self.aliases.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.aliases.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_falls_back_to_hex() {
        let registry = AliasRegistry::new();
        assert_eq!(registry.describe(&[0xde, 0xad]), "dead");

        assert_eq!(registry.register(&[0xde, 0xad], "genesis"), None);
        assert_eq!(registry.describe(&[0xde, 0xad]), "genesis");
        assert_eq!(
            registry.register(&[0xde, 0xad], "renamed"),
            Some("genesis".to_string())
        );

        assert_eq!(registry.unregister(&[0xde, 0xad]), Some("renamed".to_string()));
        assert!(registry.is_empty());
    }
}
