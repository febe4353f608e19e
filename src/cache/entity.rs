use crate::core::{CacheError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Contract a domain type fulfils to be kept in an [`ObjectStorage`](super::ObjectStorage).
///
/// The key must be derived from the entity's own state and must not change while the
/// entity is cached.
pub trait Entity: Send + Sync + Sized + 'static {
    /// Backend key of this entity (realm-relative)
    fn storage_key(&self) -> Vec<u8>;

    /// Payload written to the backend
    fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Rebuilds an entity from its key and payload
    fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self>;

    /// Folds a newer version of the same entity into this resident instance.
    ///
    /// Readers holding a handle observe the merged state; the default replaces
    /// every field.
    fn merge_from(&mut self, other: Self) {
        *self = other;
    }
}

/// MessagePack encoding for serde types implementing [`Entity::to_bytes`]
pub fn encode_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| CacheError::EncodeError(format!("Failed to encode entity: {}", e)))
}

/// Counterpart of [`encode_msgpack`] for [`Entity::from_bytes`]
pub fn decode_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| CacheError::DecodeError(format!("Failed to decode entity: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Account {
        id: u32,
        balance: i64,
    }

    impl Entity for Account {
        fn storage_key(&self) -> Vec<u8> {
            self.id.to_be_bytes().to_vec()
        }

        fn to_bytes(&self) -> Result<Vec<u8>> {
            encode_msgpack(self)
        }

        fn from_bytes(_key: &[u8], bytes: &[u8]) -> Result<Self> {
            decode_msgpack(bytes)
        }
    }

    #[test]
    fn test_msgpack_payload() {
        let account = Account { id: 7, balance: -12 };
        let bytes = account.to_bytes().unwrap();
        let decoded = Account::from_bytes(&account.storage_key(), &bytes).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let result = Account::from_bytes(b"k", &[0xc1]);
        assert!(matches!(result, Err(CacheError::DecodeError(_))));
    }

    #[test]
    fn test_default_merge_replaces() {
        let mut resident = Account { id: 1, balance: 10 };
        resident.merge_from(Account { id: 1, balance: 99 });
        assert_eq!(resident.balance, 99);
    }
}
