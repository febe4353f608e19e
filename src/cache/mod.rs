pub mod aliases;
pub mod cached_object;
pub mod config;
pub mod entity;
pub mod flags;
pub mod object_storage;
pub mod partitions;

pub use aliases::AliasRegistry;
pub use cached_object::CachedObject;
pub use config::ObjectStorageConfig;
pub use entity::{Entity, decode_msgpack, encode_msgpack};
pub use flags::EntityFlags;
pub use object_storage::{EvictionCallback, EvictionEvent, ObjectStorage, StorageStats};
pub use partitions::{PartitionPin, PartitionsManager};
