use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Load of key '{key}' failed: {reason}")]
    LoadFailed { key: String, reason: String },

    #[error("Timed executor is shut down")]
    ExecutorShutdown,

    #[error("Object storage is shut down")]
    StorageShutdown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Write-back failed for {} batch(es): {}", .0.len(), .0.join("; "))]
    WriteBack(Vec<String>),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::EncodeError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::DecodeError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
