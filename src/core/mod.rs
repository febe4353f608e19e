pub mod error;

pub use error::{CacheError, Result};
