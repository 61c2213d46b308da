use std::fmt;

use async_trait::async_trait;

/// Errors a storage adapter can report.
/// None of these ever reach a navigation caller; they are logged and dropped.
#[derive(Debug)]
pub enum StorageError {
    /// Backing store could not be read or written (disk full, permissions).
    Io(std::io::Error),
    /// Key cannot be mapped onto the backing store.
    InvalidKey(String),
    /// Backing store is not available at all.
    Unavailable(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "storage I/O error: {e}"),
            StorageError::InvalidKey(key) => write!(f, "invalid storage key: {key:?}"),
            StorageError::Unavailable(msg) => write!(f, "storage unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

/// Async string key/value persistence used by history and the state store.
///
/// Implementations must tolerate concurrent calls for different keys.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the name of the adapter (for logs).
    fn name(&self) -> &str;

    /// Reads a value. `Ok(None)` when the key has never been written.
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes a value, replacing any previous one.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes a value. Removing a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}
