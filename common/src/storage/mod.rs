// Durable key-value storage backends
// Cache, subscriptions and de-duplication records each live in their own
// namespace; the logical read/write contract is the `KeyValueStore` trait.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::errors::StorageError;
use async_trait::async_trait;

/// Byte-oriented key-value store
///
/// `put` must be atomic per key: a concurrent or subsequent `get` observes
/// either the previous value or the new one, never a partial write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never written or was deleted
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Atomically replace the value of a key
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Enumerate every stored key
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}
