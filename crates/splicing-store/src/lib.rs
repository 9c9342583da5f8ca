//! Ordered keyed store: namespaced scalars, sets and ordered lists.
//!
//! Every pipeline entity and the conversation checkpoint are laid out as keys
//! built by [`keys`]. Scalars carry a [`StoredValue`], encoded by [`codec`].

pub mod codec;
mod error;
pub mod keys;
mod sqlite;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use codec::{StoredValue, TABLE_PREFIX};
pub use error::{StoreError, StoreResult, ValueKind};
pub use keys::{BlockPath, KeyPath, ProjectPath, SectionPath};
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    Up,
    Down,
}

/// Persistence contract. Each operation is atomic for the key it touches and
/// visible to every caller as soon as it returns.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn set_scalar(&self, key: &KeyPath, value: &StoredValue) -> StoreResult<()>;
    async fn get_scalar(&self, key: &KeyPath) -> StoreResult<Option<StoredValue>>;
    /// Returns whether a value was removed.
    async fn delete_scalar(&self, key: &KeyPath) -> StoreResult<bool>;

    async fn add_to_set(&self, key: &KeyPath, member: &str) -> StoreResult<bool>;
    async fn remove_from_set(&self, key: &KeyPath, member: &str) -> StoreResult<bool>;
    async fn list_set(&self, key: &KeyPath) -> StoreResult<Vec<String>>;

    async fn append_to_list(&self, key: &KeyPath, value: &str) -> StoreResult<()>;
    async fn remove_first_occurrence(&self, key: &KeyPath, value: &str) -> StoreResult<bool>;
    async fn list_all(&self, key: &KeyPath) -> StoreResult<Vec<String>>;
    /// Swaps `value` with its neighbour. No-op (returns false) at either end
    /// of the list and when `value` is absent.
    async fn swap_adjacent(
        &self,
        key: &KeyPath,
        value: &str,
        direction: SwapDirection,
    ) -> StoreResult<bool>;

    /// Removes every scalar, set and list whose key starts with `prefix`.
    /// Returns the number of keys removed.
    async fn delete_by_prefix(&self, prefix: &KeyPath) -> StoreResult<u64>;
    async fn keys_with_prefix(&self, prefix: &KeyPath) -> StoreResult<Vec<KeyPath>>;
}

/// Typed JSON helpers over any [`KeyedStore`].
#[async_trait]
pub trait KeyedStoreExt: KeyedStore {
    async fn get_json<T>(&self, key: &KeyPath) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_scalar(key).await? {
            None => Ok(None),
            Some(StoredValue::Json(value)) => Ok(Some(serde_json::from_value(value)?)),
            Some(StoredValue::Table(_)) => Err(StoreError::UnexpectedValue {
                key: key.to_string(),
                expected: "JSON",
            }),
        }
    }

    async fn set_json<T>(&self, key: &KeyPath, value: &T) -> StoreResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let value = StoredValue::Json(serde_json::to_value(value)?);
        self.set_scalar(key, &value).await
    }
}

impl<S: KeyedStore + ?Sized> KeyedStoreExt for S {}
