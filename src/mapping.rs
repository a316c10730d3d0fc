//! Dictionary-style interface over a persistent table.

use crate::error::Result;

/// Mapping operations shared by persistent key-value tables.
///
/// Every method goes through the store's worker, so each call can also surface a
/// failure left behind by an earlier statement.
pub trait KeyValueMap<K, V> {
    /// Number of stored entries.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool>;

    fn contains_key(&self, key: &K) -> Result<bool>;

    /// Value stored under `key`, or [`Error::KeyNotFound`](crate::Error::KeyNotFound).
    fn get(&self, key: &K) -> Result<V>;

    /// Insert or replace the value stored under `key`.
    fn set(&self, key: &K, value: &V) -> Result<()>;

    /// Remove `key`, or fail with [`Error::KeyNotFound`](crate::Error::KeyNotFound).
    fn delete(&self, key: &K) -> Result<()>;

    /// Insert or replace every pair from `items` as one batch.
    fn update<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>;

    fn clear(&self) -> Result<()>;

    /// Keys in insertion order.
    fn keys(&self) -> Result<Vec<K>>;

    fn values(&self) -> Result<Vec<V>>;

    fn items(&self) -> Result<Vec<(K, V)>>;
}
