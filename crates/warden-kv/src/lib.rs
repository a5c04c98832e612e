// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bucketed persistent key-value store.
//!
//! A thin, JSON-codec wrapper over `sled`'s native multi-tree support: each bucket
//! (satellites, modules, images, deployments, sessions, events, settings, pairings,
//! pairing_tokens) is its own `sled::Tree`, so readers of one bucket never contend
//! with writers of another.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use serde::de::DeserializeOwned;
use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from store open, read, write, or (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The underlying sled database could not be opened or operated on.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// A stored value failed to deserialize, or a value failed to serialize for storage.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The requested key was not present in the bucket.
    #[error("key not found: {0}")]
    NotFound(String),
}

impl AsErrorCode for KvError {
    fn code(&self) -> ErrorCode {
        match self {
            KvError::NotFound(_) => ErrorCode::NotFound,
            KvError::Store(_) | KvError::Codec(_) => ErrorCode::Fatal,
        }
    }
}

/// A handle on the overall store; open one per process (master or agent), then
/// obtain a [`Bucket`] per logical collection.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open (creating if absent) the sled database at `path`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, KvError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a purely in-memory store, used in tests.
    pub fn open_temporary() -> Result<Self, KvError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Obtain a typed [`Bucket`] backed by the named `sled::Tree`.
    pub fn bucket<T>(&self, name: &str) -> Result<Bucket<T>, KvError>
    where
        T: Serialize + DeserializeOwned,
    {
        let tree = self.db.open_tree(name)?;
        Ok(Bucket {
            tree,
            _marker: std::marker::PhantomData,
        })
    }

    /// Flush all pending writes to disk. Call before process exit.
    pub fn flush(&self) -> Result<(), KvError> {
        self.db.flush()?;
        Ok(())
    }
}

/// A single named collection of JSON-encoded values, keyed by an arbitrary byte string.
pub struct Bucket<T> {
    tree: sled::Tree,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Bucket<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Insert or overwrite `value` at `key`.
    pub fn put(&self, key: impl AsRef<[u8]>, value: &T) -> Result<(), KvError> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    /// Fetch the value at `key`, if present.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<T>, KvError> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch the value at `key`, erroring with [`KvError::NotFound`] if absent.
    pub fn require(&self, key: impl AsRef<[u8]> + Clone) -> Result<T, KvError> {
        self.get(key.clone())?
            .ok_or_else(|| KvError::NotFound(String::from_utf8_lossy(key.as_ref()).into_owned()))
    }

    /// Remove the value at `key`, returning it if it was present.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<Option<T>, KvError> {
        match self.tree.remove(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` exists in this bucket.
    pub fn contains(&self, key: impl AsRef<[u8]>) -> Result<bool, KvError> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Iterate every value in the bucket, in key order.
    pub fn iter_values(&self) -> impl Iterator<Item = Result<T, KvError>> + '_ {
        self.tree.iter().values().map(|res| {
            let bytes = res?;
            Ok(serde_json::from_slice(&bytes)?)
        })
    }

    /// Iterate every `(key, value)` pair in the bucket, in key order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, T), KvError>> + '_ {
        self.tree.iter().map(|res| {
            let (key, bytes) = res?;
            let value = serde_json::from_slice(&bytes)?;
            Ok((key.to_vec(), value))
        })
    }

    /// Number of entries currently in the bucket.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// `true` if the bucket holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Atomically fetch the current value at `key`, transform it, and store the
    /// result. Useful for monotonic counters (catalog/assignment versioning).
    pub fn update_and_fetch<F>(&self, key: impl AsRef<[u8]>, mut f: F) -> Result<T, KvError>
    where
        F: FnMut(Option<T>) -> T,
    {
        let key = key.as_ref();
        loop {
            let current = self.tree.get(key)?;
            let current_val: Option<T> = match &current {
                Some(bytes) => Some(serde_json::from_slice(bytes)?),
                None => None,
            };
            let next = f(current_val);
            let next_bytes = serde_json::to_vec(&next)?;
            let swapped = self
                .tree
                .compare_and_swap(key, current.as_deref(), Some(next_bytes))?;
            if swapped.is_ok() {
                return Ok(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = Store::open_temporary().unwrap();
        let bucket: Bucket<Widget> = store.bucket("widgets").unwrap();
        let widget = Widget {
            name: "a".into(),
            count: 1,
        };
        bucket.put("w1", &widget).unwrap();
        assert_eq!(bucket.get("w1").unwrap(), Some(widget));
    }

    #[test]
    fn require_errors_on_missing_key() {
        let store = Store::open_temporary().unwrap();
        let bucket: Bucket<Widget> = store.bucket("widgets").unwrap();
        assert!(matches!(
            bucket.require("missing"),
            Err(KvError::NotFound(_))
        ));
    }

    #[test]
    fn buckets_are_independent_per_tree() {
        let store = Store::open_temporary().unwrap();
        let a: Bucket<Widget> = store.bucket("a").unwrap();
        let b: Bucket<Widget> = store.bucket("b").unwrap();
        a.put("k", &Widget { name: "a".into(), count: 1 }).unwrap();
        assert!(b.get("k").unwrap().is_none());
    }

    #[test]
    fn remove_returns_previous_value() {
        let store = Store::open_temporary().unwrap();
        let bucket: Bucket<Widget> = store.bucket("widgets").unwrap();
        let widget = Widget {
            name: "a".into(),
            count: 1,
        };
        bucket.put("w1", &widget).unwrap();
        assert_eq!(bucket.remove("w1").unwrap(), Some(widget));
        assert_eq!(bucket.get("w1").unwrap(), None);
    }

    #[test]
    fn update_and_fetch_increments_monotonically() {
        let store = Store::open_temporary().unwrap();
        let bucket: Bucket<i64> = store.bucket("versions").unwrap();
        let v1 = bucket
            .update_and_fetch("catalog", |cur| cur.unwrap_or(0) + 1)
            .unwrap();
        let v2 = bucket
            .update_and_fetch("catalog", |cur| cur.unwrap_or(0) + 1)
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);
    }

    #[test]
    fn iter_values_visits_every_entry() {
        let store = Store::open_temporary().unwrap();
        let bucket: Bucket<Widget> = store.bucket("widgets").unwrap();
        bucket.put("a", &Widget { name: "a".into(), count: 1 }).unwrap();
        bucket.put("b", &Widget { name: "b".into(), count: 2 }).unwrap();
        let total: u32 = bucket
            .iter_values()
            .map(|r| r.unwrap().count)
            .sum();
        assert_eq!(total, 3);
        assert_eq!(bucket.len(), 2);
    }
}
