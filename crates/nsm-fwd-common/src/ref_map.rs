//! Reference-counted map that never creates entries implicitly.
//!
//! Shared resources (tunnel ports used by several cross-connects) are kept
//! in a [`RefMap`]. Unlike the `map[key] += 1` idiom, a missing key is never
//! auto-vivified: taking a reference on a key that does not exist is an
//! explicit "insert with count 1", and dropping a reference on a key that
//! does not exist is reported as [`Release::Absent`] rather than producing a
//! zero or negative count.

use std::collections::HashMap;
use std::hash::Hash;

/// Outcome of [`RefMap::acquire_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The key was absent and has been inserted with count 1.
    Created,
    /// The key was present; the count is now the contained value.
    Shared(u32),
}

/// Outcome of [`RefMap::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release<V> {
    /// The key was not present. Nothing changed.
    Absent,
    /// The count was decremented and is still positive.
    Decremented(u32),
    /// The count reached zero; the entry was removed and is returned.
    Removed(V),
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    refs: u32,
}

/// A map whose entries live exactly as long as their reference count is
/// positive.
#[derive(Debug, Clone)]
pub struct RefMap<K, V> {
    inner: HashMap<K, Entry<V>>,
}

impl<K, V> RefMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the map holds a live entry for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the value for `key`. **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key).map(|e| &e.value)
    }

    /// Returns the reference count for `key`, or `None` if absent.
    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.refs)
    }

    /// Takes a reference on `key`.
    ///
    /// If the key is absent, `create` is called to build the value; if it
    /// fails, nothing is inserted and the error is returned.
    pub fn acquire_with<E, F>(&mut self, key: K, create: F) -> Result<Acquire, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(entry) = self.inner.get_mut(&key) {
            entry.refs += 1;
            return Ok(Acquire::Shared(entry.refs));
        }
        let value = create()?;
        self.inner.insert(key, Entry { value, refs: 1 });
        Ok(Acquire::Created)
    }

    /// Inserts `value` under `key` with count 1 if the key is absent,
    /// otherwise increments the existing count and drops `value`.
    pub fn acquire(&mut self, key: K, value: V) -> Acquire {
        match self.acquire_with::<std::convert::Infallible, _>(key, || Ok(value)) {
            Ok(outcome) => outcome,
            Err(never) => match never {},
        }
    }

    /// Drops a reference on `key`.
    pub fn release(&mut self, key: &K) -> Release<V> {
        let Some(entry) = self.inner.get_mut(key) else {
            return Release::Absent;
        };
        if entry.refs > 1 {
            entry.refs -= 1;
            return Release::Decremented(entry.refs);
        }
        match self.inner.remove(key) {
            Some(entry) => Release::Removed(entry.value),
            None => Release::Absent,
        }
    }

    /// Re-inserts a value removed by [`RefMap::release`] with count 1.
    ///
    /// Used when tearing down the backing resource failed and the entry has
    /// to stay visible for a later attempt.
    pub fn restore(&mut self, key: K, value: V) {
        self.inner.insert(key, Entry { value, refs: 1 });
    }

    /// Returns an iterator over keys, values and counts.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V, u32)> {
        self.inner.iter().map(|(k, e)| (k, &e.value, e.refs))
    }
}

impl<K, V> Default for RefMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
