use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};

use crate::raw::Raw;
use crate::InsertError;

/// A concurrent, lock-free map from `K` to `V`.
///
/// Overwrite semantics: inserting an existing key replaces its value and returns the old one.
/// `V: Clone` is required because, unlike a reference-counted payload, a value lives inline in
/// its leaf; handing a previous or removed value back to the caller means cloning it out before
/// the leaf is retired.
pub struct ConMap<K, V, S = RandomState> {
    raw: Raw<K, V, S>,
}

impl<K, V> ConMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates an empty map using the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V> Default for ConMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    /// Creates an empty map using the given hasher builder.
    pub fn with_hasher(hash_builder: S) -> Self {
        ConMap {
            raw: Raw::with_hasher(hash_builder),
        }
    }

    /// Looks up `key`, cloning its value out if present.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.raw.get(key)
    }

    /// Inserts `key` with `value`, returning the value it replaced, if any.
    ///
    /// Fails only if `key` collides in every bit of its hash with some other key already in the
    /// map; see [`InsertError`].
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, InsertError<K, V>> {
        self.raw.insert(key, value)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.raw.remove(key)
    }

    /// Returns `true` if the map currently holds no keys.
    ///
    /// Like the rest of this type's API, this is a momentary snapshot under concurrent
    /// modification — by the time the caller observes the result, it may already be stale.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<K, V, S> Debug for ConMap<K, V, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConMap").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::tests::NoHasher;

    #[test]
    fn default_hasher_roundtrip() {
        let map: ConMap<String, i32> = ConMap::new();
        map.insert("a".to_string(), 1).unwrap();
        map.insert("b".to_string(), 2).unwrap();
        assert_eq!(map.get("a"), Some(1));
        assert_eq!(map.remove("b"), Some(2));
        assert_eq!(map.get("b"), None);
    }

    #[test]
    fn is_empty_reflects_contents() {
        let map: ConMap<i32, i32, NoHasher> = ConMap::with_hasher(NoHasher);
        assert!(map.is_empty());
        map.insert(1, 1).unwrap();
        assert!(!map.is_empty());
        map.remove(&1);
        assert!(map.is_empty());
    }
}
