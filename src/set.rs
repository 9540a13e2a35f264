use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};

use crate::map::ConMap;

/// A concurrent, lock-free set of `K`. A thin wrapper over `ConMap<K, (), S>` — a set is a map
/// nobody asked the value of.
pub struct ConSet<K, S = RandomState> {
    map: ConMap<K, (), S>,
}

impl<K> ConSet<K>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty set using the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K> Default for ConSet<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> ConSet<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Creates an empty set using the given hasher builder.
    pub fn with_hasher(hash_builder: S) -> Self {
        ConSet {
            map: ConMap::with_hasher(hash_builder),
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.get(key).is_some()
    }

    /// Inserts `key`, returning `true` if it was newly added.
    ///
    /// A full hash collision with an existing distinct key is reported the same way
    /// [`ConMap::insert`] reports it, just without a value to hand back — the caller only learns
    /// that the key could not be inserted.
    pub fn insert(&self, key: K) -> Result<bool, crate::InsertError<K, ()>> {
        self.map.insert(key, ()).map(|prev| prev.is_none())
    }

    /// Removes `key`, returning `true` if it had been present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.remove(key).is_some()
    }

    /// Returns `true` if the set currently holds no keys.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, S> Debug for ConSet<K, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConSet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_contains_remove() {
        let set: ConSet<i32> = ConSet::new();
        assert!(set.insert(1).unwrap());
        assert!(!set.insert(1).unwrap());
        assert!(set.contains(&1));
        assert!(set.remove(&1));
        assert!(!set.contains(&1));
    }
}
