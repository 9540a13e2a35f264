//! A lock-free, linearizable concurrent hash-array-mapped trie.
//!
//! [`ConMap`] and [`ConSet`] are concurrent analogues of
//! [`std::collections::HashMap`]/`HashSet` that support lookup, insert, and remove without
//! mutual exclusion: readers never block, and writers make progress by publishing new
//! substructure with compare-and-swap rather than taking a lock. The tree starts out as narrow
//! (4-slot) array-nodes and grows wide (16-slot) ones under a collision, shrinking back down as
//! keys are removed; all of that restructuring happens cooperatively — any thread that lands on
//! a restructuring marker helps finish it before retrying its own operation.
//!
//! ```
//! use catrie::ConMap;
//!
//! let map = ConMap::new();
//! map.insert("answer", 42).unwrap();
//! assert_eq!(map.get("answer"), Some(42));
//! assert_eq!(map.remove("answer"), Some(42));
//! ```

mod map;
mod raw;
mod set;

pub use map::ConMap;
pub use set::ConSet;

/// Error returned by [`ConMap::insert`] when it cannot proceed.
///
/// The only kind the engine can produce is a full hash collision: two distinct keys whose hashes
/// agree in every bit. This implementation does not grow list-nodes to hold colliding leaves
/// (see the crate-level design notes); instead it hands the binding back so the caller can decide
/// what to do — log it, use a different hasher, or treat it as a capacity error.
#[derive(Debug, thiserror::Error)]
pub enum InsertError<K, V> {
    /// Two distinct keys share an identical hash all the way down.
    #[error("hash collision: key maps to the same hash as an existing, distinct key")]
    HashCollision {
        /// The key that could not be inserted.
        key: K,
        /// The value that would have been associated with it.
        value: V,
    },
}
