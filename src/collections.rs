//! Collection helpers shared by the tree and the filters.
//!
//! Hash maps switch between gxhash and std depending on the `gxhash`
//! feature, so the crate still builds on CPUs without AES-NI/SSE2.
//! Directory children are keyed by [`NameKey`], which compares names
//! case-insensitively while the node keeps its original spelling.

use std::fmt;

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap as GxHashMap, HashMapExt, HashSet as GxHashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
use std::collections::{HashMap as StdHashMap, HashSet as StdHashSet};

/// HashMap using gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashMap<K, V> = GxHashMap<K, V>;

/// HashMap using gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashMap<K, V> = StdHashMap<K, V>;

/// HashSet using gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = GxHashSet<T>;

/// HashSet using gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = StdHashSet<T>;

/// Constructor shim so call sites read the same with either hasher
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates a new HashMap
    fn new() -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for StdHashMap<K, V> {
    fn new() -> Self {
        StdHashMap::new()
    }
}

/// Constructor shim so call sites read the same with either hasher
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates a new HashSet
    fn new() -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for StdHashSet<T> {
    fn new() -> Self {
        StdHashSet::new()
    }
}

/// Case-insensitive directory entry key
///
/// Two names that differ only in ASCII/Unicode case map to the same key, so a
/// directory can never hold both `Release` and `release`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameKey(String);

impl NameKey {
    /// Build the key for a name
    pub fn new(name: &str) -> Self {
        NameKey(name.to_lowercase())
    }

    /// The folded form used for comparison
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NameKey {
    fn from(name: &str) -> Self {
        NameKey::new(name)
    }
}

impl fmt::Debug for NameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NameKey({:?})", self.0)
    }
}
