use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;

use crate::cell::SingleFlightCache;
use crate::error::{BoxError, LoadError};
use crate::metrics::{Metrics, MetricsSnapshot};

/// A map of lazily-created [`SingleFlightCache`] cells, one per key.
///
/// Each key gets its own independent cell: a slow load for one key never
/// delays any operation on another. The map's own lock is held only for
/// structural mutation (create-if-absent, remove), never across a load or
/// any other cell operation.
///
/// A cell is created on first use of its key and removed entirely by
/// [`invalidate`](KeyedSingleFlightCache::invalidate), so a cache that has
/// seen N keys does not retain N empty cells forever.
pub struct KeyedSingleFlightCache<K, V, H = RandomState> {
  cells: RwLock<std::collections::HashMap<K, Arc<SingleFlightCache<V>>, H>>,
  metrics: Arc<Metrics>,
}

impl<K, V> KeyedSingleFlightCache<K, V>
where
  K: Eq + Hash,
{
  /// Creates an empty keyed cache with the default hasher.
  pub fn new() -> Self {
    Self::with_hasher(RandomState::new())
  }
}

impl<K, V> Default for KeyedSingleFlightCache<K, V>
where
  K: Eq + Hash,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> KeyedSingleFlightCache<K, V, H>
where
  K: Eq + Hash,
  H: BuildHasher,
{
  /// Creates an empty keyed cache with a custom hasher.
  pub fn with_hasher(hasher: H) -> Self {
    Self {
      cells: RwLock::new(std::collections::HashMap::with_hasher(hasher)),
      metrics: Arc::new(Metrics::new()),
    }
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    return self.metrics.snapshot();
  }

  /// The number of keys with a live cell.
  pub fn len(&self) -> usize {
    self.cells.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.cells.read().is_empty()
  }

  /// Returns the cached value for `key` if one is present.
  ///
  /// A lookup for an unseen key is cheap and leaves no residue: no cell is
  /// created. Never blocks on a load, never triggers one.
  pub fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    K: Borrow<Q>,
    Q: Eq + Hash + ?Sized,
  {
    let cell = self.cells.read().get(key).cloned();
    cell.and_then(|cell| cell.peek())
  }

  /// Returns the cached value for `key`, computing it with `loader` if
  /// necessary. Single-flight per key: concurrent callers for the same key
  /// share one loader invocation. See [`SingleFlightCache::get_with`].
  pub fn get_with<F, E>(&self, key: &K, loader: F) -> Result<Arc<V>, LoadError>
  where
    K: Clone,
    F: FnOnce() -> Result<V, E>,
    E: Into<BoxError>,
  {
    self.cell(key).get_with(loader)
  }

  /// The async form of [`get_with`](KeyedSingleFlightCache::get_with).
  /// See [`SingleFlightCache::get_async`].
  pub async fn get_async<F, Fut, E>(&self, key: &K, loader: F) -> Result<Arc<V>, LoadError>
  where
    K: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<BoxError>,
  {
    self.cell(key).get_async(loader).await
  }

  /// Unconditionally stores a value for `key`, creating its cell if needed.
  /// Never blocks on an in-flight load; see [`SingleFlightCache::insert`].
  pub fn insert(&self, key: K, value: V) {
    let cell = {
      let mut cells = self.cells.write();
      cells
        .entry(key)
        .or_insert_with(|| Arc::new(SingleFlightCache::with_metrics(self.metrics.clone())))
        .clone()
    };
    cell.insert(value);
  }

  /// Removes the mapping for `key` entirely, returning `true` if one
  /// existed. The removed cell is also invalidated, so any caller still
  /// holding a reference to it (e.g. one waiting on its in-flight load)
  /// observes it reset; new lookups for `key` get a fresh cell on demand.
  /// A no-op for a key that was never seen.
  pub fn invalidate<Q>(&self, key: &Q) -> bool
  where
    K: Borrow<Q>,
    Q: Eq + Hash + ?Sized,
  {
    let removed = self.cells.write().remove(key);
    match removed {
      Some(cell) => {
        // The cell records the invalidation in the shared metrics iff it
        // actually cleared something.
        cell.invalidate();
        true
      }
      None => false,
    }
  }

  /// Removes every mapping, invalidating each removed cell.
  pub fn clear(&self) {
    let mut cells = self.cells.write();
    for (_, cell) in cells.drain() {
      cell.invalidate();
    }
  }

  /// Gets or race-free-creates the cell for `key`. Two concurrent first
  /// callers for the same unseen key always observe the same cell.
  fn cell(&self, key: &K) -> Arc<SingleFlightCache<V>>
  where
    K: Clone,
  {
    // Optimistic read for the common case of an existing cell.
    if let Some(cell) = self.cells.read().get(key) {
      return cell.clone();
    }
    let mut cells = self.cells.write();
    cells
      .entry(key.clone())
      .or_insert_with(|| Arc::new(SingleFlightCache::with_metrics(self.metrics.clone())))
      .clone()
  }
}

impl<K, V, H> fmt::Debug for KeyedSingleFlightCache<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyedSingleFlightCache")
      .field("keys", &self.cells.read().len())
      .field("metrics", &self.metrics.snapshot())
      .finish_non_exhaustive()
  }
}
