use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Throughput ---
  pub(crate) inserts: CachePadded<AtomicU64>,
  pub(crate) invalidations: CachePadded<AtomicU64>,

  // --- Load Outcomes ---
  pub(crate) load_failures: CachePadded<AtomicU64>,
  pub(crate) loads_discarded: CachePadded<AtomicU64>,

  created_at: Instant,
}

// Manual implementation of Default to handle the non-default `Instant`.
impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      inserts: CachePadded::new(AtomicU64::new(0)),
      invalidations: CachePadded::new(AtomicU64::new(0)),
      load_failures: CachePadded::new(AtomicU64::new(0)),
      loads_discarded: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      inserts: self.inserts.load(Ordering::Relaxed),
      invalidations: self.invalidations.load(Ordering::Relaxed),
      load_failures: self.load_failures.load(Ordering::Relaxed),
      loads_discarded: self.loads_discarded.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// The number of `get_with`/`get_async` calls that observed a loaded value,
  /// including waiters that woke up to a value committed by another caller.
  pub hits: u64,
  /// The number of `get_with`/`get_async` calls that became the loader.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// The number of values stored, by explicit `insert` or by a committed load.
  pub inserts: u64,
  /// The number of manual invalidations that actually cleared something.
  pub invalidations: u64,
  /// The number of loader invocations that returned an error.
  pub load_failures: u64,
  /// The number of successful loads whose result was discarded because an
  /// `insert` or `invalidate` preempted them mid-flight.
  pub loads_discarded: u64,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("inserts", &self.inserts)
      .field("invalidations", &self.invalidations)
      .field("load_failures", &self.load_failures)
      .field("loads_discarded", &self.loads_discarded)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
