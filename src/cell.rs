use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::error::{BoxError, LoadError};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::wait::{LoadSettled, Waiter};

/// The lifecycle state of the cached value.
pub(crate) enum CellState<V> {
  /// No value is cached and nobody is computing one.
  Empty,
  /// Exactly one caller is computing a value right now.
  Loading,
  /// A value is cached.
  Loaded(Arc<V>),
}

/// The mutex-protected core of a cell: the state, the generation token,
/// and the callers suspended on an in-flight load.
pub(crate) struct CellInner<V> {
  pub(crate) state: CellState<V>,
  /// Monotonically increasing token identifying which operation most
  /// recently performed a state transition. An in-flight load captures it
  /// when it starts and may only commit while it still matches.
  generation: u64,
  pub(crate) waiters: VecDeque<Waiter>,
}

impl<V> CellInner<V> {
  /// Transitions to `Loading` and returns the ticket the load must present
  /// at commit time. Every transition advances the generation.
  fn begin_load(&mut self) -> u64 {
    self.state = CellState::Loading;
    self.generation += 1;
    self.generation
  }

  fn transition(&mut self, state: CellState<V>) {
    self.state = state;
    self.generation += 1;
    self.wake_all();
  }

  fn wake_all(&mut self) {
    for waiter in self.waiters.drain(..) {
      waiter.wake();
    }
  }
}

/// A cache for exactly one expensive, slow-changing value.
///
/// At most one loader is ever running for the cell; concurrent
/// [`get_with`](SingleFlightCache::get_with) callers share that loader's
/// result. [`insert`](SingleFlightCache::insert) and
/// [`invalidate`](SingleFlightCache::invalidate) never wait for a load:
/// they take effect immediately, and an in-flight load that they preempt
/// has its result discarded when it finishes.
///
/// Blocking threads (via `get_with`) and async tasks (via
/// [`get_async`](SingleFlightCache::get_async)) can use the same cell
/// concurrently.
pub struct SingleFlightCache<V> {
  pub(crate) inner: Mutex<CellInner<V>>,
  metrics: Arc<Metrics>,
}

impl<V> SingleFlightCache<V> {
  /// Creates a new, empty cell.
  pub fn new() -> Self {
    Self::with_metrics(Arc::new(Metrics::new()))
  }

  /// Creates a cell that reports into an existing metrics collector.
  /// Used by the keyed cache so all its cells share one set of counters.
  pub(crate) fn with_metrics(metrics: Arc<Metrics>) -> Self {
    Self {
      inner: Mutex::new(CellInner {
        state: CellState::Empty,
        generation: 0,
        waiters: VecDeque::new(),
      }),
      metrics,
    }
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    return self.metrics.snapshot();
  }

  /// Returns the cached value if one is present, without blocking and
  /// without triggering a load. No side effects.
  pub fn peek(&self) -> Option<Arc<V>> {
    let inner = self.inner.lock();
    match &inner.state {
      CellState::Loaded(value) => Some(value.clone()),
      _ => None,
    }
  }

  /// Unconditionally stores a value, regardless of whether a load is in
  /// flight. A load preempted this way has its result discarded when it
  /// finishes. Never blocks; wakes all waiters.
  pub fn insert(&self, value: V) {
    let value = Arc::new(value);
    {
      let mut inner = self.inner.lock();
      inner.transition(CellState::Loaded(value));
    }
    self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
  }

  /// Unconditionally clears the cell, regardless of whether a load is in
  /// flight. Never blocks; wakes all waiters.
  pub fn invalidate(&self) {
    let had_effect = {
      let mut inner = self.inner.lock();
      let had_effect = !matches!(inner.state, CellState::Empty);
      inner.transition(CellState::Empty);
      had_effect
    };
    if had_effect {
      self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Returns the cached value, computing it with `loader` if necessary.
  ///
  /// If the cell is empty, this call runs `loader` itself, with no lock
  /// held. If another caller is already loading, this call blocks until
  /// that load settles, then re-evaluates: usually it finds the committed
  /// value, but it may instead find the cell empty again (the load failed
  /// or an `invalidate` raced it) and become the next loader.
  ///
  /// `LoadError` is returned only when this call's own loader invocation
  /// failed; the failure of somebody else's load is never propagated to
  /// callers that were merely waiting on it.
  pub fn get_with<F, E>(&self, loader: F) -> Result<Arc<V>, LoadError>
  where
    F: FnOnce() -> Result<V, E>,
    E: Into<BoxError>,
  {
    let ticket = loop {
      let mut inner = self.inner.lock();
      match &inner.state {
        CellState::Loaded(value) => {
          let value = value.clone();
          drop(inner);
          self.metrics.hits.fetch_add(1, Ordering::Relaxed);
          return Ok(value);
        }
        CellState::Empty => break inner.begin_load(),
        CellState::Loading => {
          // Register under the same lock that guards the transition out
          // of `Loading`, then park. `unpark` before `park` leaves a
          // token, so a wakeup between the two cannot be lost. Loop to
          // re-check: parking can also end spuriously.
          inner.waiters.push_back(Waiter::Sync(thread::current()));
          drop(inner);
          thread::park();
        }
      }
    };

    // We are the loader.
    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
    let reset = LoadReset {
      cell: self,
      ticket,
      armed: true,
    };
    let outcome = loader();
    self.settle(reset, outcome.map_err(Into::into))
  }

  /// The async form of [`get_with`](SingleFlightCache::get_with): identical
  /// semantics, but waiting callers yield to their executor instead of
  /// parking a thread, and the loader is a closure returning a future,
  /// awaited with no lock held.
  ///
  /// If this future is dropped while its own load is in flight, the cell
  /// is reset to empty and waiters are woken, so an abandoned load never
  /// strands the cell.
  pub async fn get_async<F, Fut, E>(&self, loader: F) -> Result<Arc<V>, LoadError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<BoxError>,
  {
    let ticket = loop {
      {
        let mut inner = self.inner.lock();
        match &inner.state {
          CellState::Loaded(value) => {
            let value = value.clone();
            drop(inner);
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
          }
          CellState::Empty => break inner.begin_load(),
          CellState::Loading => {}
        }
      } // The lock must not be held across an await point.
      LoadSettled { cell: self }.await;
    };

    // We are the loader.
    self.metrics.misses.fetch_add(1, Ordering::Relaxed);
    let reset = LoadReset {
      cell: self,
      ticket,
      armed: true,
    };
    let outcome = loader().await;
    self.settle(reset, outcome.map_err(Into::into))
  }

  /// Resolves a finished loader invocation against the cell's current
  /// generation.
  ///
  /// On success, the value is committed only if no `insert`/`invalidate`
  /// advanced the generation while the loader ran; a preempted result is
  /// discarded and the caller receives whatever the cell holds now, or its
  /// own uncommitted value if the cell was left empty (the computation was
  /// still valid when it ran, it just must not be cached). On failure,
  /// dropping the still-armed reset guard rolls the cell back to empty so
  /// the next caller can retry, and the error goes to this caller alone.
  fn settle(
    &self,
    mut reset: LoadReset<'_, V>,
    outcome: Result<V, BoxError>,
  ) -> Result<Arc<V>, LoadError> {
    match outcome {
      Ok(value) => {
        reset.armed = false;
        let value = Arc::new(value);
        let committed;
        let result = {
          let mut inner = self.inner.lock();
          if inner.generation == reset.ticket {
            committed = true;
            inner.transition(CellState::Loaded(value.clone()));
            value
          } else {
            // Preempted. Whatever advanced the generation already woke
            // the waiters of this load; waking again is a harmless
            // spurious wakeup for anyone who registered since.
            committed = false;
            inner.wake_all();
            match &inner.state {
              CellState::Loaded(current) => current.clone(),
              _ => value,
            }
          }
        };
        if committed {
          self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
        } else {
          self.metrics.loads_discarded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
      }
      Err(source) => {
        drop(reset);
        self.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
        Err(LoadError::new(source))
      }
    }
  }
}

impl<V> Default for SingleFlightCache<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V> fmt::Debug for SingleFlightCache<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    let state = match inner.state {
      CellState::Empty => "Empty",
      CellState::Loading => "Loading",
      CellState::Loaded(_) => "Loaded",
    };
    f.debug_struct("SingleFlightCache")
      .field("state", &state)
      .field("waiters", &inner.waiters.len())
      .finish_non_exhaustive()
  }
}

/// Rolls a load back to `Empty` unless it was settled first.
///
/// While armed, dropping this guard resets the cell (if this load still
/// owns the generation) and wakes waiters. That is the failure path of
/// `settle`, but it also fires when a sync loader panics or an async
/// caller's future is dropped mid-load, so an abandoned load can never
/// leave the cell stuck in `Loading`.
struct LoadReset<'a, V> {
  cell: &'a SingleFlightCache<V>,
  ticket: u64,
  armed: bool,
}

impl<V> Drop for LoadReset<'_, V> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut inner = self.cell.inner.lock();
    if inner.generation == self.ticket {
      inner.transition(CellState::Empty);
    }
  }
}
