//! A runtime-agnostic, concurrent, sync/async single-flight cache primitive.
//!
//! Fetching an expensive, slow-changing value (a remote model object, a
//! computed index, a parsed artifact) from many threads at once must not
//! compute it many times. This crate provides the coordination core for
//! that problem and nothing else:
//!
//! - **Single-flight loads**: concurrent `get_with` callers for the same
//!   cell share exactly one loader invocation and its result.
//! - **Preemptible loads**: `insert` and `invalidate` never block on an
//!   in-flight load; a load that loses the race has its result discarded.
//! - **Sync & Async**: blocking threads and async tasks can wait on the
//!   same in-flight computation. No executor dependency.
//! - **Non-Clone Support**: values are shared as `Arc<V>`, avoiding a
//!   `V: Clone` bound.
//! - **Observability**: lock-free counters with a snapshot API.
//!
//! [`SingleFlightCache`] manages a single value; [`KeyedSingleFlightCache`]
//! manages one lazily-created cell per key, with no shared state between
//! keys beyond the map itself.

// Public modules that form the API
pub mod error;
pub mod metrics;

// Internal, crate-only modules
mod cell;
mod keyed;
mod wait;

// Re-export the primary user-facing types for convenience
pub use cell::SingleFlightCache;
pub use error::LoadError;
pub use keyed::KeyedSingleFlightCache;
pub use metrics::MetricsSnapshot;
