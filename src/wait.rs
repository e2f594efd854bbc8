use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::thread::Thread;

use crate::cell::{CellState, SingleFlightCache};

/// A caller suspended on a cell that is currently loading.
/// It can be a parked OS thread or an async task's waker, so blocking
/// and async callers may wait on the same in-flight computation.
pub(crate) enum Waiter {
  Sync(Thread),
  Async(Waker),
}

impl Waiter {
  pub(crate) fn wake(self) {
    match self {
      Waiter::Sync(thread) => thread.unpark(),
      Waiter::Async(waker) => waker.wake(),
    }
  }
}

/// A future that resolves once the cell is no longer in the loading state.
///
/// Resolution does not hand the waiter a value; the caller loops and
/// re-evaluates the cell from the top, because by the time it runs the
/// state may have changed again.
#[must_use = "futures do nothing unless you .await or poll them"]
pub(crate) struct LoadSettled<'a, V> {
  pub(crate) cell: &'a SingleFlightCache<V>,
}

impl<'a, V> Future for LoadSettled<'a, V> {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // The state check and the waker registration happen under the same
    // lock that guards every transition out of `Loading`, so a wakeup
    // between them cannot be missed.
    let mut inner = self.cell.inner.lock();
    if !matches!(inner.state, CellState::Loading) {
      return Poll::Ready(());
    }

    // Push our waker to the queue if it's not already there.
    let registered = inner.waiters.iter().any(|w| match w {
      Waiter::Async(existing) => existing.will_wake(cx.waker()),
      Waiter::Sync(_) => false,
    });
    if !registered {
      inner.waiters.push_back(Waiter::Async(cx.waker().clone()));
    }

    Poll::Pending
  }
}
