use singleflight_cache::SingleFlightCache;
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc, Barrier,
};
use std::thread;
use std::time::Duration;

#[test]
fn test_thundering_herd() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let num_threads = 20;

  let cell = Arc::new(SingleFlightCache::new());
  let barrier = Arc::new(Barrier::new(num_threads));
  let mut handles = vec![];

  for _ in 0..num_threads {
    let cell_clone = cell.clone();
    let barrier_clone = barrier.clone();
    let load_count = load_count.clone();
    handles.push(thread::spawn(move || {
      // Wait for all threads to be ready
      barrier_clone.wait();
      let value = cell_clone
        .get_with(move || {
          // Simulate a slow remote computation
          thread::sleep(Duration::from_millis(100));
          load_count.fetch_add(1, Ordering::SeqCst);
          Ok::<_, &str>(990)
        })
        .unwrap();
      assert_eq!(*value, 990);
    }));
  }

  for handle in handles {
    handle.join().unwrap();
  }

  // The core assertion: despite 20 concurrent requests, the loader
  // was only executed ONCE.
  assert_eq!(
    load_count.load(Ordering::SeqCst),
    1,
    "Thundering herd protection failed: loader was called more than once"
  );
  assert_eq!(cell.metrics().misses, 1);
  assert_eq!(cell.metrics().hits, (num_threads - 1) as u64);
}

#[test]
fn test_insert_preempts_inflight_load() {
  let cell: Arc<SingleFlightCache<&str>> = Arc::new(SingleFlightCache::new());
  // The loader trips this barrier once it is running, so the main thread
  // knows its insert lands strictly inside the load window.
  let started = Arc::new(Barrier::new(2));

  let loader_handle = {
    let cell = cell.clone();
    let started = started.clone();
    thread::spawn(move || {
      cell
        .get_with(move || {
          started.wait();
          thread::sleep(Duration::from_millis(100));
          Ok::<_, &str>("loaded")
        })
        .unwrap()
    })
  };

  started.wait();
  cell.insert("direct");

  // The load finished after the insert, so its result must be discarded
  // and the loading caller handed the inserted value instead.
  let loader_result = loader_handle.join().unwrap();
  assert_eq!(*loader_result, "direct");
  assert_eq!(cell.peek(), Some(Arc::new("direct")));
  assert_eq!(cell.metrics().loads_discarded, 1);
}

#[test]
fn test_invalidate_during_load_discards_result() {
  let cell: Arc<SingleFlightCache<i32>> = Arc::new(SingleFlightCache::new());
  let started = Arc::new(Barrier::new(2));

  let loader_handle = {
    let cell = cell.clone();
    let started = started.clone();
    thread::spawn(move || {
      cell
        .get_with(move || {
          started.wait();
          thread::sleep(Duration::from_millis(100));
          Ok::<_, &str>(1)
        })
        .unwrap()
    })
  };

  started.wait();
  cell.invalidate();

  // The loading caller still gets the value it computed, but the cell
  // must not cache the stale result.
  let loader_result = loader_handle.join().unwrap();
  assert_eq!(*loader_result, 1);
  assert!(cell.peek().is_none(), "stale in-flight result must not be reused");

  // A fresh get must run its own loader.
  let second_load = Arc::new(AtomicUsize::new(0));
  let value = cell
    .get_with({
      let second_load = second_load.clone();
      move || {
        second_load.fetch_add(1, Ordering::SeqCst);
        Ok::<_, &str>(2)
      }
    })
    .unwrap();
  assert_eq!(*value, 2);
  assert_eq!(second_load.load(Ordering::SeqCst), 1);
}

#[test]
fn test_waiter_becomes_loader_after_failure() {
  let cell: Arc<SingleFlightCache<i32>> = Arc::new(SingleFlightCache::new());
  let started = Arc::new(Barrier::new(2));

  // Thread A: becomes the loader and fails after a delay.
  let failing_handle = {
    let cell = cell.clone();
    let started = started.clone();
    thread::spawn(move || {
      cell.get_with(move || {
        started.wait();
        thread::sleep(Duration::from_millis(50));
        Err::<i32, _>("first load fails")
      })
    })
  };

  // Thread B: arrives while A is loading, waits, then retries with its
  // own loader once A's failure empties the cell.
  started.wait();
  let b_load_count = Arc::new(AtomicUsize::new(0));
  let waiter_handle = {
    let cell = cell.clone();
    let b_load_count = b_load_count.clone();
    thread::spawn(move || {
      cell
        .get_with(move || {
          b_load_count.fetch_add(1, Ordering::SeqCst);
          Ok::<_, &str>(42)
        })
        .unwrap()
    })
  };

  // Only the caller that executed the failing loader sees the error.
  assert!(failing_handle.join().unwrap().is_err());
  let waiter_value = waiter_handle.join().unwrap();
  assert_eq!(*waiter_value, 42);
  assert_eq!(b_load_count.load(Ordering::SeqCst), 1);
  assert_eq!(cell.peek(), Some(Arc::new(42)));
}

// The worked scenario: A starts a 100ms load of "X"; B arrives mid-load
// with its own loader; a peek mid-load sees nothing. B's loader never
// runs and both callers receive "X".
#[test]
fn test_slow_loader_scenario() {
  let cell: Arc<SingleFlightCache<&str>> = Arc::new(SingleFlightCache::new());
  let started = Arc::new(Barrier::new(2));

  let a_handle = {
    let cell = cell.clone();
    let started = started.clone();
    thread::spawn(move || {
      cell
        .get_with(move || {
          started.wait();
          thread::sleep(Duration::from_millis(100));
          Ok::<_, &str>("X")
        })
        .unwrap()
    })
  };

  started.wait();
  assert!(cell.peek().is_none(), "peek during a load must be absent");

  let b_load_count = Arc::new(AtomicUsize::new(0));
  let b_handle = {
    let cell = cell.clone();
    let b_load_count = b_load_count.clone();
    thread::spawn(move || {
      cell
        .get_with(move || {
          b_load_count.fetch_add(1, Ordering::SeqCst);
          Ok::<_, &str>("Y")
        })
        .unwrap()
    })
  };

  assert_eq!(*a_handle.join().unwrap(), "X");
  assert_eq!(*b_handle.join().unwrap(), "X");
  assert_eq!(
    b_load_count.load(Ordering::SeqCst),
    0,
    "B coalesced onto A's load; its loader must never run"
  );
}

#[test]
fn test_concurrent_load_and_invalidate_no_deadlock() {
  let cell: Arc<SingleFlightCache<i32>> = Arc::new(SingleFlightCache::new());
  let num_getters = 5;
  let barrier = Arc::new(Barrier::new(num_getters + 1));
  let mut handles = vec![];

  for _ in 0..num_getters {
    let cell_clone = cell.clone();
    let barrier_clone = barrier.clone();
    handles.push(thread::spawn(move || {
      barrier_clone.wait();
      let value = cell_clone
        .get_with(|| {
          thread::sleep(Duration::from_millis(20));
          Ok::<_, &str>(10)
        })
        .unwrap();
      assert_eq!(*value, 10);
    }));
  }

  let cell_clone = cell.clone();
  let barrier_clone = barrier.clone();
  handles.push(thread::spawn(move || {
    barrier_clone.wait();
    // Invalidate while the others are potentially loading.
    cell_clone.invalidate();
  }));

  for handle in handles {
    handle.join().unwrap(); // Test passes if it doesn't hang or panic
  }
}
