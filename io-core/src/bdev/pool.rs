//! The shared `BdevIo` pool. One process-wide budget with per-thread
//! caches so the hot path allocates without touching global state, plus a
//! per-thread wait queue for callers that found the pool dry.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

type IoWaiter = Box<dyn FnOnce() + Send>;

struct ThreadCache {
    cached: u32,
    waiters: VecDeque<IoWaiter>,
}

struct PoolState {
    free: u32,
    caches: HashMap<u64, ThreadCache>,
}

/// Credit pool for I/O descriptors. `get` must succeed for an I/O to be
/// built; `put` runs at completion and feeds one waiter per freed slot.
pub struct IoPool {
    cache_size: u32,
    state: Mutex<PoolState>,
}

impl IoPool {
    pub(crate) fn new(pool_size: u32, cache_size: u32) -> Self {
        Self {
            cache_size,
            state: Mutex::new(PoolState {
                free: pool_size,
                caches: HashMap::new(),
            }),
        }
    }

    /// Take one descriptor credit on behalf of a thread.
    ///
    /// Returns false when exhausted, or when this thread already has
    /// waiters queued; handing out descriptors past the queue would
    /// starve them.
    pub(crate) fn get(&self, thread_id: u64) -> bool {
        let mut state = self.state.lock();
        let cache = state.caches.entry(thread_id).or_insert(ThreadCache {
            cached: 0,
            waiters: VecDeque::new(),
        });

        if cache.cached > 0 {
            cache.cached -= 1;
            return true;
        }

        if !cache.waiters.is_empty() {
            return false;
        }

        if state.free > 0 {
            state.free -= 1;
            true
        } else {
            false
        }
    }

    /// Return one credit from a thread. Fills the thread cache first and
    /// spills to the shared pool once the cache is full; then wakes one
    /// waiter for the freed slot.
    pub(crate) fn put(&self, thread_id: u64) {
        let waiter = {
            let mut state = self.state.lock();
            let cache =
                state.caches.entry(thread_id).or_insert(ThreadCache {
                    cached: 0,
                    waiters: VecDeque::new(),
                });

            if let Some(w) = cache.waiters.pop_front() {
                // The freed slot goes straight to the waiter; no credit
                // movement.
                Some(w)
            } else {
                if cache.cached < self.cache_size {
                    cache.cached += 1;
                } else {
                    state.free += 1;
                }
                None
            }
        };

        if let Some(w) = waiter {
            w();
        }
    }

    /// Queue a waiter to be resumed when this thread frees a descriptor.
    pub(crate) fn wait(&self, thread_id: u64, w: IoWaiter) {
        debug!(thread_id, "bdev io pool exhausted, queueing waiter");
        let mut state = self.state.lock();
        state
            .caches
            .entry(thread_id)
            .or_insert(ThreadCache {
                cached: 0,
                waiters: VecDeque::new(),
            })
            .waiters
            .push_back(w);
    }

    /// Release a thread's cached credits back to the pool (management
    /// channel teardown).
    pub(crate) fn drop_thread_cache(&self, thread_id: u64) {
        let mut state = self.state.lock();
        if let Some(cache) = state.caches.remove(&thread_id) {
            state.free += cache.cached;
        }
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> u32 {
        self.state.lock().free
    }
}

#[cfg(test)]
mod tests {
    use super::IoPool;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn cache_fills_before_pool() {
        let pool = IoPool::new(8, 2);

        assert!(pool.get(1));
        assert!(pool.get(1));
        assert_eq!(pool.free_count(), 6);

        pool.put(1);
        pool.put(1);
        // Both returns land in the thread cache.
        assert_eq!(pool.free_count(), 6);
        pool.put(1);
        // Cache full, third spills to the pool.
        assert_eq!(pool.free_count(), 7);
    }

    #[test]
    fn exhaustion_and_waiters() {
        let pool = IoPool::new(2, 1);
        assert!(pool.get(1));
        assert!(pool.get(1));
        assert!(!pool.get(1));

        let woken = Arc::new(AtomicU32::new(0));
        let w = woken.clone();
        pool.wait(1, Box::new(move || {
            w.fetch_add(1, Ordering::Relaxed);
        }));

        // With a waiter queued, even a freed credit must not be stolen by
        // a direct get on that thread.
        pool.put(1);
        assert_eq!(woken.load(Ordering::Relaxed), 1);

        pool.put(1);
        assert!(pool.get(1));
    }
}
