//! Device-event pool.
//!
//! A device event is a reusable device-side synchronization token. Creating
//! one is not free on the hot path, so the pool recycles released tokens
//! rather than constructing a fresh one per collective. Events are created
//! lazily and there is no upper bound on how many the pool can hold.
//!
//! A single token supports many concurrent readers (`query`) and exactly
//! one writer (`mark_complete`, called once by whoever records the event);
//! callers that need to share a token between the progress engine and a
//! request handle should wrap it in an `Arc` so the underlying slot is
//! only returned to the free list once every reader has dropped its
//! reference.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque identity for one device event.
///
/// Stands in for whatever handle a real device runtime binding would hand
/// back from its event-creation call (e.g. a `cudaEvent_t`). The pool
/// assigns a monotonically increasing id so recycled tokens are
/// distinguishable in logs from freshly created ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

struct FreeSlot {
    id: EventId,
    ready: Arc<AtomicBool>,
}

struct PoolState {
    free: Mutex<Vec<FreeSlot>>,
    next_id: AtomicU64,
    created: AtomicU64,
}

/// A thread-safe pool of recycled device events.
///
/// Cloning is cheap. Every clone shares the same free list.
#[derive(Clone)]
pub struct EventPool {
    state: Arc<PoolState>,
}

impl EventPool {
    /// Create an empty pool. Events are created lazily on first
    /// [`EventPool::get_event`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(PoolState {
                free: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                created: AtomicU64::new(0),
            }),
        }
    }

    /// Total number of events this pool has ever created (recycled events
    /// are not double-counted). Mostly useful for tests and diagnostics.
    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.state.created.load(Ordering::Relaxed)
    }

    /// Number of events currently sitting in the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.free.lock().len()
    }

    /// Obtain an event token suitable for recording on any stream, reusing
    /// a released one if the free list is non-empty. A reused token's
    /// readiness is reset to not-completed before it is handed back.
    pub fn get_event(&self) -> DeviceEventToken {
        if let Some(slot) = self.state.free.lock().pop() {
            slot.ready.store(false, Ordering::Relaxed);
            return DeviceEventToken {
                id: slot.id,
                ready: slot.ready,
                pool: self.state.clone(),
            };
        }
        let id = EventId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.created.fetch_add(1, Ordering::Relaxed);
        DeviceEventToken {
            id,
            ready: Arc::new(AtomicBool::new(false)),
            pool: self.state.clone(),
        }
    }

    /// Return an event to the pool for reuse. Equivalent to dropping the
    /// token, spelled out for call sites that want to be explicit about
    /// when release happens.
    pub fn release_event(&self, token: DeviceEventToken) {
        drop(token);
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A device event checked out from an [`EventPool`].
///
/// Returned to the pool's free list on drop. By design there is no
/// explicit "destroy"; destruction of the pool itself (dropping the last
/// `EventPool` handle along with every outstanding token) drops every
/// pooled event.
pub struct DeviceEventToken {
    id: EventId,
    ready: Arc<AtomicBool>,
    pool: Arc<PoolState>,
}

impl DeviceEventToken {
    /// Opaque identity, useful for correlating log lines across a
    /// record/query pair.
    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// Non-blocking completion query, safe to call from the progress
    /// engine's poll loop.
    #[must_use]
    pub fn query(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark this event completed. Called by whoever records it (a device
    /// stream, in the simulated implementation) once every op enqueued
    /// before the record point has run.
    pub fn mark_complete(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

impl Drop for DeviceEventToken {
    fn drop(&mut self) {
        self.pool.free.lock().push(FreeSlot {
            id: self.id,
            ready: self.ready.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_created_and_reused() {
        let pool = EventPool::new();
        assert_eq!(pool.created_count(), 0);

        let first_id = pool.get_event().id();
        assert_eq!(pool.created_count(), 1);

        // token dropped here, returned to free list
        assert_eq!(pool.free_count(), 1);

        let second = pool.get_event();
        assert_eq!(second.id(), first_id);
        assert_eq!(pool.created_count(), 1, "reuse must not create a new event");
    }

    #[test]
    fn unbounded_growth_under_contention() {
        let pool = EventPool::new();
        let tokens: Vec<_> = (0..8).map(|_| pool.get_event()).collect();
        assert_eq!(pool.created_count(), 8);
        drop(tokens);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn mark_complete_is_observed_by_query() {
        let pool = EventPool::new();
        let token = pool.get_event();
        assert!(!token.query());
        token.mark_complete();
        assert!(token.query());
    }

    #[test]
    fn reused_token_does_not_inherit_prior_completion() {
        let pool = EventPool::new();
        let first = pool.get_event();
        first.mark_complete();
        drop(first);

        let second = pool.get_event();
        assert!(!second.query(), "recycled token must reset readiness");
    }

    #[test]
    fn shared_via_arc_across_threads() {
        use std::sync::Arc;

        let pool = EventPool::new();
        let token = Arc::new(pool.get_event());
        let writer = token.clone();
        let handle = std::thread::spawn(move || writer.mark_complete());
        handle.join().unwrap();
        assert!(token.query());
    }

    #[test]
    fn pool_itself_is_thread_safe() {
        let pool = EventPool::new();
        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                let _ = pool2.get_event();
            }
        });
        for _ in 0..100 {
            let _ = pool.get_event();
        }
        handle.join().unwrap();
    }
}
