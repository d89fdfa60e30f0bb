//! Cross-device/host sync primitive.
//!
//! A single cache-line-aligned 32-bit word, shared between the CPU and a
//! device stream, that transitions at most once per use from *not-ready*
//! to *ready*. The CPU writes it exactly once (`signal`); the device
//! stream polls it with a busy-wait that is expressed here as a blocking
//! host-side `wait`, standing in for a stream-memory-operation or
//! host-callback insertion a real device binding would use instead.
//!
//! `signal` carries release semantics, `wait`/`is_ready` carry acquire
//! semantics, so anything the CPU wrote before signalling is visible to
//! whoever observes `ready` afterward.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const NOT_READY: u32 = 0;
const READY: u32 = 1;

// 128-byte alignment matches `pinned::PINNED_ALIGN` so a flag never shares
// a cache line with a staging buffer header or another flag.
#[repr(align(128))]
struct AlignedFlag(AtomicU32);

/// A one-shot, cross-visibility ready flag.
///
/// Cloning shares the same underlying word. Every clone observes the
/// same transition. The flag is allocated from pinned-host-memory-sized
/// storage (`CACHE_LINE`-aligned) so CPU writers never false-share with
/// neighboring flags that a device stream is concurrently polling.
#[derive(Clone)]
pub struct SyncFlag {
    inner: Arc<AlignedFlag>,
}

impl SyncFlag {
    /// Create a new flag in the not-ready state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AlignedFlag(AtomicU32::new(NOT_READY))),
        }
    }

    /// Atomically publish *ready* from the CPU. Release ordering: every
    /// write the caller made before this call is visible to any thread
    /// that subsequently observes `ready` via [`Self::is_ready`] or
    /// [`Self::wait`].
    ///
    /// Must be called exactly once per use; calling it twice on the same
    /// flag instance is a logic error (the design forbids reset until the
    /// owning collective state is destroyed and a fresh flag allocated).
    pub fn signal(&self) {
        self.inner.0.store(READY, Ordering::Release);
    }

    /// Non-blocking check: has [`Self::signal`] been called yet?
    /// Acquire ordering: a `true` result makes every write preceding the
    /// matching `signal()` visible to the caller.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.0.load(Ordering::Acquire) == READY
    }

    /// Block the calling thread until the flag becomes ready.
    ///
    /// Stands in for the device-stream wait (a stream-memory-operation,
    /// or a host-callback insertion where that's unavailable): on a real
    /// device stream this is a non-blocking enqueue, not a spin; the
    /// simulated device stream in `hostxfer::device` uses this method to
    /// model that wait inside its own worker thread, so the *user's*
    /// calling thread is never the one that blocks here.
    pub fn wait(&self) {
        while !self.is_ready() {
            std::hint::spin_loop();
        }
    }
}

impl Default for SyncFlag {
    fn default() -> Self {
        Self::new()
    }
}
