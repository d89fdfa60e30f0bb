//! Pinned-host memory pool.
//!
//! This module is the only place in `hostxfer-core` where unsafe memory
//! manipulation is allowed: every other module builds staging buffers on
//! top of [`PinnedBuffer`] without touching a raw pointer.
//!
//! The pool keys a free list by requested byte size; a miss falls back to
//! a fresh page-locked allocation. Preallocation is supported at
//! construction. The pool is thread-safe: user threads and the progress
//! engine both allocate and release through it.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::datatype::{Datatype, HostElement};
use crate::error::{EngineError, Result};

/// Cache-line / page alignment used for every pinned allocation, so no
/// staging buffer ever shares a cache line with another.
pub const PINNED_ALIGN: usize = 128;

struct FreeBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: ownership of the block is exclusive while it sits in the free
// list; the pool's mutex serializes all access.
unsafe impl Send for FreeBlock {}

// Most sizes only ever recycle a handful of blocks at a time (one per
// concurrently in-flight collective of that size), so a `SmallVec` keeps
// the common case off the heap without bounding how many can pile up.
type FreeList = SmallVec<[FreeBlock; 4]>;

struct PoolState {
    // Free list keyed by requested byte size (post-alignment).
    free_lists: Mutex<HashMap<usize, FreeList>>,
    preallocated_slots: usize,
}

/// A thread-safe pool of recycled page-locked host memory.
///
/// Cloning is cheap ([`PinnedPool`] is a thin `Arc` handle); every clone
/// shares the same free lists.
#[derive(Clone)]
pub struct PinnedPool {
    state: Arc<PoolState>,
}

impl PinnedPool {
    /// Create a pool with no preallocated slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(PoolState {
                free_lists: Mutex::new(HashMap::new()),
                preallocated_slots: 0,
            }),
        }
    }

    /// Create a pool and immediately allocate `slots` buffers of
    /// `bytes_each` bytes into the free list, per `AL_SYNC_MEM_PREALLOC`
    /// and the general preallocation-at-init design.
    pub fn with_preallocated(slots: usize, bytes_each: usize) -> Result<Self> {
        let pool = Self {
            state: Arc::new(PoolState {
                free_lists: Mutex::new(HashMap::new()),
                preallocated_slots: slots,
            }),
        };
        if slots > 0 && bytes_each > 0 {
            let mut warm = Vec::with_capacity(slots);
            for _ in 0..slots {
                warm.push(pool.allocate_bytes(bytes_each)?);
            }
            // Drop them back into the free list rather than returning them
            // to the caller. The point of preallocation is a warm pool.
            drop(warm);
            tracing::debug!(slots, bytes_each, "preallocated pinned staging pool");
        }
        Ok(pool)
    }

    /// Number of slots this pool was asked to preallocate at construction.
    #[must_use]
    pub const fn preallocated_slots(&self) -> usize {
        self.state.preallocated_slots
    }

    /// Allocate a typed pinned buffer able to hold `n_elements` of `T`.
    pub fn allocate<T: HostElement>(&self, n_elements: usize) -> Result<PinnedBuffer> {
        let bytes = n_elements * T::DATATYPE.size_bytes();
        let mut buf = self.allocate_bytes(bytes)?;
        buf.dtype = T::DATATYPE;
        buf.len_elements = n_elements;
        Ok(buf)
    }

    /// Allocate a raw pinned buffer of exactly `bytes` bytes, tagged as
    /// untyped (`Datatype::U8`) until a typed view is requested.
    pub fn allocate_bytes(&self, bytes: usize) -> Result<PinnedBuffer> {
        let bytes = bytes.max(1);

        if let Some(block) = self.take_from_free_list(bytes) {
            return Ok(PinnedBuffer {
                pool: self.state.clone(),
                ptr: block.ptr,
                layout: block.layout,
                dtype: Datatype::U8,
                len_elements: bytes,
            });
        }

        let layout = Layout::from_size_align(bytes, PINNED_ALIGN)
            .map_err(|e| EngineError::PinnedAllocFailed {
                bytes,
                reason: e.to_string(),
            })?;

        // SAFETY: layout has nonzero size (bytes.max(1) above) and a
        // valid power-of-two alignment.
        let raw = unsafe { alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };

        // SAFETY: `ptr` is a valid, exclusively-owned allocation of
        // `layout.size()` bytes; pass its address and length to mlock.
        let lock_result = unsafe { libc::mlock(ptr.as_ptr().cast(), layout.size()) };
        if lock_result != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(bytes, %err, "mlock failed for pinned staging allocation");
            // SAFETY: undo the allocation we just made before returning.
            unsafe { dealloc(ptr.as_ptr(), layout) };
            return Err(EngineError::PinnedAllocFailed {
                bytes,
                reason: format!("mlock failed: {err}"),
            });
        }

        Ok(PinnedBuffer {
            pool: self.state.clone(),
            ptr,
            layout,
            dtype: Datatype::U8,
            len_elements: bytes,
        })
    }

    fn take_from_free_list(&self, bytes: usize) -> Option<FreeBlock> {
        self.state.free_lists.lock().get_mut(&bytes).and_then(SmallVec::pop)
    }
}

impl Default for PinnedPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusively-owned pinned staging buffer drawn from a [`PinnedPool`].
///
/// Owned by exactly one collective state from allocation until the state
/// is destroyed, at which point `Drop` returns the block to the pool's
/// free list rather than unlocking and freeing it; recycling is the
/// point of the pool.
pub struct PinnedBuffer {
    pool: Arc<PoolState>,
    ptr: NonNull<u8>,
    layout: Layout,
    dtype: Datatype,
    len_elements: usize,
}

// SAFETY: the buffer is exclusively owned by whichever collective state
// holds it; no aliasing mutable access is possible while it's borrowed.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Byte length of the backing allocation.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.layout.size()
    }

    /// Datatype tag this buffer was allocated for.
    #[must_use]
    pub const fn dtype(&self) -> Datatype {
        self.dtype
    }

    /// Number of elements of `dtype()` this buffer is sized for.
    #[must_use]
    pub const fn len_elements(&self) -> usize {
        self.len_elements
    }

    /// Raw pointer to the pinned region, for handing to a device copy or
    /// transport call. Valid for `byte_len()` bytes.
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable raw pointer to the pinned region.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the pinned region as a typed, immutable slice of `T`.
    ///
    /// # Safety
    /// The caller must ensure `T`'s alignment divides [`PINNED_ALIGN`]
    /// (true for every [`HostElement`]) and that no device copy or
    /// transport op is concurrently writing into the buffer.
    #[must_use]
    pub unsafe fn as_slice<T: HostElement>(&self) -> &[T] {
        let n = self.byte_len() / std::mem::size_of::<T>();
        std::slice::from_raw_parts(self.ptr.as_ptr().cast::<T>(), n)
    }

    /// View the pinned region as a typed, mutable slice of `T`.
    ///
    /// # Safety
    /// Same obligations as [`Self::as_slice`], plus exclusivity: the
    /// caller must hold the only live reference.
    #[must_use]
    pub unsafe fn as_mut_slice<T: HostElement>(&mut self) -> &mut [T] {
        let n = self.byte_len() / std::mem::size_of::<T>();
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<T>(), n)
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        let block = FreeBlock {
            ptr: self.ptr,
            layout: self.layout,
        };
        self.pool
            .free_lists
            .lock()
            .entry(self.layout.size())
            .or_default()
            .push(block);
    }
}
