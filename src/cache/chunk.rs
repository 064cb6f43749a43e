use std::ptr::NonNull;

use super::error::CacheError;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicUsize, Ordering};

/// One anonymous mmap region owned by the cache.
///
/// Chunks are carved into regions by the allocator; the chunk itself only
/// tracks how many of those regions are pinned so that shrinking knows which
/// mappings are safe to return to the OS. Payload bytes are never freed
/// individually, only when the whole chunk is unmapped.
pub(crate) struct MemoryChunk {
    ptr: NonNull<u8>,
    size: usize,
    /// Pinned regions (used by a live handle, or mid-initialization)
    /// referencing this chunk.
    pin_count: AtomicUsize,
}

// Safety: MemoryChunk owns its mapping; the raw pointer is not shared outside
// the cache's own bookkeeping.
unsafe impl Send for MemoryChunk {}
// Safety: the only mutable state is the atomic pin count.
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    /// Map a new chunk of `size` bytes at the advisory `hint` address and
    /// report it to the process-wide accounting gauges.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Map` if the mapping fails; nothing is recorded in
    /// that case.
    pub(crate) fn map(size: usize, hint: *mut u8) -> Result<Self, CacheError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe { PlatformVmOps::map(size, hint)? };

        stats::TOTAL_MAPPED.add(size);
        stats::CHUNKS_MAPPED.add(1);
        log::trace!("mapped chunk {:p} ({size} bytes)", ptr.as_ptr());

        Ok(Self {
            ptr,
            size,
            pin_count: AtomicUsize::new(0),
        })
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "chunk pin count underflow");
    }

    pub(crate) fn pins(&self) -> usize {
        self.pin_count.load(Ordering::Relaxed)
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        // Safety: pointer and size come from our own map call; the allocator
        // disposes every region metadata referencing this chunk first.
        if let Err(e) = unsafe { PlatformVmOps::unmap(self.ptr, self.size) } {
            // Unmap failures during shrink/teardown are reported, not
            // propagated; the address space is merely retained.
            log::error!("failed to unmap chunk {:p} ({} bytes): {e}", self.ptr.as_ptr(), self.size);
            return;
        }
        stats::sub_saturating(&stats::TOTAL_MAPPED, self.size);
        stats::CHUNKS_UNMAPPED.add(1);
        log::trace!("unmapped chunk {:p} ({} bytes)", self.ptr.as_ptr(), self.size);
    }
}
