use std::ptr::NonNull;

use super::error::CacheError;

/// Abstract interface for the anonymous-mapping operations the cache needs.
///
/// The real implementation issues `mmap`/`munmap`; under `cfg(loom)`/`cfg(miri)`
/// a heap-backed mock is substituted so the synchronization logic can be model
/// checked without real syscalls.
pub(crate) trait VmOps {
    /// Map an anonymous, private, read-write region of `size` bytes.
    ///
    /// `hint` is advisory (never `MAP_FIXED`): the kernel may place the
    /// mapping anywhere. Pass null to let the kernel choose.
    unsafe fn map(size: usize, hint: *mut u8) -> Result<NonNull<u8>, CacheError>;

    /// Unmap a region previously returned by [`map`](VmOps::map).
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), CacheError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{CacheError, NonNull, PlatformVmOps, VmOps};
    use std::io;

    // Pre-fault the mapping where the platform supports it: the cache fills
    // freshly mapped chunks almost immediately, so taking the minor faults
    // up front is a net win.
    #[cfg(target_os = "linux")]
    const MAP_EXTRA_FLAGS: libc::c_int = libc::MAP_POPULATE;
    #[cfg(not(target_os = "linux"))]
    const MAP_EXTRA_FLAGS: libc::c_int = 0;

    impl VmOps for PlatformVmOps {
        unsafe fn map(size: usize, hint: *mut u8) -> Result<NonNull<u8>, CacheError> {
            if size == 0 {
                return Err(CacheError::Map(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    hint.cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | MAP_EXTRA_FLAGS,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(CacheError::Map(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(CacheError::Map(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), CacheError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(CacheError::Unmap(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                raw as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/munmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every mapping
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`)
// and ignore the placement hint.
//
// This is sufficient for testing the *synchronization* logic of the cache
// (loom) and detecting undefined behaviour in unsafe pointer code (Miri);
// actual mapping behaviour is tested by the real platform implementation in
// normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn map(size: usize, _hint: *mut u8) -> Result<NonNull<u8>, CacheError> {
        if size == 0 {
            return Err(CacheError::Map(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| CacheError::Map(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            CacheError::Map(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), CacheError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| CacheError::Unmap(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

// ---------------------------------------------------------------------------
// Placement hints
// ---------------------------------------------------------------------------

/// Default chunk placement hint: a pseudo-random, 64 KiB-aligned address in a
/// high span of the address space, well away from where the default allocator
/// places its arenas. Keeping cache payloads far from malloc'd memory makes
/// stray writes into either side fault instead of silently corrupting the
/// other.
///
/// The hint is advisory; if the kernel dislikes it the mapping simply lands
/// elsewhere.
#[cfg(not(loom))]
pub(crate) fn default_address_hint(_chunk_size: usize) -> *mut u8 {
    use std::sync::atomic::{AtomicU64, Ordering};

    // SplitMix64 over a process-global counter.
    static STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

    let mut x = STATE.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^= x >> 31;

    // 44-bit span starting at 1 << 45: canonical on every supported 64-bit
    // target, far above typical heap and library mappings.
    const SPAN_BASE: u64 = 1 << 45;
    const SPAN_MASK: u64 = (1 << 44) - 1;
    const HINT_ALIGN: u64 = 64 * 1024;

    let addr = (SPAN_BASE + (x & SPAN_MASK)) & !(HINT_ALIGN - 1);
    addr as *mut u8
}

/// Under loom the mock ignores hints; skip the (std-atomic) generator.
#[cfg(loom)]
pub(crate) fn default_address_hint(_chunk_size: usize) -> *mut u8 {
    std::ptr::null_mut()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size, std::ptr::null_mut()).expect("map failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);
            PlatformVmOps::unmap(ptr, size).expect("unmap failed");
        }
    }

    #[test]
    fn test_map_zero_size_fails() {
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::map(0, std::ptr::null_mut()) };
        assert!(matches!(result, Err(CacheError::Map(_))));
    }

    #[test]
    fn test_map_is_page_aligned() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size, std::ptr::null_mut()).unwrap();
            assert_eq!(ptr.as_ptr() as usize % PlatformVmOps::page_size(), 0);
            PlatformVmOps::unmap(ptr, size).unwrap();
        }
    }

    #[test]
    fn test_map_hint_is_advisory() {
        // A wild hint must not make the mapping fail.
        let size = PlatformVmOps::page_size();
        let hint = default_address_hint(size);
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::map(size, hint).expect("map with hint failed");
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 1;
            PlatformVmOps::unmap(ptr, size).unwrap();
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_default_hint_alignment_and_span() {
        for _ in 0..64 {
            let hint = default_address_hint(1 << 20) as usize;
            assert_eq!(hint % (64 * 1024), 0, "hint {hint:#x} not 64K aligned");
            assert!(hint >= 1 << 45, "hint {hint:#x} below span base");
            assert!(hint < (1 << 45) + (1 << 44), "hint {hint:#x} above span");
        }
    }

    #[test]
    fn test_default_hints_vary() {
        let a = default_address_hint(1 << 20);
        let b = default_address_hint(1 << 20);
        assert_ne!(a, b);
    }
}
