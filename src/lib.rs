#[cfg(not(target_pointer_width = "64"))]
compile_error!("slabcache supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod cache;

// allocator surface
pub use cache::allocator::{CacheConfig, CacheKey, SlabCache};
pub use cache::handle::ValueHandle;

// errors
pub use cache::error::CacheError;

// statistics
pub use cache::stats::CacheStats;
