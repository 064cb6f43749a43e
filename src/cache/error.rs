use std::error::Error;
use std::fmt;
use std::io;

/// Errors surfaced by the cache.
///
/// `Map` failures leave the cache fully consistent: the failed chunk is never
/// registered and no accounting changes. `Unmap` failures can only occur while
/// shrinking or tearing down and are reported without rolling back state.
#[derive(Debug)]
pub enum CacheError {
    /// Invalid construction parameters.
    BadArguments(String),
    /// `mmap` failed.
    Map(io::Error),
    /// `munmap` failed.
    Unmap(io::Error),
    /// A user-supplied `size_fn`/`init_fn` callback failed.
    Callback(Box<dyn Error + Send + Sync>),
}

impl CacheError {
    /// Wrap an arbitrary error produced by a user callback.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        CacheError::Callback(err.into())
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::BadArguments(msg) => write!(f, "bad arguments: {msg}"),
            CacheError::Map(e) => write!(f, "cannot allocate memory: {e}"),
            CacheError::Unmap(e) => write!(f, "cannot unmap: {e}"),
            CacheError::Callback(e) => write!(f, "callback failed: {e}"),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::Map(e) | CacheError::Unmap(e) => Some(e),
            CacheError::Callback(e) => Some(e.as_ref()),
            CacheError::BadArguments(_) => None,
        }
    }
}
