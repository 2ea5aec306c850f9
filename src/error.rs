use std::collections::TryReserveError;
use std::fmt;

use static_assertions::assert_impl_all;

/// Failure to allocate memory for a coroutine's saved stack.
///
/// It is the only recoverable error of this crate. The coroutine involved is left untouched: the
/// old buffer is released only after the new one was acquired.
#[derive(Clone, PartialEq, Eq)]
pub struct AllocError {
    requested: usize,
    source: TryReserveError,
}

assert_impl_all!(AllocError: Send, Sync);

impl AllocError {
    pub(crate) fn new(requested: usize, source: TryReserveError) -> Self {
        AllocError { requested, source }
    }

    /// Number of bytes that failed to be allocated.
    pub fn requested(&self) -> usize {
        self.requested
    }
}

impl fmt::Debug for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocError {{ requested: {} }}", self.requested)
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fail to allocate {} bytes for saved stack", self.requested)
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
