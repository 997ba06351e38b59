//! Process-wide default for the in-memory transport buffer size.
//!
//! The value is read once when a [`TestServer`](crate::TestServer) is built and
//! copied into its listener. Changing it never affects servers that already
//! exist, and nothing resets it automatically between tests.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default capacity of each in-memory pipe, in bytes (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

static BUFFER_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_BUFFER_SIZE);

/// Set the default buffer size used by servers constructed after this call.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn set_buffer_size(size: usize) {
    assert!(size > 0, "grpctest: buffer size must be positive");
    BUFFER_SIZE.store(size, Ordering::SeqCst);
}

/// Current default buffer size.
pub fn buffer_size() -> usize {
    BUFFER_SIZE.load(Ordering::SeqCst)
}

/// Restore [`DEFAULT_BUFFER_SIZE`].
pub fn reset_buffer_size() {
    BUFFER_SIZE.store(DEFAULT_BUFFER_SIZE, Ordering::SeqCst);
}

/// Override the default buffer size until the returned guard is dropped.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn override_buffer_size(size: usize) -> BufferSizeGuard {
    assert!(size > 0, "grpctest: buffer size must be positive");
    let previous = BUFFER_SIZE.swap(size, Ordering::SeqCst);
    BufferSizeGuard { previous }
}

/// Restores the previous default buffer size on drop.
#[must_use = "the override is reverted as soon as the guard is dropped"]
#[derive(Debug)]
pub struct BufferSizeGuard {
    previous: usize,
}

impl BufferSizeGuard {
    /// The value that will be restored.
    pub fn previous(&self) -> usize {
        self.previous
    }
}

impl Drop for BufferSizeGuard {
    fn drop(&mut self) {
        BUFFER_SIZE.store(self.previous, Ordering::SeqCst);
    }
}
