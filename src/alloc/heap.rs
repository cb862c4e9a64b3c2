use std::ptr::NonNull;

use crate::{error::Result, site::Site};

/// The C-style allocation surface application code is written against.
///
/// Two implementations exist: [`Passthrough`](super::passthrough::Passthrough)
/// does no bookkeeping, [`Tracker`](super::tracking::Tracker) instruments every
/// call. Code generic over `Heap` picks one at composition time.
pub trait Heap {
    fn allocate(&self, size: usize, site: Site) -> Result<NonNull<u8>>;

    /// `count * size` zeroed bytes.
    fn allocate_zeroed(&self, count: usize, size: usize, site: Site) -> Result<NonNull<u8>>;

    /// Resize `ptr` to `new_size` bytes. A null `ptr` allocates; a zero
    /// `new_size` releases and returns `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from this heap. Implementations that can
    /// check this (the tracker) report misuse instead of relying on it.
    unsafe fn resize(&self, ptr: *mut u8, new_size: usize, site: Site) -> Result<Option<NonNull<u8>>>;

    /// Give `ptr` back. Null is a no-op.
    ///
    /// # Safety
    ///
    /// As for [`Heap::resize()`].
    unsafe fn release(&self, ptr: *mut u8, site: Site) -> Result<()>;
}
