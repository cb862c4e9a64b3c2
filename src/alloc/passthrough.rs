//! The uninstrumented side of [`Heap`]: straight to the underlying allocator.
//!
//! The C-style API frees without a size, while [`GlobalAlloc`] wants the
//! layout back, so every allocation carries a small header:
//!
//! ```plaintext
//! +--------------------+
//! | PassthroughHeader  | HEADER_SIZE bytes
//! +--------------------+  <- pointer handed out
//! | requested size     |
//! +--------------------+
//! ```

use std::{
    alloc::{GlobalAlloc, Layout},
    cmp, mem,
    ptr::NonNull,
};

use dlmalloc::GlobalDlmalloc;

use super::{guard::ALIGN, heap::Heap};
use crate::{
    error::{Error, Result},
    site::Site,
    util::hint::cold,
};

/// Bookkeeping stored in front of every pass-through allocation.
#[repr(C)]
struct PassthroughHeader {
    /// The exact requested size of this allocation
    size: usize,
}

const HEADER_SIZE: usize = {
    let size = mem::size_of::<PassthroughHeader>();
    if size > ALIGN {
        size
    } else {
        ALIGN
    }
};

impl PassthroughHeader {
    /// The layout of the whole allocation for `size` requested bytes.
    fn layout_with_header(size: usize) -> Result<Layout> {
        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(Error::SizeOverflow { size })?;
        Layout::from_size_align(total, cmp::max(ALIGN, mem::align_of::<Self>()))
            .map_err(|_| Error::SizeOverflow { size })
    }
}

/// Allocations without tracking, guards or annotations.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough<A = GlobalDlmalloc> {
    heap: A,
}

impl Passthrough {
    pub const fn new() -> Self {
        Self {
            heap: GlobalDlmalloc,
        }
    }
}

impl<A> Passthrough<A>
where
    A: GlobalAlloc,
{
    pub const fn with_heap(heap: A) -> Self {
        Self { heap }
    }

    fn alloc_with(&self, size: usize, zeroed: bool) -> Result<NonNull<u8>> {
        let layout = PassthroughHeader::layout_with_header(size)?;
        // SAFETY: the header makes `layout` non-zero-sized.
        let data = unsafe {
            if zeroed {
                self.heap.alloc_zeroed(layout)
            } else {
                self.heap.alloc(layout)
            }
        };
        let data = NonNull::new(data).ok_or_else(|| {
            cold(|| Error::Exhausted {
                bytes: layout.size(),
            })
        })?;
        // SAFETY: `data` is a fresh, suitably aligned allocation of at least
        // `HEADER_SIZE` bytes.
        unsafe { Ok(Self::install_header(data, size)) }
    }

    /// # Safety
    ///
    /// `data` must be valid for writes of `HEADER_SIZE` bytes and aligned.
    unsafe fn install_header(data: NonNull<u8>, size: usize) -> NonNull<u8> {
        // SAFETY: requirement passed to caller
        unsafe {
            data.as_ptr()
                .cast::<PassthroughHeader>()
                .write(PassthroughHeader { size });
            NonNull::new_unchecked(data.as_ptr().add(HEADER_SIZE))
        }
    }

    /// The start of the underlying allocation and its layout.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this pass-through heap and still be live.
    unsafe fn locate(ptr: *mut u8) -> (*mut u8, Layout) {
        // SAFETY: requirement passed to caller
        unsafe {
            let base = ptr.sub(HEADER_SIZE);
            let size = base.cast::<PassthroughHeader>().read().size;
            let layout = Layout::from_size_align_unchecked(
                size + HEADER_SIZE,
                cmp::max(ALIGN, mem::align_of::<PassthroughHeader>()),
            );
            (base, layout)
        }
    }
}

impl<A> Heap for Passthrough<A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, size: usize, _: Site) -> Result<NonNull<u8>> {
        self.alloc_with(size, false)
    }

    fn allocate_zeroed(&self, count: usize, size: usize, _: Site) -> Result<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or(Error::ArrayOverflow { count, size })?;
        self.alloc_with(total, true)
    }

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        if ptr.is_null() {
            return self.allocate(new_size, site).map(Some);
        }
        if new_size == 0 {
            // SAFETY: requirement passed to caller
            unsafe { self.release(ptr, site)? };
            return Ok(None);
        }
        let new_layout = PassthroughHeader::layout_with_header(new_size)?;
        // SAFETY: requirement passed to caller
        let (base, layout) = unsafe { Self::locate(ptr) };
        // SAFETY: `base` was allocated by `self.heap` with `layout`.
        let data = unsafe { self.heap.realloc(base, layout, new_layout.size()) };
        let data = NonNull::new(data).ok_or_else(|| {
            cold(|| Error::Exhausted {
                bytes: new_layout.size(),
            })
        })?;
        // SAFETY: `data` now holds `new_layout`.
        unsafe { Ok(Some(Self::install_header(data, new_size))) }
    }

    unsafe fn release(&self, ptr: *mut u8, _: Site) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        // SAFETY: requirement passed to caller
        unsafe {
            let (base, layout) = Self::locate(ptr);
            self.heap.dealloc(base, layout);
        }
        Ok(())
    }
}
