//! Sentinel framing for tracked buffers.
//!
//! Every tracked allocation is carved out of a slightly larger buffer from
//! the underlying allocator:
//!
//! ```plaintext
//! +--------------------+  <- buffer (8-byte aligned)
//! | GUARD (8 bytes)    |
//! +--------------------+  <- payload, handed to the caller
//! | payload            |  size bytes
//! +--------------------+
//! | PAD_FILL bytes     |  round_up(size, 8) - size bytes
//! +--------------------+  <- payload + round_up(size, 8)
//! | GUARD (8 bytes)    |
//! +--------------------+
//! ```
//!
//! The trailing guard sits on an 8-byte boundary so both guards can be read
//! as aligned `u64`s. The padding between the payload and the trailing guard
//! is poisoned too, which is what catches a one-byte overrun on sizes that
//! are not a multiple of 8.

use std::{
    alloc::{GlobalAlloc, Layout},
    mem,
    ptr::NonNull,
    slice,
};

use crate::{
    error::{Error, Result},
    util::{hint::cold, num::round_up},
};

/// The sentinel written on both sides of every payload.
pub const GUARD: u64 = 0xEC5E_E674_CA4A_4A96;
pub const GUARD_SIZE: usize = mem::size_of::<u64>();
/// Alignment of every framed buffer, and therefore of every payload.
pub const ALIGN: usize = 8;
/// Poison for the bytes between the payload and the trailing guard.
pub const PAD_FILL: u8 = 0xFD;

/// How the payload of a fresh buffer is initialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    Uninit,
    Zeroed,
}

/// A guarded buffer, as handed out by the underlying allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Framed {
    /// Start of the whole buffer (the leading guard).
    pub buffer: NonNull<u8>,
    /// The layout the buffer was obtained with; needed to give it back.
    pub layout: Layout,
}

impl Framed {
    pub fn payload(&self) -> NonNull<u8> {
        payload_of(self.buffer)
    }
}

/// The payload start for a buffer.
pub fn payload_of(buffer: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: every framed buffer is at least `2 * GUARD_SIZE` bytes, so the
    // payload is in bounds (or one past the leading guard), and never null.
    unsafe { NonNull::new_unchecked(buffer.as_ptr().add(GUARD_SIZE)) }
}

/// Rounded payload length: where the trailing guard starts, relative to the
/// payload.
pub fn padded(size: usize) -> Result<usize> {
    round_up(size, ALIGN).ok_or(Error::SizeOverflow { size })
}

/// Layout of the underlying buffer for a `size`-byte payload.
pub fn buffer_layout(size: usize) -> Result<Layout> {
    let total = padded(size)?
        .checked_add(2 * GUARD_SIZE)
        .ok_or(Error::SizeOverflow { size })?;
    Layout::from_size_align(total, ALIGN).map_err(|_| Error::SizeOverflow { size })
}

/// Obtain a guarded buffer for `size` payload bytes from `heap`.
pub fn frame<A>(heap: &A, size: usize, fill: Fill) -> Result<Framed>
where
    A: GlobalAlloc,
{
    let layout = buffer_layout(size)?;
    // SAFETY: `layout` always covers both guards, so it is never zero-sized.
    let data = unsafe {
        match fill {
            Fill::Uninit => heap.alloc(layout),
            Fill::Zeroed => heap.alloc_zeroed(layout),
        }
    };
    let buffer = NonNull::new(data).ok_or_else(|| exhausted(layout))?;
    // SAFETY: `buffer` is a fresh allocation of `buffer_layout(size)`.
    unsafe { write_guards(buffer, size) };
    Ok(Framed { buffer, layout })
}

/// Resize a guarded buffer in place (or by moving it), keeping the payload
/// bytes up to `min(old, new_size)` and rewriting the guards around the new
/// payload end. On failure `framed` is untouched and still owned by the
/// caller.
///
/// # Safety
///
/// - `framed` must have come from [`frame()`] or [`reframe()`] on this same
///   `heap`, and must not have been released.
/// - On success the old `framed` is dangling.
pub unsafe fn reframe<A>(heap: &A, framed: Framed, new_size: usize) -> Result<Framed>
where
    A: GlobalAlloc,
{
    let layout = buffer_layout(new_size)?;
    // SAFETY: caller guarantees `framed` is a live allocation of `heap` with
    // `framed.layout`; `layout.size()` is non-zero and was validated above.
    let data = unsafe { heap.realloc(framed.buffer.as_ptr(), framed.layout, layout.size()) };
    let buffer = NonNull::new(data).ok_or_else(|| exhausted(layout))?;
    // SAFETY: `buffer` is now a live allocation of `layout`.
    unsafe { write_guards(buffer, new_size) };
    Ok(Framed { buffer, layout })
}

/// Hand a guarded buffer back to the underlying allocator.
///
/// # Safety
///
/// Same as [`reframe()`]; `framed` is dangling afterwards.
pub unsafe fn release<A>(heap: &A, framed: Framed)
where
    A: GlobalAlloc,
{
    // SAFETY: requirement passed to caller
    unsafe { heap.dealloc(framed.buffer.as_ptr(), framed.layout) }
}

/// Whether either guard, or the padding between the payload and the trailing
/// guard, has been overwritten.
///
/// # Safety
///
/// `payload` must be the payload of a live buffer framed for exactly `size`
/// bytes.
pub unsafe fn is_violated(payload: NonNull<u8>, size: usize) -> bool {
    // `size` was accepted by `frame()`, so rounding cannot overflow here.
    let padded = round_up(size, ALIGN).unwrap_or(size);
    let payload = payload.as_ptr();
    // SAFETY: the layout documented at the top of this module; the buffer and
    // therefore both guards are 8-byte aligned.
    let (head, tail, pad) = unsafe {
        (
            payload.sub(GUARD_SIZE).cast::<u64>().read(),
            payload.add(padded).cast::<u64>().read(),
            slice::from_raw_parts(payload.add(size), padded - size),
        )
    };
    head != GUARD || tail != GUARD || pad.iter().any(|&b| b != PAD_FILL)
}

/// # Safety
///
/// `buffer` must be valid for writes of `buffer_layout(size).size()` bytes and
/// 8-byte aligned.
unsafe fn write_guards(buffer: NonNull<u8>, size: usize) {
    let padded = round_up(size, ALIGN).unwrap_or(size);
    let start = buffer.as_ptr();
    // SAFETY: requirement passed to caller; offsets are within
    // `padded + 2 * GUARD_SIZE`.
    unsafe {
        let payload = start.add(GUARD_SIZE);
        start.cast::<u64>().write(GUARD);
        payload.add(size).write_bytes(PAD_FILL, padded - size);
        payload.add(padded).cast::<u64>().write(GUARD);
    }
}

fn exhausted(layout: Layout) -> Error {
    cold(|| {
        log::error!("underlying allocator refused {} bytes", layout.size());
        Error::Exhausted {
            bytes: layout.size(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::alloc::System;

    use super::*;

    fn frame_sys(size: usize) -> Framed {
        frame(&System, size, Fill::Uninit).unwrap()
    }

    #[test]
    fn layout_pads_payload_and_adds_two_guards() {
        assert_eq!(buffer_layout(0).unwrap().size(), 16);
        assert_eq!(buffer_layout(1).unwrap().size(), 24);
        assert_eq!(buffer_layout(40).unwrap().size(), 56);
        assert_eq!(buffer_layout(41).unwrap().align(), ALIGN);
        assert!(matches!(
            buffer_layout(usize::MAX - 2),
            Err(Error::SizeOverflow { .. })
        ));
    }

    #[test]
    fn fresh_frame_is_intact_and_aligned() {
        for size in [0, 1, 7, 8, 9, 40, 4000] {
            let framed = frame_sys(size);
            assert_eq!(framed.payload().as_ptr() as usize % ALIGN, 0);
            unsafe {
                assert!(!is_violated(framed.payload(), size), "size {size}");
                release(&System, framed);
            }
        }
    }

    #[test]
    fn zero_sized_payload_has_adjacent_guards() {
        let framed = frame_sys(0);
        let payload = framed.payload().as_ptr();
        unsafe {
            assert_eq!(payload.cast::<u64>().read(), GUARD);
            assert_eq!(payload.sub(GUARD_SIZE).cast::<u64>().read(), GUARD);
            release(&System, framed);
        }
    }

    #[test]
    fn overrun_by_one_byte_is_detected_for_every_size() {
        for size in 0..=24 {
            let framed = frame_sys(size);
            unsafe {
                framed.payload().as_ptr().add(size).write(0);
                assert!(is_violated(framed.payload(), size), "size {size}");
                release(&System, framed);
            }
        }
    }

    #[test]
    fn underrun_is_detected() {
        let framed = frame_sys(16);
        unsafe {
            framed.payload().as_ptr().sub(1).write(0);
            assert!(is_violated(framed.payload(), 16));
            release(&System, framed);
        }
    }

    #[test]
    fn writes_inside_the_payload_are_fine() {
        let framed = frame_sys(13);
        unsafe {
            framed.payload().as_ptr().write_bytes(0xAB, 13);
            assert!(!is_violated(framed.payload(), 13));
            release(&System, framed);
        }
    }

    #[test]
    fn zeroed_frame_has_zero_payload() {
        let framed = frame(&System, 33, Fill::Zeroed).unwrap();
        unsafe {
            let bytes = slice::from_raw_parts(framed.payload().as_ptr(), 33);
            assert!(bytes.iter().all(|&b| b == 0));
            assert!(!is_violated(framed.payload(), 33));
            release(&System, framed);
        }
    }

    #[test]
    fn reframe_keeps_prefix_and_moves_trailing_guard() {
        let framed = frame_sys(10);
        unsafe {
            for i in 0..10 {
                framed.payload().as_ptr().add(i).write(i as u8);
            }
            let grown = reframe(&System, framed, 100).unwrap();
            let bytes = slice::from_raw_parts(grown.payload().as_ptr(), 10);
            assert_eq!(bytes, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
            assert!(!is_violated(grown.payload(), 100));

            let shrunk = reframe(&System, grown, 3).unwrap();
            let bytes = slice::from_raw_parts(shrunk.payload().as_ptr(), 3);
            assert_eq!(bytes, &[0, 1, 2]);
            assert!(!is_violated(shrunk.payload(), 3));
            assert_eq!(shrunk.layout, buffer_layout(3).unwrap());
            release(&System, shrunk);
        }
    }

    struct Refusing;

    unsafe impl GlobalAlloc for Refusing {
        unsafe fn alloc(&self, _: Layout) -> *mut u8 {
            std::ptr::null_mut()
        }

        unsafe fn dealloc(&self, _: *mut u8, _: Layout) {}
    }

    #[test]
    fn exhaustion_surfaces_as_error() {
        assert!(matches!(
            frame(&Refusing, 8, Fill::Uninit),
            Err(Error::Exhausted { bytes: 24 })
        ));
    }
}
