//! Free-form notes attached to an allocation.

use std::{
    fmt::{self, Write},
    str,
};

/// Size of the on-stack scratch buffer used for the first formatting pass.
pub const SCRATCH_LEN: usize = 1000;

/// Ordered list of owned notes. Insertion order is what gets reported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Annotations {
    notes: Vec<Box<str>>,
}

impl Annotations {
    pub const fn new() -> Self {
        Self { notes: Vec::new() }
    }

    /// Format `args` and append the result.
    pub fn append(&mut self, args: fmt::Arguments<'_>) {
        self.notes.push(format_note(args));
    }

    pub fn push(&mut self, note: impl Into<Box<str>>) {
        self.notes.push(note.into());
    }

    /// Append independent copies of every note in `src`, in order, after the
    /// notes already here.
    pub fn copy_from(&mut self, src: &Annotations) {
        self.notes.extend(src.notes.iter().cloned());
    }

    /// Append this list to itself.
    pub fn duplicate(&mut self) {
        self.notes.extend_from_within(..);
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> + '_ {
        self.notes.iter().map(|note| &**note)
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

/// Bounded scratch space that keeps counting once it is full, so a single
/// pass tells us both the text (if it fit) and the exact length needed.
struct Scratch {
    buf: [u8; SCRATCH_LEN],
    len: usize,
    needed: usize,
    overflowed: bool,
}

impl Scratch {
    const fn new() -> Self {
        Self {
            buf: [0; SCRATCH_LEN],
            len: 0,
            needed: 0,
            overflowed: false,
        }
    }

    fn as_str(&self) -> Option<&str> {
        if self.overflowed {
            return None;
        }
        str::from_utf8(&self.buf[..self.len]).ok()
    }
}

impl Write for Scratch {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.needed += s.len();
        // Whole pieces only: never split a UTF-8 sequence.
        if !self.overflowed && self.len + s.len() <= SCRATCH_LEN {
            self.buf[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
        } else {
            self.overflowed = true;
        }
        Ok(())
    }
}

/// Measure-then-format: the first pass goes into a fixed scratch buffer; only
/// text that did not fit is formatted a second time into an exact-size
/// allocation.
pub fn format_note(args: fmt::Arguments<'_>) -> Box<str> {
    if let Some(s) = args.as_str() {
        return s.into();
    }

    let mut scratch = Scratch::new();
    // `Scratch` itself never fails; a `Display` impl that errors just
    // truncates the note.
    let _ = scratch.write_fmt(args);
    if let Some(s) = scratch.as_str() {
        return s.into();
    }

    let mut exact = String::with_capacity(scratch.needed);
    let _ = exact.write_fmt(args);
    exact.into_boxed_str()
}
