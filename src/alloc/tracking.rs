//! The instrumented heap.
//!
//! A [`Tracker`] wraps an underlying allocator `A` and keeps a record for
//! every allocation it hands out: size, the site it came from, free-form
//! annotations and a pair of guards around the payload. Every entry point
//! takes the tracker's heap lock for its whole duration, underlying allocator
//! call included. The bookkeeping itself (record storage, annotation text)
//! lives on the ordinary Rust heap and never goes back through a tracker, so
//! nothing here can re-enter the lock.
//!
//! Misuse (operating on a pointer the tracker does not know) is reported as
//! [`Error::Untracked`] rather than acted on. Deciding to stop the process is
//! left to the outermost caller; see [`OrExit`](crate::error::OrExit).
//!
//! Warnings that do not stop anything (a release through a shifted pointer)
//! are written, prefixed, to the tracker's diagnostics stream (stderr unless
//! replaced with [`Tracker::with_diagnostics()`]) and also go to `log`.

use std::{
    alloc::GlobalAlloc,
    fmt,
    io::{self, Write},
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard, PoisonError},
};

use dlmalloc::GlobalDlmalloc;
use serde::{Deserialize, Serialize};

use super::{
    guard::Fill,
    heap::Heap,
    registry::{Record, Registry, Removal},
};
use crate::{
    config::Config,
    error::{Error, Op, Result},
    report::{self, Snapshot},
    serialize::serde_usize::AsUsize,
    site::Site,
};

/// Aggregate counters, always equal to the sum and count over live records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub live_bytes: usize,
    pub blocks: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HeapState {
    pub(crate) registry: Registry,
    pub(crate) live_bytes: usize,
}

impl HeapState {
    pub(crate) fn stats(&self) -> Stats {
        Stats {
            live_bytes: self.live_bytes,
            blocks: self.registry.len(),
        }
    }
}

/// Exclusive access to a tracker's registry and counters for as long as it
/// is held.
pub(crate) struct HeapLock<'a> {
    state: MutexGuard<'a, HeapState>,
}

impl HeapLock<'_> {
    pub(crate) fn state(&mut self) -> &mut HeapState {
        &mut self.state
    }
}

type Diagnostics = Box<dyn Write + Send>;

/// An allocator that tracks, guards and annotates everything it hands out.
pub struct Tracker<A = GlobalDlmalloc>
where
    A: GlobalAlloc,
{
    heap: A,
    state: Mutex<HeapState>,
    config: Config,
    diagnostics: Mutex<Diagnostics>,
}

impl Tracker {
    /// A tracker over `dlmalloc` with the default configuration.
    pub fn new() -> Self {
        Self::with_heap(GlobalDlmalloc, Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_heap(GlobalDlmalloc, config)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Tracker<A>
where
    A: GlobalAlloc,
{
    pub fn with_heap(heap: A, config: Config) -> Self {
        Self {
            heap,
            state: Mutex::new(HeapState::default()),
            config,
            diagnostics: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Send non-fatal warnings to `out` instead of stderr.
    pub fn with_diagnostics<W>(mut self, out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.diagnostics = Mutex::new(Box::new(out));
        self
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!("{args}");
        let mut out = self
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let written = writeln!(out, "{}{args}", self.config.prefix).and_then(|()| out.flush());
        if let Err(err) = written {
            log::error!("could not write diagnostic: {err}");
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying allocator.
    pub const fn heap(&self) -> &A {
        &self.heap
    }

    /// Acquire the heap lock. Every critical section leaves the registry
    /// consistent before anything that could panic, so a poisoned lock is
    /// still safe to use.
    pub(crate) fn acquire_heap_lock(&self) -> HeapLock<'_> {
        HeapLock {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn track(&self, size: usize, site: Site, fill: Fill) -> Result<NonNull<u8>> {
        let mut lock = self.acquire_heap_lock();
        let state = lock.state();
        let payload = state.registry.add(&self.heap, size, site, fill)?.payload();
        state.live_bytes += size;
        log::trace!("alloc {size} bytes at {payload:p} ({site})");
        Ok(payload)
    }

    /// Allocate `size` bytes and start tracking them.
    pub fn allocate(&self, size: usize, site: Site) -> Result<NonNull<u8>> {
        self.track(size, site, Fill::Uninit)
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn allocate_zeroed(&self, count: usize, size: usize, site: Site) -> Result<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or(Error::ArrayOverflow { count, size })?;
        self.track(total, site, Fill::Zeroed)
    }

    /// Copy `bytes` into a fresh allocation followed by a NUL terminator.
    pub fn duplicate(&self, bytes: &[u8], site: Site) -> Result<NonNull<u8>> {
        let size = bytes
            .len()
            .checked_add(1)
            .ok_or(Error::SizeOverflow { size: bytes.len() })?;
        let mut lock = self.acquire_heap_lock();
        let state = lock.state();
        let payload = state
            .registry
            .add(&self.heap, size, site, Fill::Uninit)?
            .payload();
        // SAFETY: `payload` was just framed for `bytes.len() + 1` bytes and
        // cannot overlap `bytes`, which the caller is still borrowing.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), payload.as_ptr(), bytes.len());
            payload.as_ptr().add(bytes.len()).write(0);
        }
        state.live_bytes += size;
        log::trace!("dup {size} bytes at {payload:p} ({site})");
        Ok(payload)
    }

    /// Resize the allocation containing `ptr`.
    ///
    /// A null `ptr` is a plain [`allocate()`](Self::allocate) (and the record
    /// is tagged as such); a zero `new_size` is a
    /// [`release()`](Self::release) and returns `None`. Annotations survive.
    pub fn resize(&self, ptr: impl AsUsize, new_size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        let addr = ptr.as_usize();
        if addr == 0 {
            return self.allocate(new_size, site).map(Some);
        }
        if new_size == 0 {
            self.release(addr, site)?;
            return Ok(None);
        }

        let mut lock = self.acquire_heap_lock();
        let state = lock.state();
        let record = state
            .registry
            .find_mut(addr)
            .ok_or_else(|| Error::untracked(Op::Resize, addr, Some(site)))?;
        let old_size = record.size();
        record.resize(&self.heap, new_size, site)?;
        let payload = record.payload();
        state.live_bytes = state.live_bytes - old_size + new_size;
        log::trace!("realloc {old_size} -> {new_size} bytes at {payload:p} ({site})");
        Ok(Some(payload))
    }

    /// Stop tracking the allocation containing `ptr` and free it. Null is a
    /// no-op and returns `None`.
    ///
    /// A pointer inside an allocation but not at its start still releases
    /// that allocation; this is logged as a warning and visible through
    /// [`Removal::is_shifted()`].
    pub fn release(&self, ptr: impl AsUsize, site: Site) -> Result<Option<Removal>> {
        let addr = ptr.as_usize();
        if addr == 0 {
            return Ok(None);
        }

        let removal = {
            let mut lock = self.acquire_heap_lock();
            let state = lock.state();
            let removal = state
                .registry
                .remove(&self.heap, addr)
                .ok_or_else(|| Error::untracked(Op::Release, addr, Some(site)))?;
            state.live_bytes -= removal.size;
            removal
        };

        if removal.is_shifted() {
            self.warn(format_args!(
                "releasing allocation at {:p} in {site} using shifted pointer {:#x}",
                removal.payload, addr
            ));
        } else {
            log::trace!("free {} bytes at {:p} ({site})", removal.size, removal.payload);
        }
        Ok(Some(removal))
    }

    /// Attach a note to the allocation containing `ptr`.
    ///
    /// Use the [`annotate!`](crate::annotate) macro for `format!`-style
    /// arguments.
    pub fn annotate(&self, ptr: impl AsUsize, args: fmt::Arguments<'_>) -> Result<()> {
        let addr = ptr.as_usize();
        let mut lock = self.acquire_heap_lock();
        let record = lock
            .state()
            .registry
            .find_mut(addr)
            .ok_or_else(|| Error::untracked(Op::Annotate, addr, None))?;
        record.annotations_mut().append(args);
        Ok(())
    }

    /// Append copies of every note on `src`'s allocation to `dest`'s.
    pub fn annotate_copy(&self, dest: impl AsUsize, src: impl AsUsize) -> Result<()> {
        let (dest, src) = (dest.as_usize(), src.as_usize());
        let mut lock = self.acquire_heap_lock();
        let registry = &mut lock.state().registry;
        let dest_index = registry
            .position(dest)
            .ok_or_else(|| Error::untracked(Op::AnnotateCopy, dest, None))?;
        let src_index = registry
            .position(src)
            .ok_or_else(|| Error::untracked(Op::AnnotateCopy, src, None))?;
        registry.copy_annotations(dest_index, src_index);
        Ok(())
    }

    /// Whether `ptr` lies within (or one past the end of) a live allocation.
    /// Never an error.
    pub fn is_valid(&self, ptr: impl AsUsize) -> bool {
        self.acquire_heap_lock()
            .state()
            .registry
            .position(ptr)
            .is_some()
    }

    /// Whether the guards around the allocation containing `ptr` have been
    /// overwritten.
    pub fn has_been_violated(&self, ptr: impl AsUsize) -> Result<bool> {
        let addr = ptr.as_usize();
        let mut lock = self.acquire_heap_lock();
        let record = lock
            .state()
            .registry
            .find(addr)
            .ok_or_else(|| Error::untracked(Op::ViolationCheck, addr, None))?;
        Ok(record.is_violated())
    }

    /// Run `f` on the record containing `ptr`, under the heap lock. `f` must
    /// not call back into this tracker.
    pub fn inspect<F, R>(&self, ptr: impl AsUsize, f: F) -> Option<R>
    where
        F: FnOnce(&Record) -> R,
    {
        let mut lock = self.acquire_heap_lock();
        lock.state().registry.find(ptr).map(f)
    }

    pub fn stats(&self) -> Stats {
        self.acquire_heap_lock().state().stats()
    }

    /// Write the human-readable report of every live allocation to `out`.
    /// `out` is not assumed to be a terminal, so [`ColorChoice::Auto`]
    /// means plain text here.
    ///
    /// [`ColorChoice::Auto`]: crate::config::ColorChoice::Auto
    pub fn report<W>(&self, out: &mut W) -> io::Result<()>
    where
        W: Write,
    {
        self.write_report(out, self.config.color_for(false))
    }

    fn write_report<W>(&self, out: &mut W, color: bool) -> io::Result<()>
    where
        W: Write,
    {
        let mut lock = self.acquire_heap_lock();
        report::write_report(out, lock.state(), &self.config, color)
    }

    /// [`report()`](Self::report) to stdout, highlighted when stdout is a
    /// terminal.
    pub fn print_report(&self) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let color = self.config.color_for_stdout();
        if let Err(err) = self.write_report(&mut out, color).and_then(|()| out.flush()) {
            log::error!("could not write allocation report: {err}");
        }
    }

    /// A serializable copy of the current report.
    pub fn snapshot(&self) -> Snapshot {
        let mut lock = self.acquire_heap_lock();
        Snapshot::capture(lock.state())
    }

    /// Free everything still tracked. Returns the number of allocations that
    /// were still live.
    pub fn release_all(&self) -> usize {
        let mut lock = self.acquire_heap_lock();
        let state = lock.state();
        let leaked = state.registry.clear(&self.heap);
        if leaked > 0 {
            log::warn!(
                "released {leaked} allocations ({} bytes) still live at teardown",
                state.live_bytes
            );
        }
        state.live_bytes = 0;
        leaked
    }
}

impl<A> Drop for Tracker<A>
where
    A: GlobalAlloc,
{
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<A> Heap for Tracker<A>
where
    A: GlobalAlloc,
{
    fn allocate(&self, size: usize, site: Site) -> Result<NonNull<u8>> {
        Tracker::allocate(self, size, site)
    }

    fn allocate_zeroed(&self, count: usize, size: usize, site: Site) -> Result<NonNull<u8>> {
        Tracker::allocate_zeroed(self, count, size, site)
    }

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        Tracker::resize(self, ptr, new_size, site)
    }

    unsafe fn release(&self, ptr: *mut u8, site: Site) -> Result<()> {
        Tracker::release(self, ptr, site).map(drop)
    }
}

/// Attach a `format!`-style note to a tracked allocation.
///
/// ```
/// # use heapguard::{annotate, site, Tracker};
/// let tracker = Tracker::new();
/// let p = tracker.allocate(16, site!()).unwrap();
/// annotate!(tracker, p, "scratch space for {} items", 4).unwrap();
/// # tracker.release(p, site!()).unwrap();
/// ```
#[macro_export]
macro_rules! annotate {
    ($tracker:expr, $ptr:expr, $($arg:tt)*) => {
        $tracker.annotate($ptr, ::core::format_args!($($arg)*))
    };
}
