//! A single process-wide tracker, for programs that want one heap to
//! instrument rather than passing a [`Tracker`] around.
//!
//! The tracker is created on first use, configured from the environment (see
//! [`config`](crate::config)). Every function here applies the fatal policy:
//! misuse prints the diagnostic and terminates the process. Use the
//! [`tracker()`] itself for the non-fatal [`Result`](crate::error::Result)
//! API.
//!
//! [`teardown()`] frees whatever is still live; call it at the very end of
//! the program, after the final report.

use std::{fmt, ptr::NonNull};

use once_cell::sync::Lazy;

use crate::{
    alloc::registry::Removal,
    config::Config,
    error::OrExit,
    serialize::serde_usize::AsUsize,
    site::Site,
    Tracker,
};

static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

static HEAP: Lazy<Tracker> = Lazy::new(|| Tracker::with_config(config().clone()));

/// The configuration the process-wide tracker (and the fatal path) uses.
pub fn config() -> &'static Config {
    &CONFIG
}

pub fn tracker() -> &'static Tracker {
    &HEAP
}

pub fn allocate(size: usize, site: Site) -> NonNull<u8> {
    HEAP.allocate(size, site).or_exit()
}

pub fn allocate_zeroed(count: usize, size: usize, site: Site) -> NonNull<u8> {
    HEAP.allocate_zeroed(count, size, site).or_exit()
}

pub fn duplicate(bytes: &[u8], site: Site) -> NonNull<u8> {
    HEAP.duplicate(bytes, site).or_exit()
}

pub fn resize(ptr: impl AsUsize, new_size: usize, site: Site) -> Option<NonNull<u8>> {
    HEAP.resize(ptr, new_size, site).or_exit()
}

pub fn release(ptr: impl AsUsize, site: Site) -> Option<Removal> {
    HEAP.release(ptr, site).or_exit()
}

pub fn annotate(ptr: impl AsUsize, args: fmt::Arguments<'_>) {
    HEAP.annotate(ptr, args).or_exit()
}

pub fn annotate_copy(dest: impl AsUsize, src: impl AsUsize) {
    HEAP.annotate_copy(dest, src).or_exit()
}

pub fn is_valid(ptr: impl AsUsize) -> bool {
    HEAP.is_valid(ptr)
}

pub fn has_been_violated(ptr: impl AsUsize) -> bool {
    HEAP.has_been_violated(ptr).or_exit()
}

pub fn print_report() {
    HEAP.print_report()
}

/// Free everything still tracked; returns how many allocations were leaked.
pub fn teardown() -> usize {
    HEAP.release_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site;

    #[test]
    fn round_trip_through_the_process_wide_heap() {
        let p = allocate(24, site!());
        annotate(p, format_args!("global {}", 24));
        assert!(is_valid(p));
        assert!(!has_been_violated(p));

        let q = resize(p, 48, site!()).unwrap();
        let notes = tracker()
            .inspect(q, |record| record.annotations().len())
            .unwrap();
        assert_eq!(notes, 1);

        let removal = release(q, site!()).unwrap();
        assert_eq!(removal.size, 48);
        assert!(!removal.is_shifted());
    }
}
