//! Heap instrumentation for finding leaks and buffer overruns.
//!
//! A [`Tracker`] hands out memory bracketed by guard words, remembers where
//! every allocation came from and lets callers pin free-form notes on it. At
//! any point the live set can be printed ([`Tracker::report()`]) or captured
//! as data ([`Tracker::snapshot()`]), with every overwritten guard flagged.
//!
//! ```
//! use heapguard::{annotate, site, Tracker};
//!
//! let tracker = Tracker::new();
//! let p = tracker.allocate(40, site!()).unwrap();
//! annotate!(tracker, p, "row buffer").unwrap();
//! assert!(!tracker.has_been_violated(p).unwrap());
//! tracker.release(p, site!()).unwrap();
//! ```
//!
//! Programs that want a single instrumented heap use [`global`]; C programs
//! link the static library and call the functions in [`externc`].

pub mod alloc;
pub mod config;
pub mod error;
pub mod externc;
pub mod global;
pub mod report;
pub mod serialize;
pub mod site;
pub mod util;

pub use alloc::{
    heap::Heap,
    passthrough::Passthrough,
    registry::{AllocKind, Record, Removal},
    tracking::{Stats, Tracker},
};
pub use config::{init_logger, Config};
pub use error::{Error, OrExit, Result};
pub use report::Snapshot;
pub use serialize::serde_usize::AsUsize;
pub use site::Site;
