//! Guarded allocation and its bookkeeping.

pub mod annotation;
pub mod guard;
pub mod heap;
pub mod passthrough;
pub mod registry;
pub mod tracking;
