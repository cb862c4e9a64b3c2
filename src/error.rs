use std::{fmt, io, process};

use thiserror::Error;

use crate::{site::Site, util::hint::cold};

pub type Result<T> = std::result::Result<T, Error>;

/// The entry point that tripped over an untracked pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Release,
    Resize,
    Annotate,
    AnnotateCopy,
    ViolationCheck,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Release => "release",
            Op::Resize => "resize",
            Op::Annotate => "annotate",
            Op::AnnotateCopy => "copy annotations for",
            Op::ViolationCheck => "violation check",
        })
    }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The pointer does not resolve to any live allocation. Always a defect in
    /// the caller.
    #[error("tried to {op} pointer at {ptr:#x}{} but pointer was invalid", at_site(.site))]
    Untracked {
        op: Op,
        ptr: usize,
        site: Option<Site>,
    },

    #[error("underlying allocator could not provide {bytes} bytes")]
    Exhausted { bytes: usize },

    #[error("allocation of {size} bytes cannot be represented")]
    SizeOverflow { size: usize },

    #[error("allocation of {count} elements of {size} bytes cannot be represented")]
    ArrayOverflow { count: usize, size: usize },

    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn untracked(op: Op, ptr: usize, site: Option<Site>) -> Self {
        cold(|| Error::Untracked { op, ptr, site })
    }

    /// True for conditions caused by the caller rather than the allocator.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::Untracked { .. })
    }
}

fn at_site(site: &Option<Site>) -> String {
    match site {
        Some(site) => format!(" in {site}"),
        None => String::new(),
    }
}

/// Terminate the process on any error. This is the policy the process-wide
/// entry points and the C ABI apply: after misuse nothing the program does can
/// be trusted, so stop at the point of detection.
pub trait OrExit<T> {
    fn or_exit(self) -> T;
}

impl<T> OrExit<T> for Result<T> {
    fn or_exit(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => cold(|| fatal(&err)),
        }
    }
}

pub(crate) fn fatal(err: &Error) -> ! {
    let config = crate::global::config();
    log::error!("{err}");
    eprintln!("{}{err}", config.prefix);
    process::exit(config.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_message_names_site_when_known() {
        let err = Error::untracked(Op::Release, 0x10, Some(Site::new(7, "main.c")));
        assert_eq!(
            err.to_string(),
            "tried to release pointer at 0x10 in file main.c at line 7 but pointer was invalid"
        );
        assert!(err.is_misuse());
    }

    #[test]
    fn untracked_message_without_site() {
        let err = Error::untracked(Op::Annotate, 0x20, None);
        assert_eq!(
            err.to_string(),
            "tried to annotate pointer at 0x20 but pointer was invalid"
        );
    }

    #[test]
    fn array_overflow_names_the_whole_request() {
        let err = Error::ArrayOverflow { count: usize::MAX / 2, size: 8 };
        assert_eq!(
            err.to_string(),
            format!("allocation of {} elements of 8 bytes cannot be represented", usize::MAX / 2)
        );
        assert!(!err.is_misuse());
    }

    #[test]
    fn exhaustion_is_not_misuse() {
        assert!(!Error::Exhausted { bytes: 16 }.is_misuse());
    }
}
