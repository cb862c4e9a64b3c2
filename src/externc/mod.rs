//! C entry points over the process-wide tracker.
//!
//! A C program links the static library and routes its allocation calls
//! here, typically through macros passing `__LINE__` and `__FILE__`. Misuse
//! terminates the process, as it would under [`global`](crate::global).

use std::{
    ffi::{c_char, CStr},
    ptr,
    sync::Mutex,
};

use hashbrown::HashSet;
use libc::{c_uint, c_void, size_t};
use once_cell::sync::Lazy;

use crate::{config, global, site::Site};

/// File names seen through the C API. `__FILE__` strings repeat endlessly, so
/// each distinct name is copied once and kept for the life of the process.
static FILE_NAMES: Lazy<Mutex<HashSet<&'static str>>> = Lazy::new(Default::default);

const UNKNOWN_FILE: &str = "<unknown>";

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
unsafe fn site(line: c_uint, file: *const c_char) -> Site {
    if file.is_null() {
        return Site::new(line, UNKNOWN_FILE);
    }
    // SAFETY: requirement passed to caller
    let name = unsafe { CStr::from_ptr(file) }.to_string_lossy();
    let mut names = FILE_NAMES
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let interned: &'static str =
        names.get_or_insert_with(name.as_ref(), |name| Box::leak(Box::<str>::from(name)));
    Site::new(line, interned)
}

fn out(ptr: Option<ptr::NonNull<u8>>) -> *mut c_void {
    ptr.map_or(ptr::null_mut(), |p| p.as_ptr().cast())
}

/// Install the `env_logger` backend so warnings (shifted frees, leaks at
/// teardown) become visible. Idempotent.
#[no_mangle]
pub extern "C" fn heapguard_init() {
    config::init_logger();
}

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_malloc(size: size_t, line: c_uint, file: *const c_char) -> *mut c_void {
    let site = unsafe { site(line, file) };
    out(Some(global::allocate(size, site)))
}

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_calloc(
    count: size_t,
    size: size_t,
    line: c_uint,
    file: *const c_char,
) -> *mut c_void {
    let site = unsafe { site(line, file) };
    out(Some(global::allocate_zeroed(count, size, site)))
}

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_realloc(
    ptr: *mut c_void,
    size: size_t,
    line: c_uint,
    file: *const c_char,
) -> *mut c_void {
    let site = unsafe { site(line, file) };
    out(global::resize(ptr, size, site))
}

/// # Safety
///
/// `file` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_free(ptr: *mut c_void, line: c_uint, file: *const c_char) {
    let site = unsafe { site(line, file) };
    global::release(ptr, site);
}

/// # Safety
///
/// `s` must be a valid NUL-terminated string; `file` null or one.
#[no_mangle]
pub unsafe extern "C" fn heapguard_strdup(s: *const c_char, line: c_uint, file: *const c_char) -> *mut c_char {
    let site = unsafe { site(line, file) };
    // SAFETY: requirement passed to caller
    let bytes = unsafe { CStr::from_ptr(s) }.to_bytes();
    out(Some(global::duplicate(bytes, site))).cast()
}

/// Copy at most `n` bytes of `s`, always NUL-terminated.
///
/// # Safety
///
/// `s` must be valid for reads up to its terminator or `n` bytes, whichever
/// comes first; `file` null or a valid string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_strndup(
    s: *const c_char,
    n: size_t,
    line: c_uint,
    file: *const c_char,
) -> *mut c_char {
    let site = unsafe { site(line, file) };
    // SAFETY: requirement passed to caller; `strnlen` never reads past `n`.
    let bytes = unsafe {
        let len = libc::strnlen(s, n);
        std::slice::from_raw_parts(s.cast::<u8>(), len)
    };
    out(Some(global::duplicate(bytes, site))).cast()
}

/// Attach `message` as a note on the allocation containing `ptr`.
///
/// # Safety
///
/// `message` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn heapguard_comment(ptr: *const c_void, message: *const c_char) {
    // SAFETY: requirement passed to caller
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    global::annotate(ptr, format_args!("{message}"));
}

#[no_mangle]
pub extern "C" fn heapguard_comment_copy(dest: *const c_void, src: *const c_void) {
    global::annotate_copy(dest, src);
}

#[no_mangle]
pub extern "C" fn heapguard_is_valid(ptr: *const c_void) -> bool {
    global::is_valid(ptr)
}

#[no_mangle]
pub extern "C" fn heapguard_has_been_violated(ptr: *const c_void) -> bool {
    global::has_been_violated(ptr)
}

#[no_mangle]
pub extern "C" fn heapguard_print_allocated() {
    global::print_report();
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[test]
    fn file_names_are_interned_by_content() {
        let a = CString::new("main.c").unwrap();
        let b = CString::new("main.c").unwrap();
        let (sa, sb) = unsafe { (site(1, a.as_ptr()), site(2, b.as_ptr())) };
        assert_eq!(sa.file, "main.c");
        assert!(ptr::eq(sa.file, sb.file));
        assert_eq!(unsafe { site(3, ptr::null()) }.file, UNKNOWN_FILE);
    }

    #[test]
    fn c_surface_round_trip() {
        let file = CString::new("ffi_test.c").unwrap();
        unsafe {
            let p = heapguard_malloc(10, 1, file.as_ptr());
            assert!(heapguard_is_valid(p));
            assert!(!heapguard_has_been_violated(p));

            let note = CString::new("from C").unwrap();
            heapguard_comment(p, note.as_ptr());

            let p = heapguard_realloc(p, 100, 2, file.as_ptr());
            let notes = global::tracker()
                .inspect(p, |r| r.annotations().iter().map(str::to_owned).collect::<Vec<_>>())
                .unwrap();
            assert_eq!(notes, ["from C"]);

            assert!(heapguard_realloc(p, 0, 3, file.as_ptr()).is_null());
            heapguard_free(ptr::null_mut(), 4, file.as_ptr());
        }
    }

    #[test]
    fn string_duplication() {
        let file = CString::new("ffi_test.c").unwrap();
        let text = CString::new("hello world!").unwrap();
        unsafe {
            let full = heapguard_strdup(text.as_ptr(), 1, file.as_ptr());
            let part = heapguard_strndup(text.as_ptr(), 3, 2, file.as_ptr());
            assert_eq!(CStr::from_ptr(full), text.as_c_str());
            assert_eq!(CStr::from_ptr(part).to_bytes(), b"hel");

            let zeros = heapguard_calloc(10, 4, 3, file.as_ptr());
            assert!(std::slice::from_raw_parts(zeros.cast::<u8>(), 40).iter().all(|&b| b == 0));

            for p in [full.cast::<c_void>(), part.cast(), zeros] {
                heapguard_free(p, 4, file.as_ptr());
            }
        }
    }
}
