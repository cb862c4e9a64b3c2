/// Run `f` on a path the optimizer should treat as unlikely (misuse reports,
/// allocator exhaustion).
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
