/// Round up `n` to the nearest multiple of `to`, or `None` if that would
/// overflow. `to` must be non-zero.
pub fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to != 0);
    let blocks = n.checked_add(to - 1)? / to;
    blocks.checked_mul(to)
}
