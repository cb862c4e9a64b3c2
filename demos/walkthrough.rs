//! Exercise the process-wide heap the way an instrumented program would:
//! annotate, overrun, resize, report, then clean up.
//!
//! Run with `RUST_LOG=trace` to see every call.

use std::slice;

use heapguard::{global, site};

fn main() {
    heapguard::init_logger();

    let rows = global::allocate(4000, site!());
    global::annotate(rows, format_args!("row buffer for {} rows", 100));
    global::annotate(rows, format_args!("owned by the parser"));
    println!("rows violated: {}", global::has_been_violated(rows));

    let header = global::allocate(100, site!());
    global::annotate_copy(header, rows);

    let small = global::allocate(40, site!());
    // One byte past the end lands in the tail guard.
    unsafe { small.as_ptr().add(40).write(b'!') };
    println!("small violated: {}", global::has_been_violated(small));

    let header = global::resize(header, 50, site!()).unwrap_or(header);

    let zeros = global::allocate_zeroed(8, 4, site!());
    let all_zero = unsafe { slice::from_raw_parts(zeros.as_ptr(), 32) }
        .iter()
        .all(|&b| b == 0);
    println!("zeroed: {all_zero}");

    let name = global::duplicate(b"walkthrough", site!());

    global::print_report();

    if let Err(err) = global::tracker().snapshot().write_to_file("walkthrough.json") {
        eprintln!("could not save snapshot: {err}");
    }

    for p in [rows, header, small, zeros, name] {
        global::release(p, site!());
    }
    global::print_report();
    global::teardown();
}
