//! Print the violations recorded in a snapshot saved by `walkthrough`.

use std::env;

use heapguard::{OrExit, Snapshot};

fn main() {
    heapguard::init_logger();

    let path = env::args().nth(1).unwrap_or_else(|| "walkthrough.json".to_owned());
    let snapshot = Snapshot::from_file(&path).or_exit();
    println!(
        "{path}: {} bytes in {} blocks",
        snapshot.stats.live_bytes, snapshot.stats.blocks
    );
    for record in snapshot.violations() {
        println!(
            "{}:{} bytes at {:#x} in file {} at line {}",
            record.kind, record.size, record.address, record.file, record.line
        );
        for note in &record.annotations {
            println!("\t({note})");
        }
    }
}
