//! Rendering the live allocation set.
//!
//! The text form is stable and meant to be grepped:
//!
//! ```plaintext
//! heapguard: allocated 4140 bytes in 2 blocks
//! heapguard: alloc:4000 bytes allocated at 0x5555dead0008 in file main.rs at line 10
//! 	(a comment)
//! heapguard: realloc:140 bytes allocated at 0x5555dead1008 in file main.rs at line 12
//! 	 ! MEMORY HAS BEEN VIOLATED !
//! ```

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        registry::{AllocKind, Record},
        tracking::{HeapState, Stats},
    },
    config::Config,
    error::Result,
    serialize::serde_usize,
};

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Write the summary line and one entry per live record, in registry order.
/// `color` turns on ANSI highlighting of violations.
pub(crate) fn write_report<W>(
    out: &mut W,
    state: &HeapState,
    config: &Config,
    color: bool,
) -> io::Result<()>
where
    W: Write,
{
    let stats = state.stats();
    writeln!(
        out,
        "{}allocated {} bytes in {} blocks",
        config.prefix, stats.live_bytes, stats.blocks
    )?;
    let mut result = Ok(());
    state.registry.for_each(|record| {
        if result.is_ok() {
            result = write_record(out, record, &config.prefix, color);
        }
    });
    result
}

fn write_record<W>(out: &mut W, record: &Record, prefix: &str, color: bool) -> io::Result<()>
where
    W: Write,
{
    let site = record.site();
    writeln!(
        out,
        "{prefix}{}:{} bytes allocated at {:p} in file {} at line {}",
        record.kind(),
        record.size(),
        record.payload(),
        site.file,
        site.line
    )?;
    if record.is_violated() {
        let (on, off) = if color { (RED, RESET) } else { ("", "") };
        writeln!(out, "\t {on}! MEMORY HAS BEEN VIOLATED !{off}")?;
    }
    for note in record.annotations().iter() {
        writeln!(out, "\t({note})")?;
    }
    Ok(())
}

/// One record, as captured in a [`Snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub kind: AllocKind,
    pub size: usize,
    #[serde(with = "serde_usize")]
    pub address: usize,
    pub file: String,
    pub line: u32,
    pub violated: bool,
    pub annotations: Vec<String>,
}

impl RecordSnapshot {
    fn capture(record: &Record) -> Self {
        let site = record.site();
        Self {
            kind: record.kind(),
            size: record.size(),
            address: record.payload().as_ptr() as usize,
            file: site.file.to_owned(),
            line: site.line,
            violated: record.is_violated(),
            annotations: record.annotations().iter().map(str::to_owned).collect(),
        }
    }
}

/// The report as data: counters plus every live record in registry order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stats: Stats,
    pub records: Vec<RecordSnapshot>,
}

impl Snapshot {
    pub(crate) fn capture(state: &HeapState) -> Self {
        let mut records = Vec::with_capacity(state.registry.len());
        state
            .registry
            .for_each(|record| records.push(RecordSnapshot::capture(record)));
        Self {
            stats: state.stats(),
            records,
        }
    }

    /// Records whose guards have been overwritten.
    pub fn violations(&self) -> impl Iterator<Item = &RecordSnapshot> + '_ {
        self.records.iter().filter(|record| record.violated)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to_file<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()?;
        Ok(())
    }

    pub fn from_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(file)?)
    }
}

#[cfg(test)]
mod tests {
    use std::{alloc::System, env, process};

    use crate::{annotate, config::ColorChoice, site::Site, Tracker};

    use super::*;

    const HERE: Site = Site::new(9, "report.rs");

    fn render(tracker: &Tracker<System>) -> String {
        let mut out = Vec::new();
        tracker.report(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn empty_report_is_just_the_summary() {
        let tracker = Tracker::with_heap(System, Config::plain());
        assert_eq!(render(&tracker), "heapguard: allocated 0 bytes in 0 blocks\n");
        assert_eq!(tracker.snapshot(), Snapshot::default());
    }

    #[test]
    fn records_render_with_violation_and_notes() {
        let tracker = Tracker::with_heap(System, Config::plain());
        let p = tracker.allocate(40, HERE).unwrap();
        annotate!(tracker, p, "first").unwrap();
        annotate!(tracker, p, "second").unwrap();
        unsafe { p.as_ptr().add(40).write(1) };

        let expected = format!(
            "heapguard: allocated 40 bytes in 1 blocks\n\
             heapguard: alloc:40 bytes allocated at {:p} in file report.rs at line 9\n\
             \t ! MEMORY HAS BEEN VIOLATED !\n\
             \t(first)\n\
             \t(second)\n",
            p
        );
        assert_eq!(render(&tracker), expected);
    }

    #[test]
    fn color_highlights_the_violation_only() {
        let config = Config {
            color: ColorChoice::Always,
            prefix: "mem: ".into(),
            ..Config::default()
        };
        let tracker = Tracker::with_heap(System, config);
        let p = tracker.allocate(1, HERE).unwrap();
        let clean = render(&tracker);
        assert!(!clean.contains(RED));
        assert!(clean.starts_with("mem: allocated 1 bytes in 1 blocks\n"));

        unsafe { p.as_ptr().sub(1).write(0) };
        assert!(render(&tracker).contains(&format!("\t {RED}! MEMORY HAS BEEN VIOLATED !{RESET}\n")));
    }

    #[test]
    fn auto_color_stays_plain_for_arbitrary_writers() {
        let config = Config {
            color: ColorChoice::Auto,
            ..Config::default()
        };
        let tracker = Tracker::with_heap(System, config);
        let p = tracker.allocate(3, HERE).unwrap();
        unsafe { p.as_ptr().add(3).write(0) };
        let text = render(&tracker);
        assert!(text.contains("\t ! MEMORY HAS BEEN VIOLATED !\n"));
        assert!(!text.contains('\x1b'));
    }

    #[test]
    fn snapshot_matches_registry_and_survives_a_file() {
        let tracker = Tracker::with_heap(System, Config::plain());
        let a = tracker.allocate(8, HERE).unwrap();
        let b = tracker.allocate(3, HERE).unwrap();
        annotate!(tracker, b, "tail").unwrap();
        let b = tracker.resize(b, 5, HERE).unwrap().unwrap();
        unsafe { b.as_ptr().add(5).write(0) };

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.stats, Stats { live_bytes: 13, blocks: 2 });
        assert_eq!(snapshot.records[0].address, a.as_ptr() as usize);
        assert_eq!(snapshot.records[0].kind, AllocKind::Alloc);
        assert_eq!(snapshot.records[1].kind, AllocKind::Realloc);
        assert_eq!(snapshot.records[1].annotations, ["tail"]);
        assert_eq!(snapshot.violations().count(), 1);

        let path = env::temp_dir().join(format!("heapguard-snapshot-{}.json", process::id()));
        snapshot.write_to_file(&path).unwrap();
        let back = Snapshot::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, snapshot);
        assert!(snapshot.to_json().unwrap().contains("\"kind\": \"realloc\""));
    }
}
