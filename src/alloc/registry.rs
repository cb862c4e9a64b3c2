//! The set of live allocations.
//!
//! Lookups are a linear scan over address ranges. That is fine for a
//! debugging tool; an address-ordered index could replace it without
//! changing what callers observe.

use std::{alloc::GlobalAlloc, cmp::Ordering, fmt, ptr::NonNull};

use serde::{Deserialize, Serialize};

use super::{
    annotation::Annotations,
    guard::{self, Fill, Framed},
};
use crate::{error::Result, serialize::serde_usize::AsUsize, site::Site};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocKind {
    /// Created by an allocate call (including resize from null).
    Alloc,
    /// Last touched by a resize.
    Realloc,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AllocKind::Alloc => "alloc",
            AllocKind::Realloc => "realloc",
        })
    }
}

/// Metadata for one live allocation. The record owns the guarded buffer, the
/// caller owns the payload bytes.
#[derive(Debug)]
pub struct Record {
    framed: Framed,
    size: usize,
    site: Site,
    kind: AllocKind,
    annotations: Annotations,
}

// SAFETY: the buffer behind `framed` is owned exclusively by this record and
// only touched through the registry, which the tracker keeps behind its lock.
unsafe impl Send for Record {}

impl Record {
    fn new(framed: Framed, size: usize, site: Site) -> Self {
        Self {
            framed,
            size,
            site,
            kind: AllocKind::Alloc,
            annotations: Annotations::new(),
        }
    }

    pub fn payload(&self) -> NonNull<u8> {
        self.framed.payload()
    }

    /// Caller-requested size, without padding or guards.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    /// Where `addr` lies relative to this allocation. The upper bound is
    /// inclusive: the one-past-the-end address still belongs to the record,
    /// so pointer arithmetic that lands there resolves.
    pub fn locate(&self, addr: usize) -> Ordering {
        let start = self.payload().as_usize();
        if addr < start {
            Ordering::Less
        } else if addr - start > self.size {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.locate(addr) == Ordering::Equal
    }

    pub fn is_violated(&self) -> bool {
        // SAFETY: a record only exists while its buffer is live and framed for
        // `self.size` bytes.
        unsafe { guard::is_violated(self.payload(), self.size) }
    }

    /// Move the payload to a buffer framed for `new_size` bytes and retag the
    /// record. Annotations are untouched. On error the record is unchanged.
    pub(crate) fn resize<A>(&mut self, heap: &A, new_size: usize, site: Site) -> Result<()>
    where
        A: GlobalAlloc,
    {
        // SAFETY: `self.framed` is live and came from `heap`; on success the old
        // handle is replaced immediately.
        self.framed = unsafe { guard::reframe(heap, self.framed, new_size)? };
        self.size = new_size;
        self.kind = AllocKind::Realloc;
        self.site = site;
        Ok(())
    }

    /// # Safety
    ///
    /// `heap` must be the allocator the record's buffer came from.
    unsafe fn release<A>(self, heap: &A)
    where
        A: GlobalAlloc,
    {
        // SAFETY: requirement passed to caller; `self` is consumed, so the
        // buffer cannot be reached again.
        unsafe { guard::release(heap, self.framed) }
    }
}

/// What [`Registry::remove()`] found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Removal {
    /// Start of the payload that was released (dangling now).
    pub payload: *const u8,
    pub size: usize,
    /// Whether the pointer given was the payload start itself.
    pub exact: bool,
    /// The site the record was last allocated or resized at.
    pub site: Site,
}

impl Removal {
    pub fn is_shifted(&self) -> bool {
        !self.exact
    }
}

/// Live records in insertion order. Storage only exists while there is at
/// least one record.
#[derive(Debug, Default)]
pub struct Registry {
    records: Option<Vec<Record>>,
}

impl Registry {
    pub const fn new() -> Self {
        Self { records: None }
    }

    pub fn len(&self) -> usize {
        self.records.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_none()
    }

    /// Frame a fresh `size`-byte buffer on `heap` and track it.
    pub fn add<A>(&mut self, heap: &A, size: usize, site: Site, fill: Fill) -> Result<&mut Record>
    where
        A: GlobalAlloc,
    {
        let framed = guard::frame(heap, size, fill)?;
        let records = self.records.get_or_insert_with(Vec::new);
        let index = records.len();
        records.push(Record::new(framed, size, site));
        Ok(&mut records[index])
    }

    /// Index of the record containing `ptr`.
    pub fn position(&self, ptr: impl AsUsize) -> Option<usize> {
        let addr = ptr.as_usize();
        self.records.as_ref()?.iter().position(|record| record.contains(addr))
    }

    pub fn find(&self, ptr: impl AsUsize) -> Option<&Record> {
        let index = self.position(ptr)?;
        self.get(index)
    }

    pub fn find_mut(&mut self, ptr: impl AsUsize) -> Option<&mut Record> {
        let index = self.position(ptr)?;
        self.records.as_mut()?.get_mut(index)
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.as_ref()?.get(index)
    }

    /// Append copies of the notes on record `src` to record `dest`. Both may
    /// be the same record.
    pub fn copy_annotations(&mut self, dest: usize, src: usize) {
        let Some(records) = self.records.as_mut() else {
            return;
        };
        if dest >= records.len() || src >= records.len() {
            return;
        }
        match dest.cmp(&src) {
            Ordering::Equal => records[dest].annotations.duplicate(),
            Ordering::Less => {
                let (low, high) = records.split_at_mut(src);
                low[dest].annotations.copy_from(&high[0].annotations);
            }
            Ordering::Greater => {
                let (low, high) = records.split_at_mut(dest);
                high[0].annotations.copy_from(&low[src].annotations);
            }
        }
    }

    /// Stop tracking the record containing `ptr` and give its buffer back to
    /// `heap`. Remaining records keep their relative order.
    pub fn remove<A>(&mut self, heap: &A, ptr: impl AsUsize) -> Option<Removal>
    where
        A: GlobalAlloc,
    {
        let addr = ptr.as_usize();
        let index = self.position(addr)?;
        let records = self.records.as_mut()?;
        let record = records.remove(index);
        if records.is_empty() {
            self.records = None;
        }

        let payload = record.payload();
        let removal = Removal {
            payload: payload.as_ptr().cast_const(),
            size: record.size,
            exact: payload.as_usize() == addr,
            site: record.site,
        };
        // SAFETY: every record in this registry was framed on `heap` by the
        // owning tracker.
        unsafe { record.release(heap) };
        Some(removal)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.as_deref().unwrap_or(&[]).iter()
    }

    pub fn for_each<F>(&self, f: F)
    where
        F: FnMut(&Record),
    {
        self.iter().for_each(f);
    }

    /// Release every record. Returns how many there were.
    pub fn clear<A>(&mut self, heap: &A) -> usize
    where
        A: GlobalAlloc,
    {
        let Some(records) = self.records.take() else {
            return 0;
        };
        let count = records.len();
        for record in records {
            // SAFETY: as in `remove()`.
            unsafe { record.release(heap) };
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::System;

    use super::*;

    fn site(line: u32) -> Site {
        Site::new(line, "registry.rs")
    }

    fn add(registry: &mut Registry, size: usize, line: u32) -> NonNull<u8> {
        registry
            .add(&System, size, site(line), Fill::Uninit)
            .unwrap()
            .payload()
    }

    #[test]
    fn storage_exists_only_while_records_do() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());
        let p = add(&mut registry, 8, 1);
        assert!(!registry.is_empty());
        registry.remove(&System, p).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn find_is_inclusive_of_one_past_end() {
        let mut registry = Registry::new();
        let p = add(&mut registry, 10, 1);
        let base = p.as_usize();

        for offset in 0..=10 {
            assert!(registry.find(base + offset).is_some(), "offset {offset}");
        }
        assert!(registry.find(base - 1).is_none());
        assert!(registry.find(base + 11).is_none());
        registry.clear(&System);
    }

    #[test]
    fn locate_orders_addresses() {
        let mut registry = Registry::new();
        let p = add(&mut registry, 4, 1);
        let record = registry.find(p).unwrap();
        let base = p.as_usize();
        assert_eq!(record.locate(base - 1), Ordering::Less);
        assert_eq!(record.locate(base + 4), Ordering::Equal);
        assert_eq!(record.locate(base + 5), Ordering::Greater);
        registry.clear(&System);
    }

    #[test]
    fn remove_compacts_in_order() {
        let mut registry = Registry::new();
        let ps: Vec<_> = (0..4).map(|i| add(&mut registry, 16, i)).collect();

        let removal = registry.remove(&System, ps[1]).unwrap();
        assert!(removal.exact);
        assert_eq!(removal.size, 16);
        assert_eq!(removal.site, site(1));

        let lines: Vec<_> = registry.iter().map(|r| r.site().line).collect();
        assert_eq!(lines, [0, 2, 3]);
        assert_eq!(registry.clear(&System), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_through_shifted_pointer_reports_true_start() {
        let mut registry = Registry::new();
        let p = add(&mut registry, 32, 1);
        let shifted = p.as_usize() + 5;

        let removal = registry.remove(&System, shifted).unwrap();
        assert!(removal.is_shifted());
        assert_eq!(removal.payload, p.as_ptr().cast_const());
        assert!(registry.find(p).is_none());
    }

    #[test]
    fn remove_unknown_pointer_finds_nothing() {
        let mut registry = Registry::new();
        assert!(registry.remove(&System, 0x1000usize).is_none());
        let p = add(&mut registry, 8, 1);
        assert!(registry.remove(&System, p.as_usize() + 64).is_none());
        assert_eq!(registry.len(), 1);
        registry.clear(&System);
    }

    #[test]
    fn copy_annotations_in_both_directions() {
        let mut registry = Registry::new();
        let a = add(&mut registry, 8, 1);
        let b = add(&mut registry, 8, 2);
        registry.find_mut(a).unwrap().annotations_mut().push("from a");
        registry.find_mut(b).unwrap().annotations_mut().push("from b");

        registry.copy_annotations(0, 1);
        registry.copy_annotations(1, 0);
        registry.copy_annotations(1, 1);

        let a_notes: Vec<_> = registry.find(a).unwrap().annotations().iter().collect();
        let b_notes: Vec<_> = registry.find(b).unwrap().annotations().iter().collect();
        assert_eq!(a_notes, ["from a", "from b"]);
        assert_eq!(
            b_notes,
            ["from b", "from a", "from b", "from b", "from a", "from b"]
        );
        registry.clear(&System);
    }

    #[test]
    fn for_each_visits_in_storage_order() {
        let mut registry = Registry::new();
        for size in [3, 1, 2] {
            add(&mut registry, size, 0);
        }
        let mut sizes = Vec::new();
        registry.for_each(|record| sizes.push(record.size()));
        assert_eq!(sizes, [3, 1, 2]);
        registry.clear(&System);
    }
}
