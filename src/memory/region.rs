//! Memory regions: contiguous spans of the process with a mapping policy.
//!
//! - `Immutable` regions (code, read-only and static data) map exactly the
//!   areas a view grants and never change afterwards.
//! - `Heap` regions cover the managed heap and track page presence in a
//!   bitmap that transfers between packages toggle.
//! - `Extensible` regions (runtime metadata, C heap, mmap'd memory) are always
//!   fully present and only grow.

use crate::config::Prot;
use crate::error::{Error, Result};
use crate::memory::pagetables::{
    prot_to_flags, PageTables, Pte, TableAllocator, Visitor, WalkOptions, LEVEL_PTE,
};
use crate::memory::{layout, FreeSpaceAllocator, VmArea, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Immutable,
    Heap,
    Extensible,
}

/// Host range of a region and where it lives in guest-physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    pub start: u64,
    pub size: u64,
    pub prot: Prot,
    pub gpa: u64,
    /// Hypervisor slot, once registered.
    pub slot: Option<u32>,
}

impl MemorySpan {
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }

    pub fn contains_gpa(&self, gpa: u64) -> bool {
        self.gpa <= gpa && gpa < self.gpa + self.size
    }
}

/// Where the managed heap and the C heap live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    pub heap_start: u64,
    pub heap_end: u64,
    pub c_heap: Option<VmArea>,
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self {
            heap_start: layout::HEAP_START,
            heap_end: layout::HEAP_START + layout::HEAP_WINDOW,
            c_heap: None,
        }
    }
}

impl RegionLayout {
    pub fn is_heap(&self, addr: u64) -> bool {
        self.heap_start <= addr && addr < self.heap_end
    }

    /// Pick the region kind of a freshly discovered area.
    pub fn classify(&self, area: &VmArea) -> RegionKind {
        let exec = area.prot.contains(Prot::X);
        let read = area.prot.contains(Prot::R);
        let write = area.prot.contains(Prot::W);
        let heap = self.is_heap(area.start);
        let meta = !heap && area.start > self.heap_start;
        let c_heap = self.c_heap.map_or(false, |c| c.start == area.start);

        if !meta && (exec || (read && !write)) && !c_heap {
            return RegionKind::Immutable;
        }
        if heap {
            RegionKind::Heap
        } else if meta || c_heap {
            RegionKind::Extensible
        } else {
            RegionKind::Immutable
        }
    }
}

/// Guest-physical address backing `[start, start + size)`.
pub(crate) fn guest_physical_for(
    start: u64,
    size: u64,
    free: &mut FreeSpaceAllocator,
) -> Result<u64> {
    if start + size <= layout::ADDRESSABLE_LIMIT {
        Ok(start)
    } else {
        free.malloc(size)
    }
}

fn bitmap_words(size: u64) -> usize {
    let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    ((pages + 63) / 64) as usize
}

#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub span: MemorySpan,
    /// One bit per page. Empty for extensible regions.
    bitmap: Vec<u64>,
    /// Areas granted by the current view.
    view: Vec<VmArea>,
    finalized: bool,
}

impl MemoryRegion {
    pub fn new(kind: RegionKind, span: MemorySpan) -> Self {
        let bitmap = match kind {
            RegionKind::Extensible => Vec::new(),
            _ => vec![0; bitmap_words(span.size)],
        };
        Self {
            kind,
            span,
            bitmap,
            view: Vec::new(),
            finalized: false,
        }
    }

    /// A blank region with a heap-sized bitmap, kept in reserve so that
    /// growth notifications do not allocate.
    pub(crate) fn spare() -> Self {
        Self {
            kind: RegionKind::Extensible,
            span: MemorySpan {
                start: 0,
                size: 0,
                prot: Prot::empty(),
                gpa: 0,
                slot: None,
            },
            bitmap: Vec::with_capacity(layout::HEAP_BITMAP_WORDS),
            view: Vec::new(),
            finalized: false,
        }
    }

    /// Turn a spare into a region of the given kind, reusing its bitmap storage.
    pub(crate) fn reset(&mut self, kind: RegionKind, span: MemorySpan) {
        self.kind = kind;
        self.span = span;
        self.bitmap.clear();
        if kind != RegionKind::Extensible {
            self.bitmap.resize(bitmap_words(span.size), 0);
        }
        self.view.clear();
        self.finalized = false;
    }

    /// Region covering a whole area, every page present.
    pub fn from_area(
        area: &VmArea,
        regions: &RegionLayout,
        free: &mut FreeSpaceAllocator,
    ) -> Result<Self> {
        let span = MemorySpan {
            start: area.start,
            size: area.size,
            prot: area.prot,
            gpa: guest_physical_for(area.start, area.size, free)?,
            slot: None,
        };
        let mut region = Self::new(regions.classify(area), span);
        region.set_presence(area.start, area.size, true);
        Ok(region)
    }

    /// Copy for a new view: same span and heap presence, no granted areas yet.
    pub fn copy_for_view(&self) -> Self {
        let mut copy = self.clone();
        copy.view.clear();
        copy.finalized = false;
        if copy.kind == RegionKind::Immutable {
            copy.bitmap.iter_mut().for_each(|w| *w = 0);
        }
        copy
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn view(&self) -> &[VmArea] {
        &self.view
    }

    fn page_index(&self, addr: u64) -> usize {
        ((addr - self.span.start) / PAGE_SIZE) as usize
    }

    pub(crate) fn set_presence(&mut self, start: u64, size: u64, on: bool) {
        if self.kind == RegionKind::Extensible || size == 0 {
            return;
        }
        let first = self.page_index(start.max(self.span.start));
        let last = self.page_index((start + size - 1).min(self.span.end() - 1));
        for page in first..=last {
            if let Some(word) = self.bitmap.get_mut(page / 64) {
                if on {
                    *word |= 1 << (page % 64);
                } else {
                    *word &= !(1 << (page % 64));
                }
            }
        }
    }

    /// Whether the page containing `addr` is marked present.
    pub fn is_present(&self, addr: u64) -> bool {
        if self.kind == RegionKind::Extensible {
            return self.span.contains(addr);
        }
        if !self.span.contains(addr) {
            return false;
        }
        let page = self.page_index(addr);
        self.bitmap
            .get(page / 64)
            .map_or(false, |w| w & (1 << (page % 64)) != 0)
    }

    /// Record an area of the view. It must lie inside the span.
    pub fn assign(&mut self, area: VmArea) -> Result<()> {
        if !(self.span.start <= area.start && area.end() <= self.span.end()) {
            return Err(Error::invariant(format!(
                "area {:?} outside region 0x{:x}-0x{:x}",
                area,
                self.span.start,
                self.span.end()
            )));
        }
        self.view.push(area);
        Ok(())
    }

    /// Write the region into `tables` according to its kind.
    pub fn finalize<A: TableAllocator + ?Sized>(
        &mut self,
        tables: &PageTables,
        alloc: &mut A,
    ) -> Result<()> {
        match self.kind {
            RegionKind::Immutable => {
                for i in 0..self.view.len() {
                    let area = self.view[i];
                    self.set_presence(area.start, area.size, true);
                    self.apply_range(tables, alloc, area.start, area.size, area.prot)?;
                }
            }
            RegionKind::Heap | RegionKind::Extensible => {
                self.apply_range(tables, alloc, self.span.start, self.span.size, self.span.prot)?;
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Populate entries for a range, leaves get `span.prot & prot`. Heap pages
    /// not marked present are left unmapped.
    pub fn apply_range<A: TableAllocator + ?Sized>(
        &self,
        tables: &PageTables,
        alloc: &mut A,
        start: u64,
        size: u64,
        prot: Prot,
    ) -> Result<()> {
        let mut visitor = RangeVisitor {
            region: self,
            leaf: prot_to_flags(self.span.prot & prot),
            inner: prot_to_flags(Prot::DEFAULT),
        };
        tables.map(alloc, start, size, WalkOptions::POPULATE, &mut visitor)
    }

    /// Mark a heap range present (with `prot`) or absent.
    pub fn toggle<A: TableAllocator + ?Sized>(
        &mut self,
        tables: &PageTables,
        alloc: &mut A,
        on: bool,
        start: u64,
        size: u64,
        prot: Prot,
    ) -> Result<()> {
        if self.kind != RegionKind::Heap {
            return Err(Error::invariant(format!(
                "toggle of {:?} region at 0x{:x}",
                self.kind, self.span.start
            )));
        }
        if on && !self.span.prot.contains(prot) {
            return Err(Error::invariant(format!(
                "toggle rights {} exceed region rights {}",
                prot, self.span.prot
            )));
        }
        self.set_presence(start, size, on);
        let mut visitor = ToggleVisitor {
            span: self.span,
            on,
            flags: prot_to_flags(prot),
        };
        tables.map(alloc, start, size, WalkOptions::LEAVES, &mut visitor)
    }

    /// Whether `addr` may be touched through this region.
    pub fn valid_address(&self, addr: u64) -> bool {
        if !self.span.contains(addr) {
            return false;
        }
        if self.kind == RegionKind::Extensible || self.bitmap.is_empty() || !self.finalized {
            return true;
        }
        match self.kind {
            RegionKind::Immutable => self.is_present(addr),
            _ => true,
        }
    }

    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        size > 0 && self.valid_address(addr) && self.valid_address(addr + size - 1)
    }

    pub(crate) fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Take over span, kind and presence of `orig`.
    pub(crate) fn copy_from(&mut self, orig: &MemoryRegion) {
        self.reset(orig.kind, orig.span);
        if self.kind != RegionKind::Extensible {
            let n = self.bitmap.len().min(orig.bitmap.len());
            self.bitmap[..n].copy_from_slice(&orig.bitmap[..n]);
        }
    }
}

struct RangeVisitor<'r> {
    region: &'r MemoryRegion,
    leaf: u64,
    inner: u64,
}

impl Visitor for RangeVisitor<'_> {
    fn leaf_address(&self, va: u64) -> u64 {
        va - self.region.span.start + self.region.span.gpa
    }

    fn visit(&mut self, va: u64, pte: &mut Pte, level: usize) {
        if level != LEVEL_PTE {
            pte.set_flags(self.inner);
            return;
        }
        pte.set_flags(self.leaf);
        if self.region.kind == RegionKind::Heap && !self.region.is_present(va) {
            pte.unmap();
        }
    }
}

struct ToggleVisitor {
    span: MemorySpan,
    on: bool,
    flags: u64,
}

impl Visitor for ToggleVisitor {
    fn leaf_address(&self, va: u64) -> u64 {
        va - self.span.start + self.span.gpa
    }

    fn visit(&mut self, va: u64, pte: &mut Pte, _level: usize) {
        // Rights without R leave the page absent.
        if !self.on || self.flags & Pte::PRESENT == 0 {
            pte.unmap();
            return;
        }
        if pte.address() == 0 {
            pte.set_addr(self.leaf_address(va));
        }
        pte.set_flags(self.flags);
        pte.map();
    }
}

/// Map `[start, start + size)` onto guest-physical `gpa` with rights `prot`,
/// for memory outside any region (page-table arenas, guest kernel tables).
pub(crate) fn map_linear<A: TableAllocator + ?Sized>(
    tables: &PageTables,
    alloc: &mut A,
    start: u64,
    size: u64,
    gpa: u64,
    prot: Prot,
) -> Result<()> {
    struct Linear {
        start: u64,
        gpa: u64,
        leaf: u64,
        inner: u64,
    }

    impl Visitor for Linear {
        fn leaf_address(&self, va: u64) -> u64 {
            va - self.start + self.gpa
        }

        fn visit(&mut self, _va: u64, pte: &mut Pte, level: usize) {
            pte.set_flags(if level == LEVEL_PTE { self.leaf } else { self.inner });
        }
    }

    let mut visitor = Linear {
        start,
        gpa,
        leaf: prot_to_flags(prot),
        inner: prot_to_flags(Prot::DEFAULT),
    };
    tables.map(alloc, start, size, WalkOptions::POPULATE, &mut visitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pagetables::tests::HeapTables;
    use crate::memory::VmAreas;

    const RX: Prot = Prot::R.union(Prot::X).union(Prot::USER);

    fn free() -> FreeSpaceAllocator {
        FreeSpaceAllocator::new(
            VmAreas::from_areas(vec![VmArea::new(0x1_0000_0000, 0x1000_0000, Prot::empty())])
                .unwrap(),
        )
    }

    #[test]
    fn test_classify() {
        let layout = RegionLayout {
            c_heap: Some(VmArea::new(0x60_0000, 0x1000, Prot::HEAP)),
            ..RegionLayout::default()
        };
        let code = VmArea::new(0x40_0000, 0x1000, RX);
        let data = VmArea::new(0x50_0000, 0x1000, Prot::HEAP);
        let cheap = VmArea::new(0x60_0000, 0x1000, Prot::HEAP);
        let heap = VmArea::new(layout::HEAP_START, 0x40_0000, Prot::HEAP);
        let mmapped = VmArea::new(0x7f00_0000_0000, 0x1000, Prot::HEAP);
        let libc_code = VmArea::new(0x7f00_0000_1000, 0x1000, RX);
        assert_eq!(layout.classify(&code), RegionKind::Immutable);
        assert_eq!(layout.classify(&data), RegionKind::Immutable);
        assert_eq!(layout.classify(&cheap), RegionKind::Extensible);
        assert_eq!(layout.classify(&heap), RegionKind::Heap);
        assert_eq!(layout.classify(&mmapped), RegionKind::Extensible);
        assert_eq!(layout.classify(&libc_code), RegionKind::Extensible);
    }

    #[test]
    fn test_from_area_gpa() {
        let mut free = free();
        let layout = RegionLayout::default();
        let low = MemoryRegion::from_area(&VmArea::new(0x40_0000, 0x2000, RX), &layout, &mut free)
            .unwrap();
        assert_eq!(low.span.gpa, 0x40_0000);
        let high = MemoryRegion::from_area(
            &VmArea::new(0x7f00_0000_0000, 0x2000, Prot::HEAP),
            &layout,
            &mut free,
        )
        .unwrap();
        assert_eq!(high.span.gpa, 0x1_0000_0000);
        assert!(low.is_present(0x40_1fff));
        assert!(!low.is_present(0x40_2000));
    }

    #[test]
    fn test_immutable_maps_only_view() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        let mut free = free();
        let god = MemoryRegion::from_area(
            &VmArea::new(0x40_0000, 0x4000, RX),
            &RegionLayout::default(),
            &mut free,
        )
        .unwrap();
        let mut region = god.copy_for_view();
        region.assign(VmArea::new(0x40_1000, 0x1000, RX)).unwrap();
        region.finalize(&tables, &mut alloc).unwrap();

        assert!(tables.has_rights(&alloc, 0x40_1000, Prot::R | Prot::X));
        assert!(!tables.has_rights(&alloc, 0x40_0000, Prot::R));
        assert!(!tables.has_rights(&alloc, 0x40_2000, Prot::R));
        assert!(region.valid_address(0x40_1800));
        assert!(!region.valid_address(0x40_0000));
        assert!(region.assign(VmArea::new(0x40_3000, 0x2000, RX)).is_err());
    }

    #[test]
    fn test_heap_toggle() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        let mut region = MemoryRegion::new(
            RegionKind::Heap,
            MemorySpan {
                start: layout::HEAP_START,
                size: 0x10_0000,
                prot: Prot::HEAP,
                gpa: 0x2_0000_0000,
                slot: None,
            },
        );
        region.set_presence(layout::HEAP_START, 0x2000, true);
        region.finalize(&tables, &mut alloc).unwrap();

        let a = layout::HEAP_START;
        let b = layout::HEAP_START + 0x2000;
        assert!(tables.has_rights(&alloc, a, Prot::R | Prot::W));
        assert!(!tables.has_rights(&alloc, a, Prot::X));
        assert!(!tables.has_rights(&alloc, b, Prot::R));
        assert_eq!(tables.find_mapping(&alloc, b).unwrap().address(), 0x2_0000_2000);

        region.toggle(&tables, &mut alloc, true, b, 0x1000, Prot::R | Prot::USER).unwrap();
        assert!(tables.has_rights(&alloc, b, Prot::R));
        assert!(!tables.has_rights(&alloc, b, Prot::W));
        assert!(region.is_present(b));

        region.toggle(&tables, &mut alloc, false, a, 0x1000, Prot::empty()).unwrap();
        assert!(!tables.has_rights(&alloc, a, Prot::R));
        assert!(!region.is_present(a));

        assert!(region.toggle(&tables, &mut alloc, true, a, 0x1000, Prot::RWX).is_err());

        // Unmapped rights keep the page absent.
        region.toggle(&tables, &mut alloc, true, a, 0x1000, Prot::U).unwrap();
        assert!(!tables.has_rights(&alloc, a, Prot::empty()));
        assert!(tables.lookup(&alloc, a) != crate::memory::Mapping::Cleared);
    }

    #[test]
    fn test_toggle_rejects_immutable() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        let mut free = free();
        let mut region = MemoryRegion::from_area(
            &VmArea::new(0x40_0000, 0x1000, RX),
            &RegionLayout::default(),
            &mut free,
        )
        .unwrap();
        assert!(region
            .toggle(&tables, &mut alloc, false, 0x40_0000, 0x1000, Prot::empty())
            .is_err());
    }

    #[test]
    fn test_spare_reuse_keeps_capacity() {
        let mut spare = MemoryRegion::spare();
        let cap = spare.bitmap.capacity();
        spare.reset(
            RegionKind::Heap,
            MemorySpan {
                start: layout::HEAP_START,
                size: layout::HEAP_REGION_SIZE,
                prot: Prot::HEAP,
                gpa: 0,
                slot: None,
            },
        );
        assert_eq!(spare.bitmap.len(), layout::HEAP_BITMAP_WORDS);
        assert_eq!(spare.bitmap.capacity(), cap);
    }

    #[test]
    fn test_map_linear() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        map_linear(
            &tables,
            &mut alloc,
            0x7f00_0000_0000,
            0x2000,
            0x3000_0000,
            Prot::R | Prot::W | Prot::USER,
        )
        .unwrap();
        let pte = tables.find_mapping(&alloc, 0x7f00_0000_1000).unwrap();
        assert_eq!(pte.address(), 0x3000_1000);
        assert_eq!(pte.prot(), Prot::R | Prot::W | Prot::USER);
    }
}
