//! Address spaces: the God view of the whole process and per-sandbox copies.
//!
//! Every space shares one [`Physical`] allocator pair, so all views agree on
//! guest-physical placement and their page tables live in the same arenas.

use std::ptr::NonNull;

use crate::config::Prot;
use crate::error::{Error, Result};
use crate::memory::pagetables::{PageTables, PteTable, TableAllocator};
use crate::memory::region::{guest_physical_for, map_linear};
use crate::memory::{
    layout, round_up, FreeSpaceAllocator, MemoryRegion, MemorySpan, PageTableAllocator, ProcessMaps,
    RegionKind, RegionLayout, VmArea, VmAreas,
};

/// Spare regions kept per address space for growth notifications.
pub const EXTENSION_POOL: usize = 50;

/// Guest-physical placement and page-table storage shared by all views.
#[derive(Debug, Default)]
pub struct Physical {
    pub free: FreeSpaceAllocator,
    pub tables: PageTableAllocator,
}

impl Physical {
    pub fn new(free: FreeSpaceAllocator) -> Self {
        Self {
            free,
            tables: PageTableAllocator::new(),
        }
    }

    /// Seed the free space with the holes of the process address space.
    pub fn from_maps(maps: &ProcessMaps) -> Result<Self> {
        Ok(Self::new(FreeSpaceAllocator::new(maps.to_areas()?.mirror())))
    }
}

impl TableAllocator for Physical {
    fn new_table(&mut self) -> Result<(NonNull<PteTable>, u64)> {
        self.tables.allocate(&mut self.free)
    }

    fn table_at(&self, gpa: u64) -> Option<NonNull<PteTable>> {
        self.tables.lookup(gpa)
    }

    fn physical_for(&self, table: NonNull<PteTable>) -> Option<u64> {
        self.tables.physical_for(table)
    }
}

#[derive(Debug)]
pub struct AddressSpace {
    regions: Vec<MemoryRegion>,
    tables: PageTables,
    pool: Vec<MemoryRegion>,
    layout: RegionLayout,
}

impl AddressSpace {
    /// Build the view of the whole process, every mapping with its own rights.
    pub fn god(maps: &ProcessMaps, mut layout: RegionLayout, phys: &mut Physical) -> Result<Self> {
        if layout.c_heap.is_none() {
            layout.c_heap = maps.c_heap;
        }
        let tables = PageTables::new(phys)?;
        let areas = maps.to_areas()?;
        let mut regions = Vec::with_capacity(areas.len());
        for area in areas.iter() {
            let mut region = MemoryRegion::from_area(area, &layout, &mut phys.free)?;
            region.apply_range(&tables, phys, area.start, area.size, area.prot)?;
            region.mark_finalized();
            regions.push(region);
        }
        crate::debug_memory!("god view: {} regions", regions.len());

        let mut space = Self {
            regions,
            tables,
            pool: Vec::new(),
            layout,
        };
        space.replenish();
        Ok(space)
    }

    /// Same regions, fresh page tables, nothing granted yet.
    pub fn copy(&self, phys: &mut Physical) -> Result<Self> {
        let mut space = Self {
            regions: self.regions.iter().map(MemoryRegion::copy_for_view).collect(),
            tables: PageTables::new(phys)?,
            pool: Vec::new(),
            layout: self.layout.clone(),
        };
        space.replenish();
        Ok(space)
    }

    /// Grant the areas of `view` and write every region into the page tables.
    pub fn apply_domain(&mut self, view: &VmAreas, phys: &mut Physical) -> Result<()> {
        for area in view.iter() {
            self.assign(*area)?;
        }
        for region in &mut self.regions {
            region.finalize(&self.tables, phys)?;
        }
        Ok(())
    }

    /// Hand each overlapping region its share of `area`.
    fn assign(&mut self, area: VmArea) -> Result<()> {
        let mut assigned = false;
        for region in self.regions.iter_mut() {
            let start = area.start.max(region.span.start);
            let end = area.end().min(region.span.end());
            if start < end {
                region.assign(VmArea::new(start, end - start, area.prot))?;
                assigned = true;
            }
        }
        if !assigned {
            crate::debug_memory!("area {:?} matches no region", area);
        }
        Ok(())
    }

    pub fn tables(&self) -> &PageTables {
        &self.tables
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn cr3(&self, pcid: u16, noflush: bool) -> u64 {
        self.tables.cr3(pcid, noflush)
    }

    pub fn find_region(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.span.contains(addr))
    }

    pub fn valid_address(&self, addr: u64) -> bool {
        self.find_region(addr).map_or(false, |r| r.valid_address(addr))
    }

    pub fn contains_region(&self, start: u64, size: u64) -> bool {
        self.regions.iter().any(|r| r.contains_range(start, size))
    }

    pub fn has_rights(&self, phys: &Physical, addr: u64, prot: Prot) -> bool {
        self.tables.has_rights(phys, addr, prot)
    }

    /// Host address backing guest-physical `gpa`, regions first, then arenas.
    pub fn find_virtual_for_phys(&self, phys: &Physical, gpa: u64) -> Option<u64> {
        self.regions
            .iter()
            .find(|r| r.span.contains_gpa(gpa))
            .map(|r| r.span.start + (gpa - r.span.gpa))
            .or_else(|| phys.tables.hva_for(gpa))
    }

    /// Flip presence of a heap range. Returns false when no region holds it.
    pub fn toggle(
        &mut self,
        phys: &mut Physical,
        on: bool,
        start: u64,
        size: u64,
        prot: Prot,
    ) -> Result<bool> {
        let tables = &self.tables;
        match self.regions.iter_mut().find(|r| r.contains_range(start, size)) {
            Some(region) => {
                region.toggle(tables, phys, on, start, size, prot)?;
                Ok(true)
            }
            None => {
                crate::debug_memory!(
                    "toggle {} of 0x{:x}+0x{:x}: no region",
                    if on { "on" } else { "off" },
                    start,
                    size
                );
                Ok(false)
            }
        }
    }

    fn acquire(&mut self) -> Result<MemoryRegion> {
        self.pool
            .pop()
            .ok_or_else(|| Error::invariant("extension region pool exhausted"))
    }

    /// Add a fully present region for memory that appeared after startup.
    pub fn extend(
        &mut self,
        phys: &mut Physical,
        heap: bool,
        start: u64,
        size: u64,
        prot: Prot,
    ) -> Result<&MemoryRegion> {
        let size = round_up(size).ok_or(Error::OutOfGuestPhysical(size))?;
        if heap && size > layout::HEAP_REGION_SIZE {
            return Err(Error::invariant(format!(
                "heap extension of 0x{:x} bytes exceeds a region",
                size
            )));
        }
        let kind = if heap {
            RegionKind::Heap
        } else {
            RegionKind::Extensible
        };
        let span = MemorySpan {
            start,
            size,
            prot,
            gpa: guest_physical_for(start, size, &mut phys.free)?,
            slot: None,
        };
        let mut region = self.acquire()?;
        region.reset(kind, span);
        region.set_presence(start, size, true);
        region.apply_range(&self.tables, phys, start, size, prot)?;
        region.mark_finalized();
        self.push(region)
    }

    /// Mirror a region created in another space, sharing its placement.
    pub fn extend_from(&mut self, phys: &mut Physical, orig: &MemoryRegion) -> Result<&MemoryRegion> {
        let mut region = self.acquire()?;
        region.copy_from(orig);
        let span = region.span;
        region.apply_range(&self.tables, phys, span.start, span.size, span.prot)?;
        region.mark_finalized();
        self.push(region)
    }

    /// [`extend_from`](Self::extend_from) for growth seen by the God view.
    pub fn extend_runtime(&mut self, phys: &mut Physical, orig: &MemoryRegion) -> Result<&MemoryRegion> {
        if self.contains_region(orig.span.start, orig.span.size) {
            return Err(Error::invariant(format!(
                "region 0x{:x}+0x{:x} already present",
                orig.span.start, orig.span.size
            )));
        }
        self.extend_from(phys, orig)
    }

    fn push(&mut self, region: MemoryRegion) -> Result<&MemoryRegion> {
        self.regions.push(region);
        self.regions
            .last()
            .ok_or_else(|| Error::invariant("region list empty after push"))
    }

    /// Record the hypervisor slot backing the region that starts at `start`.
    pub fn set_slot(&mut self, start: u64, slot: u32) {
        if let Some(region) = self.regions.iter_mut().find(|r| r.span.start == start) {
            region.span.slot = Some(slot);
        }
    }

    /// Map `[start, start + size)` read-write onto `gpa`.
    pub fn default_map(&self, phys: &mut Physical, start: u64, size: u64, gpa: u64) -> Result<()> {
        map_linear(&self.tables, phys, start, size, gpa, Prot::R | Prot::W | Prot::USER)
    }

    /// Map `[start, start + size)` onto `gpa` with exactly `prot`, whatever the
    /// regions say. Used for memory the guest kernel needs in every view.
    pub fn map_fixed(
        &self,
        phys: &mut Physical,
        start: u64,
        size: u64,
        gpa: u64,
        prot: Prot,
    ) -> Result<()> {
        map_linear(&self.tables, phys, start, size, gpa, prot)
    }

    /// Make every page-table arena reachable from this view, optionally
    /// forbidding new arenas afterwards.
    pub fn map_arenas(&self, phys: &mut Physical, seal: bool) -> Result<()> {
        if seal {
            phys.tables.seal(true);
        }
        // Mapping may itself create arenas, go on until none appear.
        let mut mapped = 0;
        loop {
            let pending: Vec<(u64, u64, u64)> = phys.tables.arenas()[mapped..]
                .iter()
                .map(|a| (a.hva(), a.size(), a.gpa()))
                .collect();
            if pending.is_empty() {
                break;
            }
            mapped += pending.len();
            for &(hva, size, gpa) in &pending {
                self.default_map(phys, hva, size, gpa)?;
            }
        }
        let phys: &Physical = phys;
        for arena in phys.tables.arenas() {
            if !self.tables.lookup(phys, arena.hva()).is_present() {
                return Err(Error::invariant(format!(
                    "arena at 0x{:x} not mapped",
                    arena.hva()
                )));
            }
        }
        Ok(())
    }

    /// Refill the extension pool. Host context only.
    pub fn replenish(&mut self) {
        while self.pool.len() < EXTENSION_POOL {
            self.pool.push(MemoryRegion::spare());
        }
        self.regions.reserve(EXTENSION_POOL);
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }
}
