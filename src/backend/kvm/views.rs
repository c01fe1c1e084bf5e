//! Page-table views of the VT-x backend.
//!
//! One God view of the whole process plus one view per sandbox. All of them
//! share the guest-physical placement, so a hypervisor slot registered for
//! a God region serves every view. Every mutation happens under the single
//! lock the machine keeps around this structure.

use std::collections::BTreeMap;

use crate::config::{PackageId, Prot, SandboxId, SandboxMemory};
use crate::error::{Error, Result};
use crate::memory::{
    round_down, round_up, AddressSpace, Physical, ProcessMaps, RegionLayout, VmArea, PAGE_SIZE,
};
use crate::registry::Registry;

/// Hands out hypervisor memory slots.
pub trait SlotRegistrar {
    /// Back guest-physical `[gpa, gpa + size)` with host memory at `hva` and
    /// return the slot used.
    fn register_slot(&self, gpa: u64, size: u64, hva: u64) -> Result<u32>;
}

/// A range every sandbox view maps, whatever its domain says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KernelRange {
    start: u64,
    size: u64,
    prot: Prot,
}

#[derive(Debug)]
pub struct MemoryViews {
    pub phys: Physical,
    pub god: AddressSpace,
    views: BTreeMap<SandboxId, AddressSpace>,
    kernel: Vec<KernelRange>,
}

impl MemoryViews {
    pub fn new(maps: &ProcessMaps, layout: RegionLayout) -> Result<Self> {
        let mut phys = Physical::from_maps(maps)?;
        let god = AddressSpace::god(maps, layout, &mut phys)?;
        Ok(Self {
            phys,
            god,
            views: BTreeMap::new(),
            kernel: Vec::new(),
        })
    }

    /// Build the view of `sandbox`. Trusted and already known sandboxes are
    /// skipped; returns whether a view was created.
    pub fn add_sandbox(&mut self, sandbox: &SandboxMemory) -> Result<bool> {
        if sandbox.config.is_trusted() || self.views.contains_key(sandbox.id()) {
            return Ok(false);
        }
        let mut view = self.god.copy(&mut self.phys)?;
        view.apply_domain(&sandbox.static_view, &mut self.phys)?;
        for range in &self.kernel {
            map_kernel_range(&self.god, &mut self.phys, &view, range)?;
        }
        crate::debug_memory!(
            "view of {}: cr3=0x{:x}, {} areas",
            sandbox.id(),
            view.cr3(0, false),
            sandbox.static_view.len()
        );
        self.views.insert(sandbox.id().to_string(), view);
        Ok(true)
    }

    pub fn view(&self, id: &str) -> Option<&AddressSpace> {
        self.views.get(id)
    }

    pub fn views(&self) -> impl Iterator<Item = (&SandboxId, &AddressSpace)> {
        self.views.iter()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Bounds of the C heap, end inclusive of the reserved headroom.
    pub fn c_heap(&self) -> Option<(u64, u64)> {
        self.god.layout().c_heap.map(|a| (a.start, a.end()))
    }

    /// Map `[start, start + size)` with `prot` into every sandbox view, now
    /// and for views created later. The range must be known to the God view.
    pub fn map_kernel(&mut self, start: u64, size: u64, prot: Prot) -> Result<()> {
        let end = start
            .checked_add(size)
            .and_then(round_up)
            .ok_or(Error::InvalidAddress(start))?;
        let range = KernelRange {
            start: round_down(start),
            size: end - round_down(start),
            prot,
        };
        for view in self.views.values() {
            map_kernel_range(&self.god, &mut self.phys, view, &range)?;
        }
        self.kernel.push(range);
        Ok(())
    }

    /// Register a slot for every God region that has none yet.
    pub fn register_regions<R: SlotRegistrar + ?Sized>(&mut self, registrar: &R) -> Result<usize> {
        let pending: Vec<(u64, u64, u64)> = self
            .god
            .regions()
            .iter()
            .filter(|r| r.span.slot.is_none())
            .map(|r| (r.span.start, r.span.size, r.span.gpa))
            .collect();
        for &(start, size, gpa) in &pending {
            let slot = registrar.register_slot(gpa, size, start)?;
            self.set_slot(start, slot);
        }
        Ok(pending.len())
    }

    fn set_slot(&mut self, start: u64, slot: u32) {
        self.god.set_slot(start, slot);
        for view in self.views.values_mut() {
            view.set_slot(start, slot);
        }
    }

    /// Register new page-table arenas and map every arena into every view,
    /// until no mapping needs a new arena. `seal` forbids arenas afterwards.
    pub fn sync_arenas<R: SlotRegistrar + ?Sized>(&mut self, registrar: &R, seal: bool) -> Result<()> {
        loop {
            let registered = self
                .phys
                .tables
                .register_dirty(|a| registrar.register_slot(a.gpa(), a.size(), a.hva()))?;
            self.god.map_arenas(&mut self.phys, false)?;
            for view in self.views.values() {
                view.map_arenas(&mut self.phys, false)?;
            }
            if registered == 0 && self.phys.tables.dirty_count() == 0 {
                break;
            }
        }
        if seal {
            self.phys.tables.seal(true);
        }
        Ok(())
    }

    /// Memory `[start, start + size)` moves from package `old` to `new`:
    /// hide it from every sandbox depending on `old`, then show it to every
    /// sandbox depending on `new` with the rights it holds over `new`.
    pub fn transfer(
        &mut self,
        registry: &Registry,
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        if old == new {
            return Err(Error::invariant(format!(
                "transfer of 0x{:x}+0x{:x} to its own package {}",
                start, size, old
            )));
        }
        for id in registry.pkg_deps(old) {
            if let Some(view) = self.views.get_mut(id) {
                view.toggle(&mut self.phys, false, start, size, Prot::UNMAP)?;
            }
        }
        for id in registry.pkg_deps(new) {
            let Some(view) = self.views.get_mut(id) else {
                continue;
            };
            let prot = registry
                .sandbox(id)
                .and_then(|s| s.view.get(&new))
                .copied()
                .ok_or_else(|| {
                    Error::invariant(format!("sandbox {} depends on {} without rights", id, new))
                })?;
            view.toggle(&mut self.phys, true, start, size, prot & Prot::HEAP)?;
        }
        Ok(())
    }

    /// The process grew by `[start, start + size)` on behalf of package `id`.
    /// The God view gets a new region backed by a fresh slot, every sandbox
    /// depending on `id` mirrors it.
    pub fn runtime_growth<R: SlotRegistrar + ?Sized>(
        &mut self,
        registry: &Registry,
        registrar: &R,
        heap: bool,
        id: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        let size = round_up(size).ok_or(Error::OutOfGuestPhysical(size))?;
        let (gpa, size) = {
            let region = self.god.extend(&mut self.phys, heap, start, size, Prot::HEAP)?;
            (region.span.gpa, region.span.size)
        };
        let slot = registrar.register_slot(gpa, size, start)?;
        self.god.set_slot(start, slot);

        let region = self
            .god
            .find_region(start)
            .ok_or_else(|| Error::invariant(format!("grown region 0x{:x} vanished", start)))?;
        for dep in registry.pkg_deps(id) {
            if let Some(view) = self.views.get_mut(dep) {
                view.extend_runtime(&mut self.phys, region)?;
            }
        }
        crate::debug_memory!(
            "growth of 0x{:x}+0x{:x} for package {}: slot {}",
            start,
            size,
            id,
            slot
        );
        Ok(())
    }

    /// Add every mapping of `maps` the God view does not know about yet, and
    /// mirror it into every view. Mappings overlapping a known region or a
    /// page-table arena are left alone.
    pub fn update_missing<R: SlotRegistrar + ?Sized>(
        &mut self,
        maps: &ProcessMaps,
        registrar: &R,
    ) -> Result<usize> {
        let missing: Vec<VmArea> = maps
            .areas
            .iter()
            .filter(|area| self.is_unknown(area))
            .copied()
            .collect();
        for area in &missing {
            let (gpa, size) = {
                let region =
                    self.god
                        .extend(&mut self.phys, false, area.start, area.size, area.prot)?;
                (region.span.gpa, region.span.size)
            };
            let slot = registrar.register_slot(gpa, size, area.start)?;
            self.god.set_slot(area.start, slot);
            let region = self
                .god
                .find_region(area.start)
                .ok_or_else(|| Error::invariant("missing region vanished"))?;
            for view in self.views.values_mut() {
                view.extend_runtime(&mut self.phys, region)?;
            }
            self.replenish();
        }
        if !missing.is_empty() {
            crate::debug_memory!("added {} missing mappings", missing.len());
        }
        Ok(missing.len())
    }

    fn is_unknown(&self, area: &VmArea) -> bool {
        let end = area.end();
        let overlaps = |start: u64, size: u64| start < end && area.start < start + size;
        !self
            .god
            .regions()
            .iter()
            .any(|r| overlaps(r.span.start, r.span.size))
            && !self
                .phys
                .tables
                .arenas()
                .iter()
                .any(|a| overlaps(a.hva(), a.size()))
    }

    /// Refill every extension pool. Host context only.
    pub fn replenish(&mut self) {
        self.god.replenish();
        for view in self.views.values_mut() {
            view.replenish();
        }
    }
}

/// Map a kernel range page by page, each page onto the guest-physical
/// address the God view placed it at.
fn map_kernel_range(
    god: &AddressSpace,
    phys: &mut Physical,
    view: &AddressSpace,
    range: &KernelRange,
) -> Result<()> {
    let mut page = range.start;
    while page < range.start + range.size {
        let region = god.find_region(page).ok_or(Error::InvalidAddress(page))?;
        let gpa = page - region.span.start + region.span.gpa;
        view.map_fixed(phys, page, PAGE_SIZE, gpa, range.prot)?;
        page += PAGE_SIZE;
    }
    Ok(())
}
