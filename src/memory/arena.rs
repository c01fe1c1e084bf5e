//! Page-table storage.
//!
//! Page tables must be reachable by the guest, so they are carved out of
//! fixed-size arenas of host memory that are each registered as one EPT slot.
//! New arenas are marked dirty until the hypervisor layer has registered them.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::memory::pagetables::PteTable;
use crate::memory::{layout, FreeSpaceAllocator, PAGE_SIZE};

/// Pages per arena.
pub const ARENA_PAGES: usize = 300;

/// Bytes per arena.
pub const ARENA_BYTES: u64 = ARENA_PAGES as u64 * PAGE_SIZE;

/// A block of host memory handing out page tables.
pub struct Arena {
    hva: NonNull<u8>,
    gpa: u64,
    /// Number of tables handed out.
    next: usize,
    /// Set until the arena is registered with the hypervisor.
    dirty: bool,
    slot: Option<u32>,
}

// Safety: the arena owns its mapping; tables inside it are only mutated under
// the lock that guards the address spaces.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map a fresh, zeroed arena backed by guest-physical range `gpa`.
    pub fn new(gpa: u64) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ARENA_BYTES as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "arena mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let arena = Self {
            hva: NonNull::new(ptr as *mut u8).ok_or_else(|| {
                Error::MemoryAllocationFailed("arena mmap returned null".to_string())
            })?,
            gpa,
            next: 0,
            dirty: true,
            slot: None,
        };

        // Host addresses below the limit are identity mapped, the arena must
        // not shadow one of them.
        if arena.hva() < layout::ADDRESSABLE_LIMIT {
            return Err(Error::invariant(format!(
                "arena mapped at 0x{:x}, below the guest-physical limit",
                arena.hva()
            )));
        }
        Ok(arena)
    }

    pub fn hva(&self) -> u64 {
        self.hva.as_ptr() as u64
    }

    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn size(&self) -> u64 {
        ARENA_BYTES
    }

    pub fn is_full(&self) -> bool {
        self.next >= ARENA_PAGES
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Record the hypervisor slot backing this arena.
    pub fn set_registered(&mut self, slot: u32) {
        self.slot = Some(slot);
        self.dirty = false;
    }

    /// Hand out the next table, with its guest-physical address.
    fn allocate(&mut self) -> Option<(NonNull<PteTable>, u64)> {
        if self.is_full() {
            return None;
        }
        let offset = self.next as u64 * PAGE_SIZE;
        self.next += 1;
        // Safety: offset stays within the mapping.
        let ptr = unsafe { self.hva.as_ptr().add(offset as usize) } as *mut PteTable;
        NonNull::new(ptr).map(|table| (table, self.gpa + offset))
    }

    pub fn contains_hva(&self, hva: u64) -> bool {
        hva >= self.hva() && hva < self.hva() + self.next as u64 * PAGE_SIZE
    }

    pub fn contains_gpa(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa < self.gpa + self.next as u64 * PAGE_SIZE
    }

    fn hva_to_gpa(&self, hva: u64) -> Option<u64> {
        (self.contains_hva(hva) && hva % PAGE_SIZE == 0).then(|| hva - self.hva() + self.gpa)
    }

    fn gpa_to_table(&self, gpa: u64) -> Option<NonNull<PteTable>> {
        if !self.contains_gpa(gpa) {
            return None;
        }
        let offset = (gpa - self.gpa) & !(PAGE_SIZE - 1);
        // Safety: offset stays within the handed-out part of the mapping.
        NonNull::new(unsafe { self.hva.as_ptr().add(offset as usize) } as *mut PteTable)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.hva.as_ptr() as *mut libc::c_void, ARENA_BYTES as usize);
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("hva", &format_args!("0x{:x}", self.hva()))
            .field("gpa", &format_args!("0x{:x}", self.gpa))
            .field("used", &self.next)
            .field("dirty", &self.dirty)
            .field("slot", &self.slot)
            .finish()
    }
}

/// All arenas of the process.
#[derive(Debug, Default)]
pub struct PageTableAllocator {
    arenas: Vec<Arena>,
    /// Once sealed, no new arena may be created.
    sealed: bool,
    dirty: usize,
}

impl PageTableAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a zeroed table, creating a new arena when the current one is full.
    pub fn allocate(
        &mut self,
        free: &mut FreeSpaceAllocator,
    ) -> Result<(NonNull<PteTable>, u64)> {
        if let Some(table) = self.arenas.last_mut().and_then(Arena::allocate) {
            return Ok(table);
        }
        if self.sealed {
            return Err(Error::ArenasSealed);
        }
        let gpa = free.malloc(ARENA_BYTES)?;
        let mut arena = Arena::new(gpa)?;
        let table = arena
            .allocate()
            .ok_or_else(|| Error::invariant("fresh arena is full"))?;
        crate::debug_memory!("new arena {:?}", arena);
        self.arenas.push(arena);
        self.dirty += 1;
        Ok(table)
    }

    /// Guest-physical address of a table handed out by this allocator.
    pub fn physical_for(&self, table: NonNull<PteTable>) -> Option<u64> {
        let hva = table.as_ptr() as u64;
        self.arenas.iter().find_map(|a| a.hva_to_gpa(hva))
    }

    /// Table stored at guest-physical address `gpa`.
    pub fn lookup(&self, gpa: u64) -> Option<NonNull<PteTable>> {
        self.arenas.iter().find_map(|a| a.gpa_to_table(gpa))
    }

    /// Host address for a guest-physical address inside an arena.
    pub fn hva_for(&self, gpa: u64) -> Option<u64> {
        self.arenas
            .iter()
            .find(|a| gpa >= a.gpa && gpa < a.gpa + ARENA_BYTES)
            .map(|a| gpa - a.gpa + a.hva())
    }

    pub fn seal(&mut self, sealed: bool) {
        self.sealed = sealed;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of arenas not yet registered with the hypervisor.
    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    /// Register every dirty arena through `register`, which returns the slot
    /// used. Arenas stay dirty if registration fails.
    pub fn register_dirty(
        &mut self,
        mut register: impl FnMut(&Arena) -> Result<u32>,
    ) -> Result<usize> {
        let mut done = 0;
        for arena in self.arenas.iter_mut().filter(|a| a.dirty) {
            let slot = register(arena)?;
            arena.set_registered(slot);
            self.dirty -= 1;
            done += 1;
        }
        Ok(done)
    }

    /// Guest-physical spans of the arenas created since `from`.
    pub fn spans_since(&self, from: usize) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.arenas.iter().skip(from).map(|a| (a.gpa, a.size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Prot;
    use crate::memory::{VmArea, VmAreas};

    fn free_space() -> FreeSpaceAllocator {
        let free = VmAreas::from_areas(vec![VmArea::new(0x10_0000, 0x100_0000, Prot::empty())]);
        FreeSpaceAllocator::new(free.unwrap())
    }

    #[test]
    fn test_arena_allocation_and_translation() {
        let mut free = free_space();
        let mut alloc = PageTableAllocator::new();
        let (t1, g1) = alloc.allocate(&mut free).unwrap();
        let (t2, g2) = alloc.allocate(&mut free).unwrap();
        assert_eq!(g1, 0x10_0000);
        assert_eq!(g2, g1 + PAGE_SIZE);
        assert_eq!(alloc.physical_for(t2), Some(g2));
        assert_eq!(alloc.lookup(g1), Some(t1));
        assert_eq!(alloc.lookup(g2 + PAGE_SIZE), None);
        assert_eq!(alloc.dirty_count(), 1);

        // Fresh tables are zeroed.
        let table = unsafe { t1.as_ref() };
        assert!(table.entries.iter().all(|e| e.raw() == 0));
    }

    #[test]
    fn test_arena_rollover_and_seal() {
        let mut free = free_space();
        let mut alloc = PageTableAllocator::new();
        for _ in 0..ARENA_PAGES {
            alloc.allocate(&mut free).unwrap();
        }
        assert_eq!(alloc.arenas().len(), 1);
        alloc.seal(true);
        assert!(matches!(alloc.allocate(&mut free), Err(Error::ArenasSealed)));
        alloc.seal(false);
        let (_, gpa) = alloc.allocate(&mut free).unwrap();
        assert_eq!(alloc.arenas().len(), 2);
        assert_eq!(gpa, 0x10_0000 + ARENA_BYTES);
        assert_eq!(alloc.dirty_count(), 2);
    }

    #[test]
    fn test_register_dirty() {
        let mut free = free_space();
        let mut alloc = PageTableAllocator::new();
        alloc.allocate(&mut free).unwrap();
        let mut next = 3;
        let registered = alloc
            .register_dirty(|_| {
                next += 1;
                Ok(next)
            })
            .unwrap();
        assert_eq!(registered, 1);
        assert_eq!(alloc.dirty_count(), 0);
        assert_eq!(alloc.arenas()[0].slot(), Some(4));
        assert!(!alloc.arenas()[0].is_dirty());
    }
}
