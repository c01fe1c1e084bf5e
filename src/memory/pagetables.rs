//! x86-64 four-level page tables and a generic walker.
//!
//! Tables live in guest-physical memory handed out by a [`TableAllocator`];
//! entries store guest-physical addresses, the allocator translates them back
//! to host pointers.

use std::ptr::NonNull;

use crate::config::Prot;
use crate::error::{Error, Result};

/// Entries per table.
pub const ENTRIES: usize = 512;

/// Number of paging levels.
pub const LEVELS: usize = 4;

pub const LEVEL_PTE: usize = 0;
pub const LEVEL_PDE: usize = 1;
pub const LEVEL_PDPTE: usize = 2;
pub const LEVEL_PML4: usize = 3;

const SHIFTS: [u32; LEVELS + 1] = [12, 21, 30, 39, 48];

/// Index of `addr` in a table of the given level.
pub fn pdx(addr: u64, level: usize) -> usize {
    ((addr >> SHIFTS[level]) & 0x1ff) as usize
}

/// Address covered by index `idx` of a table of the given level.
pub fn pdaddr(level: usize, idx: u64) -> u64 {
    idx << SHIFTS[level]
}

/// A single page-table entry.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const ACCESSED: u64 = 1 << 5;
    pub const SUPER: u64 = 1 << 7;
    pub const EXECUTE_DISABLE: u64 = 1 << 63;

    const OPTION_MASK: u64 = Self::EXECUTE_DISABLE | 0xfff;

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_present(&self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Entry never populated.
    pub fn is_cleared(&self) -> bool {
        self.0 == 0
    }

    pub fn address(&self) -> u64 {
        self.0 & !Self::OPTION_MASK
    }

    pub fn flags(&self) -> u64 {
        self.0 & Self::OPTION_MASK
    }

    /// Point the entry at `addr`, present.
    pub fn set_addr(&mut self, addr: u64) {
        self.0 = (addr & !Self::OPTION_MASK) | Self::PRESENT | Self::ACCESSED;
    }

    /// Replace the flags, keeping the address.
    pub fn set_flags(&mut self, flags: u64) {
        self.0 = self.address() | (flags & Self::OPTION_MASK) | Self::ACCESSED;
    }

    pub fn map(&mut self) {
        self.0 |= Self::PRESENT;
    }

    pub fn unmap(&mut self) {
        self.0 &= !Self::PRESENT;
    }

    /// Rights granted by the entry.
    pub fn prot(&self) -> Prot {
        if !self.is_present() {
            return Prot::empty();
        }
        let mut prot = Prot::R;
        if self.0 & Self::WRITABLE != 0 {
            prot |= Prot::W;
        }
        if self.0 & Self::EXECUTE_DISABLE == 0 {
            prot |= Prot::X;
        }
        if self.0 & Self::USER != 0 {
            prot |= Prot::USER;
        }
        prot
    }
}

impl std::fmt::Debug for Pte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pte(0x{:x} flags=0x{:x})", self.address(), self.flags())
    }
}

/// Entry flags for a range with rights `prot`.
pub fn prot_to_flags(prot: Prot) -> u64 {
    let mut flags = Pte::ACCESSED;
    if !prot.contains(Prot::X) {
        flags |= Pte::EXECUTE_DISABLE;
    }
    if prot.contains(Prot::W) {
        flags |= Pte::WRITABLE;
    }
    if prot.contains(Prot::R) {
        flags |= Pte::PRESENT;
    }
    if prot.contains(Prot::USER) {
        flags |= Pte::USER;
    }
    flags
}

/// Keep only the flags that describe access rights.
pub fn clean_flags(flags: u64) -> u64 {
    flags & (Pte::PRESENT | Pte::EXECUTE_DISABLE | Pte::WRITABLE | Pte::USER)
}

/// One page worth of entries.
#[repr(C, align(4096))]
pub struct PteTable {
    pub entries: [Pte; ENTRIES],
}

/// Source of page-table storage.
pub trait TableAllocator {
    /// A zeroed table and its guest-physical address.
    fn new_table(&mut self) -> Result<(NonNull<PteTable>, u64)>;

    /// Table stored at guest-physical address `gpa`.
    fn table_at(&self, gpa: u64) -> Option<NonNull<PteTable>>;

    fn physical_for(&self, table: NonNull<PteTable>) -> Option<u64>;
}

/// Which entries a walk touches.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Levels passed to the visitor, indexed by level.
    pub levels: [bool; LEVELS],
    /// Populate missing entries on the way down.
    pub create: bool,
    /// Also visit non-present entries.
    pub include_absent: bool,
}

impl WalkOptions {
    /// Populate every level, visiting all of them.
    pub const POPULATE: WalkOptions = WalkOptions {
        levels: [true; LEVELS],
        create: true,
        include_absent: false,
    };

    /// Visit existing leaves only, present or not.
    pub const LEAVES: WalkOptions = WalkOptions {
        levels: [true, false, false, false],
        create: false,
        include_absent: true,
    };
}

/// Callback of a page-table walk.
pub trait Visitor {
    /// Guest-physical address a new leaf for virtual address `va` points to.
    fn leaf_address(&self, va: u64) -> u64;

    fn visit(&mut self, va: u64, pte: &mut Pte, level: usize);
}

/// Outcome of looking up a single address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    Present(Pte),
    /// The walk stopped at a missing entry of this level.
    Missing(usize),
    /// The leaf entry was never populated.
    Cleared,
    /// The leaf exists but is not present.
    NotPresent(Pte),
}

impl Mapping {
    pub fn is_present(&self) -> bool {
        matches!(self, Mapping::Present(_))
    }
}

/// A page-table tree rooted at a PML4.
#[derive(Debug)]
pub struct PageTables {
    root: NonNull<PteTable>,
    root_gpa: u64,
}

// Safety: the tables are plain memory owned by the allocator, mutation happens
// under the address-space lock.
unsafe impl Send for PageTables {}
unsafe impl Sync for PageTables {}

impl PageTables {
    pub fn new<A: TableAllocator + ?Sized>(alloc: &mut A) -> Result<Self> {
        let (root, root_gpa) = alloc.new_table()?;
        Ok(Self { root, root_gpa })
    }

    pub fn root_gpa(&self) -> u64 {
        self.root_gpa
    }

    /// CR3 value selecting these tables.
    pub fn cr3(&self, pcid: u16, noflush: bool) -> u64 {
        let mut cr3 = self.root_gpa | (pcid as u64 & 0xfff);
        if noflush {
            cr3 |= 1 << 63;
        }
        cr3
    }

    /// Walk `[start, start + len)` and call the visitor on the selected entries.
    pub fn map<A, V>(
        &self,
        alloc: &mut A,
        start: u64,
        len: u64,
        opts: WalkOptions,
        visitor: &mut V,
    ) -> Result<()>
    where
        A: TableAllocator + ?Sized,
        V: Visitor + ?Sized,
    {
        if len == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(len - 1)
            .ok_or(Error::InvalidAddress(start))?;
        Self::walk(alloc, self.root, start, end, LEVEL_PML4, &opts, visitor)
    }

    fn walk<A, V>(
        alloc: &mut A,
        table: NonNull<PteTable>,
        start: u64,
        end: u64,
        level: usize,
        opts: &WalkOptions,
        visitor: &mut V,
    ) -> Result<()>
    where
        A: TableAllocator + ?Sized,
        V: Visitor + ?Sized,
    {
        let base = start & !(pdaddr(level + 1, 1) - 1);
        let (first, last) = (pdx(start, level), pdx(end, level));
        for i in first..=last {
            let va = base + pdaddr(level, i as u64);
            // Safety: tables handed out by the allocator stay mapped for the
            // life of the process and are only walked under the space lock.
            let entry = unsafe { &mut (*table.as_ptr()).entries[i] };

            if entry.address() == 0 && opts.create {
                let addr = if level > LEVEL_PTE {
                    alloc.new_table()?.1
                } else {
                    visitor.leaf_address(va)
                };
                entry.set_addr(addr);
            }

            let present = entry.is_present();
            if opts.levels[level] && (present || opts.include_absent) {
                visitor.visit(va, entry, level);
            }

            if level > LEVEL_PTE && entry.address() != 0 {
                let span = pdaddr(level, 1);
                let nstart = if i == first { start } else { va };
                let nend = if i == last { end } else { va + span - 1 };
                if let Some(child) = alloc.table_at(entry.address()) {
                    Self::walk(alloc, child, nstart, nend, level - 1, opts, visitor)?;
                }
            }
        }
        Ok(())
    }

    /// Leaf entry for `addr`, if every level above it exists.
    pub fn find_mapping<A: TableAllocator + ?Sized>(&self, alloc: &A, addr: u64) -> Option<Pte> {
        match self.lookup(alloc, addr) {
            Mapping::Present(pte) | Mapping::NotPresent(pte) => Some(pte),
            Mapping::Missing(_) | Mapping::Cleared => None,
        }
    }

    /// Resolve `addr` down to its leaf.
    pub fn lookup<A: TableAllocator + ?Sized>(&self, alloc: &A, addr: u64) -> Mapping {
        let mut table = self.root;
        for level in (LEVEL_PDE..=LEVEL_PML4).rev() {
            // Safety: see `walk`.
            let entry = unsafe { (*table.as_ptr()).entries[pdx(addr, level)] };
            if !entry.is_present() {
                return Mapping::Missing(level);
            }
            match alloc.table_at(entry.address()) {
                Some(child) => table = child,
                None => return Mapping::Missing(level),
            }
        }
        // Safety: see `walk`.
        let pte = unsafe { (*table.as_ptr()).entries[pdx(addr, LEVEL_PTE)] };
        if pte.is_cleared() {
            Mapping::Cleared
        } else if pte.is_present() {
            Mapping::Present(pte)
        } else {
            Mapping::NotPresent(pte)
        }
    }

    /// Whether `addr` is mapped with at least the rights in `prot`.
    pub fn has_rights<A: TableAllocator + ?Sized>(&self, alloc: &A, addr: u64, prot: Prot) -> bool {
        match self.lookup(alloc, addr) {
            Mapping::Present(pte) => pte.prot().contains(prot),
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Tables on the Rust heap, addressed from a fake guest-physical base.
    #[derive(Default)]
    pub(crate) struct HeapTables {
        pub(crate) tables: Vec<NonNull<PteTable>>,
    }

    const BASE: u64 = 0x4000_0000;

    impl TableAllocator for HeapTables {
        fn new_table(&mut self) -> Result<(NonNull<PteTable>, u64)> {
            // Leaked: tests are short lived.
            let table = Box::leak(Box::new(PteTable {
                entries: [Pte::default(); ENTRIES],
            }));
            let ptr = NonNull::from(table);
            let gpa = BASE + self.tables.len() as u64 * 0x1000;
            self.tables.push(ptr);
            Ok((ptr, gpa))
        }

        fn table_at(&self, gpa: u64) -> Option<NonNull<PteTable>> {
            let idx = gpa.checked_sub(BASE)? / 0x1000;
            self.tables.get(idx as usize).copied()
        }

        fn physical_for(&self, table: NonNull<PteTable>) -> Option<u64> {
            self.tables
                .iter()
                .position(|t| *t == table)
                .map(|i| BASE + i as u64 * 0x1000)
        }
    }

    struct Identity {
        flags: u64,
        visited: Vec<(u64, usize)>,
    }

    impl Visitor for Identity {
        fn leaf_address(&self, va: u64) -> u64 {
            va
        }

        fn visit(&mut self, va: u64, pte: &mut Pte, level: usize) {
            self.visited.push((va, level));
            if level == LEVEL_PTE {
                pte.set_flags(self.flags);
            } else {
                pte.set_flags(prot_to_flags(Prot::DEFAULT));
            }
        }
    }

    #[test]
    fn test_indices() {
        let addr = 0x7f12_3456_7000;
        assert_eq!(pdx(addr, LEVEL_PML4), 0xfe);
        assert_eq!(pdx(addr, LEVEL_PTE), 0x167);
        assert_eq!(pdaddr(LEVEL_PDE, 1), 0x20_0000);
    }

    #[test]
    fn test_prot_to_flags() {
        let flags = prot_to_flags(Prot::R | Prot::X | Prot::USER);
        assert_eq!(flags, Pte::ACCESSED | Pte::PRESENT | Pte::USER);
        let flags = prot_to_flags(Prot::HEAP);
        assert_eq!(
            flags,
            Pte::ACCESSED | Pte::PRESENT | Pte::USER | Pte::WRITABLE | Pte::EXECUTE_DISABLE
        );
        // SUPER alone does not make a user page.
        assert_eq!(prot_to_flags(Prot::R | Prot::SUPER) & Pte::USER, 0);
        assert_eq!(clean_flags(flags | Pte::ACCESSED), flags & !Pte::ACCESSED);
    }

    #[test]
    fn test_pte_roundtrip_rights() {
        let mut pte = Pte::default();
        pte.set_addr(0x1234_5000);
        pte.set_flags(prot_to_flags(Prot::R | Prot::W | Prot::USER));
        assert_eq!(pte.address(), 0x1234_5000);
        assert_eq!(pte.prot(), Prot::R | Prot::W | Prot::USER);
        pte.unmap();
        assert_eq!(pte.prot(), Prot::empty());
        pte.map();
        assert!(pte.is_present());
    }

    #[test]
    fn test_map_populates_and_visits() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        let mut visitor = Identity {
            flags: prot_to_flags(Prot::R | Prot::USER),
            visited: Vec::new(),
        };
        // Three pages straddling a 2MB boundary.
        let start = 0x1f_f000;
        tables
            .map(&mut alloc, start, 0x3000, WalkOptions::POPULATE, &mut visitor)
            .unwrap();

        let leaves: Vec<u64> = visitor
            .visited
            .iter()
            .filter(|(_, l)| *l == LEVEL_PTE)
            .map(|(va, _)| *va)
            .collect();
        assert_eq!(leaves, vec![0x1f_f000, 0x20_0000, 0x20_1000]);
        // root + pdpt + pd + two pts
        assert_eq!(alloc.tables.len(), 5);

        for va in [0x1f_f000, 0x20_1000] {
            let pte = tables.find_mapping(&alloc, va).unwrap();
            assert_eq!(pte.address(), va);
            assert!(tables.has_rights(&alloc, va, Prot::R));
            assert!(!tables.has_rights(&alloc, va, Prot::W));
            assert!(!tables.has_rights(&alloc, va, Prot::X));
        }
        assert_eq!(tables.lookup(&alloc, 0x20_3000), Mapping::Cleared);
        assert_eq!(tables.lookup(&alloc, 0x80_0000), Mapping::Missing(LEVEL_PDE));
        assert_eq!(tables.lookup(&alloc, 0x4000_0000), Mapping::Missing(LEVEL_PDPTE));
        assert_eq!(tables.lookup(&alloc, 0x80_0000_0000), Mapping::Missing(LEVEL_PML4));
    }

    #[test]
    fn test_leaf_walk_does_not_create() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        let mut visitor = Identity {
            flags: prot_to_flags(Prot::HEAP),
            visited: Vec::new(),
        };
        tables
            .map(&mut alloc, 0x1000, 0x1000, WalkOptions::LEAVES, &mut visitor)
            .unwrap();
        assert!(visitor.visited.is_empty());
        assert_eq!(alloc.tables.len(), 1);
    }

    #[test]
    fn test_cr3() {
        let mut alloc = HeapTables::default();
        let tables = PageTables::new(&mut alloc).unwrap();
        assert_eq!(tables.cr3(0, false), BASE);
        assert_eq!(tables.cr3(3, true), BASE | 3 | 1 << 63);
        assert_eq!(alloc.physical_for(tables.root), Some(BASE));
    }
}
