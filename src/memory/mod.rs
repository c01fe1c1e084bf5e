//! Address-space model shared by the backends.
//!
//! Everything here works on host virtual addresses first: an interval set of
//! [`VmArea`]s describes what a sandbox may touch, and the VT-x backend turns
//! that description into guest page tables (host virtual == guest virtual,
//! host memory exposed to the guest through EPT slots).

mod address_space;
mod arena;
mod area;
mod free_space;
mod maps;
pub mod pagetables;
mod region;

pub use address_space::{AddressSpace, Physical};
pub use arena::{Arena, PageTableAllocator};
pub use area::{package_areas, section_area, VmArea, VmAreas};
pub use free_space::FreeSpaceAllocator;
pub use maps::ProcessMaps;
pub use pagetables::{Mapping, PageTables, Pte, PteTable, TableAllocator};
pub use region::{MemoryRegion, MemorySpan, RegionKind, RegionLayout};

pub const PAGE_SIZE: u64 = 0x1000;

/// Fixed layout constants of the sandboxed process.
pub mod layout {
    /// Addresses below this limit are mapped at the same guest-physical address.
    pub const ADDRESSABLE_LIMIT: u64 = 1 << 39;

    /// Start of the language runtime's managed heap.
    pub const HEAP_START: u64 = 0xc0_0000_0000;

    /// Default size of the managed heap window.
    pub const HEAP_WINDOW: u64 = 1 << 38;

    /// Largest span a single heap region may cover.
    pub const HEAP_REGION_SIZE: u64 = 0x400_0000;

    /// Bitmap words of a heap region of [`HEAP_REGION_SIZE`] bytes.
    pub const HEAP_BITMAP_WORDS: usize = 256;

    /// Extra C-heap headroom reserved when `LITTERBOX_INC_HEAP` is set.
    pub const C_HEAP_HEADROOM: u64 = 0x1000_0000;
}

/// Round `addr` down to a page boundary.
pub fn round_down(addr: u64) -> u64 {
    addr - (addr % PAGE_SIZE)
}

/// Round `addr` up to a page boundary, `None` past the last page.
pub fn round_up(addr: u64) -> Option<u64> {
    match addr % PAGE_SIZE {
        0 => Some(addr),
        rem => addr.checked_add(PAGE_SIZE - rem),
    }
}

pub fn is_page_aligned(addr: u64) -> bool {
    addr % PAGE_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round() {
        assert_eq!(round_up(0x1000), Some(0x1000));
        assert_eq!(round_up(0x1001), Some(0x2000));
        assert_eq!(round_down(0x1fff), 0x1000);
        assert_eq!(round_up(0), Some(0));
        assert_eq!(round_up(u64::MAX - PAGE_SIZE + 1), Some(u64::MAX - PAGE_SIZE + 1));
        assert_eq!(round_up(u64::MAX), None);
        assert_eq!(round_up(u64::MAX - PAGE_SIZE + 2), None);
        assert!(is_page_aligned(0xc0_0000_0000));
    }

    #[test]
    fn test_heap_bitmap_covers_region() {
        assert_eq!(
            layout::HEAP_BITMAP_WORDS as u64 * 64 * PAGE_SIZE,
            layout::HEAP_REGION_SIZE
        );
    }
}
