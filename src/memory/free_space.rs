//! Best-fit allocator of guest-physical ranges.
//!
//! Guest-physical memory is handed out from the holes of the process address
//! space below [`layout::ADDRESSABLE_LIMIT`](crate::memory::layout), so that
//! host ranges below the limit can keep an identity mapping.

use crate::config::Prot;
use crate::error::{Error, Result};
use crate::memory::{round_up, VmArea, VmAreas};

#[derive(Debug, Clone, Default)]
pub struct FreeSpaceAllocator {
    free: VmAreas,
    used: VmAreas,
}

impl FreeSpaceAllocator {
    /// Start from a set of free ranges, usually the mirror of the process maps.
    pub fn new(free: VmAreas) -> Self {
        Self {
            free,
            used: VmAreas::new(),
        }
    }

    /// Carve `size` bytes (rounded up to pages) out of the smallest free range
    /// that fits.
    pub fn malloc(&mut self, size: u64) -> Result<u64> {
        let size = round_up(size).ok_or(Error::OutOfGuestPhysical(size))?;
        if size == 0 {
            return Err(Error::invariant("zero-sized guest-physical allocation"));
        }
        let candidate = self
            .free
            .iter()
            .filter(|a| a.size >= size)
            .min_by_key(|a| a.size)
            .copied()
            .ok_or(Error::OutOfGuestPhysical(size))?;

        let taken = VmArea::new(candidate.start, size, Prot::empty());
        self.free.unmap(taken);
        self.used.map(taken)?;
        Ok(taken.start)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.total_size()
    }

    pub fn is_free(&self, addr: u64) -> bool {
        self.free.contains(addr)
    }

    pub fn is_used(&self, addr: u64) -> bool {
        self.used.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(ranges: &[(u64, u64)]) -> FreeSpaceAllocator {
        let areas = ranges
            .iter()
            .map(|&(s, e)| VmArea::new(s, e - s, Prot::empty()))
            .collect();
        FreeSpaceAllocator::new(VmAreas::from_areas(areas).unwrap())
    }

    #[test]
    fn test_malloc_best_fit() {
        let mut free = allocator(&[(0x0, 0x10000), (0x20000, 0x22000), (0x30000, 0x33000)]);
        // The 2-page hole is the tightest fit.
        assert_eq!(free.malloc(0x1800).unwrap(), 0x20000);
        assert!(!free.is_free(0x20000));
        assert!(free.is_used(0x21000));
        assert_eq!(free.free_bytes(), 0x10000 + 0x3000);
        // Next tightest is the 3-page hole.
        assert_eq!(free.malloc(0x1000).unwrap(), 0x30000);
        assert_eq!(free.malloc(0x1000).unwrap(), 0x31000);
    }

    #[test]
    fn test_malloc_exact_fit_consumes_hole() {
        let mut free = allocator(&[(0x1000, 0x2000), (0x8000, 0x10000)]);
        assert_eq!(free.malloc(0x1000).unwrap(), 0x1000);
        assert!(!free.is_free(0x1000));
        assert_eq!(free.malloc(0x1000).unwrap(), 0x8000);
    }

    #[test]
    fn test_malloc_exhausted() {
        let mut free = allocator(&[(0x1000, 0x2000)]);
        assert!(matches!(free.malloc(0x2000), Err(Error::OutOfGuestPhysical(0x2000))));
        assert!(free.malloc(0).is_err());
    }

    #[test]
    fn test_malloc_size_past_last_page() {
        let mut free = allocator(&[(0x1000, 0x2000)]);
        assert!(matches!(
            free.malloc(u64::MAX),
            Err(Error::OutOfGuestPhysical(u64::MAX))
        ));
        assert!(matches!(
            free.malloc(u64::MAX - 0xffe),
            Err(Error::OutOfGuestPhysical(_))
        ));
        assert_eq!(free.free_bytes(), 0x2000);
    }
}
