//! Interval set of virtual memory areas.

use std::fmt;

use crate::config::{Package, Prot, Section};
use crate::error::{Error, Result};
use crate::memory::{is_page_aligned, layout, round_down, round_up};

/// A page-aligned range of virtual addresses with uniform rights.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmArea {
    pub start: u64,
    pub size: u64,
    pub prot: Prot,
}

impl VmArea {
    pub fn new(start: u64, size: u64, prot: Prot) -> Self {
        Self { start, size, prot }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end()
    }

    pub fn contains_area(&self, other: &VmArea) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }

    /// Overlap test. Contiguous areas do not intersect.
    pub fn intersects(&self, other: &VmArea) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn is_contiguous(&self, other: &VmArea) -> bool {
        self.end() == other.start || other.end() == self.start
    }

    /// Whether the area reaches past the directly-mappable guest-physical limit.
    pub fn exceeds_limit(&self) -> bool {
        self.end() > layout::ADDRESSABLE_LIMIT
    }

    /// Merge `other` into `self` if they touch and share rights.
    fn merge(&mut self, other: &VmArea) -> Result<bool> {
        if !self.intersects(other) && !self.is_contiguous(other) {
            return Ok(false);
        }
        if self.prot != other.prot {
            if self.intersects(other) {
                return Err(Error::invariant(format!(
                    "overlapping areas with different rights: {:?} and {:?}",
                    self, other
                )));
            }
            return Ok(false);
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        self.start = start;
        self.size = end - start;
        Ok(true)
    }
}

impl fmt::Debug for VmArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}-0x{:x} {}]", self.start, self.end(), self.prot)
    }
}

/// Area covering a section, with the page-rounded extent and user rights.
/// Empty sections, and sections running past the last page, have no area.
pub fn section_area(section: &Section) -> Option<VmArea> {
    if section.size == 0 {
        return None;
    }
    let start = round_down(section.addr);
    let end = round_up(section.addr.checked_add(section.size)?)?;
    Some(VmArea::new(start, end - start, section.prot | Prot::USER))
}

/// Areas of every section of a package, rights narrowed by `replace`.
pub fn package_areas(pkg: &Package, replace: Prot) -> Result<Vec<VmArea>> {
    let mut areas = Vec::with_capacity(pkg.sections.len() + pkg.dynamic.len());
    for section in &pkg.sections {
        if !is_page_aligned(section.addr) {
            return Err(Error::invariant(format!(
                "package {}: section at 0x{:x} is not page aligned",
                pkg.name, section.addr
            )));
        }
        if let Some(mut area) = section_area(section) {
            area.prot = (area.prot & replace) | Prot::USER;
            areas.push(area);
        }
    }
    for section in &pkg.dynamic {
        let mut area = section_area(section).ok_or_else(|| {
            Error::invariant(format!("package {}: empty dynamic section", pkg.name))
        })?;
        area.prot = (area.prot & replace) | Prot::USER;
        areas.push(area);
    }
    Ok(areas)
}

/// Sorted, non-overlapping, coalesced list of areas.
///
/// After every operation no two neighbours are contiguous (or overlapping)
/// with the same rights.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VmAreas {
    areas: Vec<VmArea>,
}

impl VmAreas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort and coalesce an arbitrary list of areas.
    pub fn from_areas(mut areas: Vec<VmArea>) -> Result<Self> {
        areas.retain(|a| a.size > 0);
        areas.sort_by_key(|a| a.start);
        let mut set = Self { areas };
        set.coalesce()?;
        Ok(set)
    }

    /// Areas of a whole package with its default rights.
    pub fn from_package(pkg: &Package) -> Result<Self> {
        Self::from_areas(package_areas(pkg, Prot::DEFAULT)?)
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VmArea> {
        self.areas.iter()
    }

    pub fn as_slice(&self) -> &[VmArea] {
        &self.areas
    }

    /// Total number of bytes covered.
    pub fn total_size(&self) -> u64 {
        self.areas.iter().map(|a| a.size).sum()
    }

    /// Area containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&VmArea> {
        let idx = self.areas.partition_point(|a| a.start <= addr);
        idx.checked_sub(1)
            .map(|i| &self.areas[i])
            .filter(|a| a.contains(addr))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.find(addr).is_some()
    }

    fn coalesce(&mut self) -> Result<()> {
        let mut i = 0;
        while i + 1 < self.areas.len() {
            let next = self.areas[i + 1];
            if self.areas[i].merge(&next)? {
                self.areas.remove(i + 1);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Insert an area in address order and coalesce.
    ///
    /// Overlapping an existing area with different rights is an invariant
    /// violation; use [`VmAreas::assign`] to change rights of a range.
    pub fn map(&mut self, area: VmArea) -> Result<()> {
        if area.size == 0 {
            return Ok(());
        }
        let idx = self.areas.partition_point(|a| a.start <= area.start);
        self.areas.insert(idx, area);
        self.coalesce()
    }

    pub fn map_area(&mut self, start: u64, size: u64, prot: Prot) -> Result<()> {
        self.map(VmArea::new(start, size, prot))
    }

    /// Map every area of `other` into `self`, consuming it.
    pub fn map_all(&mut self, other: VmAreas) -> Result<()> {
        for area in other.areas {
            self.map(area)?;
        }
        Ok(())
    }

    pub fn map_copy(&mut self, other: &VmAreas) -> Result<()> {
        self.map_all(other.clone())
    }

    /// Remove a range, truncating or splitting the areas it overlaps.
    pub fn unmap(&mut self, range: VmArea) {
        if range.size == 0 {
            return;
        }
        let (start, end) = (range.start, range.end());
        let mut i = 0;
        while i < self.areas.len() {
            let v = self.areas[i];
            if v.start >= end {
                break;
            }
            if !v.intersects(&range) {
                i += 1;
                continue;
            }
            if v.start >= start && v.end() <= end {
                // Fully covered.
                self.areas.remove(i);
                continue;
            }
            if v.start < start && v.end() <= end {
                // Left part survives.
                self.areas[i].size = start - v.start;
                i += 1;
                continue;
            }
            if v.start < start && v.end() > end {
                // Hole in the middle.
                self.areas[i].size = start - v.start;
                self.areas
                    .insert(i + 1, VmArea::new(end, v.end() - end, v.prot));
                break;
            }
            // Right part survives.
            self.areas[i] = VmArea::new(end, v.end() - end, v.prot);
            break;
        }
    }

    pub fn unmap_area(&mut self, other: &VmAreas) {
        for area in &other.areas {
            self.unmap(*area);
        }
    }

    /// Replace whatever covers the area's range with the area itself.
    pub fn assign(&mut self, area: VmArea) -> Result<()> {
        self.unmap(area);
        self.map(area)
    }

    /// Complement of the set below [`layout::ADDRESSABLE_LIMIT`].
    ///
    /// The complement areas carry no rights.
    pub fn mirror(&self) -> VmAreas {
        let mut mirror = VmAreas {
            areas: vec![VmArea::new(0, layout::ADDRESSABLE_LIMIT, Prot::empty())],
        };
        for area in self
            .areas
            .iter()
            .take_while(|a| a.start < layout::ADDRESSABLE_LIMIT)
        {
            mirror.unmap(*area);
        }
        mirror
    }

    /// Check ordering, overlap and coalescing.
    pub fn check_invariants(&self) -> Result<()> {
        for area in &self.areas {
            if area.size == 0 {
                return Err(Error::invariant(format!("empty area {:?}", area)));
            }
        }
        for pair in self.areas.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.end() > b.start {
                return Err(Error::invariant(format!("unordered areas {:?} {:?}", a, b)));
            }
            if a.end() == b.start && a.prot == b.prot {
                return Err(Error::invariant(format!("uncoalesced areas {:?} {:?}", a, b)));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for VmAreas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.areas.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a VmAreas {
    type Item = &'a VmArea;
    type IntoIter = std::slice::Iter<'a, VmArea>;

    fn into_iter(self) -> Self::IntoIter {
        self.areas.iter()
    }
}
