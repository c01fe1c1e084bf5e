//! Snapshot of the process address space from `/proc/self/maps`.

use crate::config::Prot;
use crate::error::{Error, Result};
use crate::memory::{VmArea, VmAreas};

const PROC_MAPS: &str = "/proc/self/maps";

/// Mappings that must never be mirrored into a guest view.
const SKIPPED: &[&str] = &["vsyscall", "anon_inode:kvm-vcpu"];

const C_HEAP_TAG: &str = "[heap]";

/// Every mapping of the process, plus the location of the C heap.
#[derive(Debug, Clone, Default)]
pub struct ProcessMaps {
    pub areas: Vec<VmArea>,
    /// The `brk` heap, including any reserved headroom.
    pub c_heap: Option<VmArea>,
}

fn parse_bounds(line: &str, field: &str) -> Result<(u64, u64)> {
    let malformed = || Error::invariant(format!("malformed maps entry: {}", line));
    let (start, end) = field.split_once('-').ok_or_else(malformed)?;
    let start = u64::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| malformed())?;
    if end < start {
        return Err(malformed());
    }
    Ok((start, end))
}

impl ProcessMaps {
    /// Parse the text of a maps file. `headroom` bytes are added to the C heap
    /// so that `brk` growth stays inside an already mapped range.
    pub fn parse(text: &str, headroom: u64) -> Result<Self> {
        let mut maps = ProcessMaps::default();
        for line in text.lines() {
            if line.is_empty() || SKIPPED.iter().any(|s| line.contains(s)) {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(Error::invariant(format!("incomplete maps entry: {}", line)));
            }
            let (start, end) = parse_bounds(line, fields[0])?;

            let mut rights = Prot::empty();
            for (c, bit) in [('r', Prot::R), ('w', Prot::W), ('x', Prot::X)] {
                if fields[1].contains(c) {
                    rights |= bit;
                }
            }

            let mut area = VmArea::new(start, end - start, rights | Prot::USER);
            if rights == Prot::R | Prot::W && line.contains(C_HEAP_TAG) {
                area.prot |= Prot::S;
                area.size += headroom;
                maps.c_heap = Some(area);
            }
            maps.areas.push(area);
        }
        Ok(maps)
    }

    /// Snapshot the running process.
    pub fn current(headroom: u64) -> Result<Self> {
        let text = std::fs::read_to_string(PROC_MAPS)?;
        Self::parse(&text, headroom)
    }

    /// Current bounds of the C heap, without headroom.
    pub fn current_c_heap() -> Result<Option<VmArea>> {
        let text = std::fs::read_to_string(PROC_MAPS)?;
        for line in text.lines().filter(|l| l.contains(C_HEAP_TAG)) {
            if let Some(field) = line.split_whitespace().next() {
                let (start, end) = parse_bounds(line, field)?;
                return Ok(Some(VmArea::new(start, end - start, Prot::empty())));
            }
        }
        Ok(None)
    }

    /// Sorted and coalesced view of the mappings.
    pub fn to_areas(&self) -> Result<VmAreas> {
        VmAreas::from_areas(self.areas.clone())
    }
}
