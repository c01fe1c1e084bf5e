//! Sandbox and package descriptions.
//!
//! These are the inputs handed to litterbox by the toolchain (a manifest) or by
//! the runtime (dynamic registration): packages with their sections, and
//! sandboxes with a memory view and a syscall filter.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::memory::VmAreas;

pub mod manifest;
pub mod syscalls;
pub mod view;

pub use manifest::{Manifest, PackageEntry, SandboxEntry};
pub use syscalls::SyscallMask;
pub use view::{parse_view, ViewEntry};

/// Package identifier assigned by the toolchain. Negative ids are reserved.
pub type PackageId = i64;

/// Sandbox identifier, as written in the sandbox declaration.
pub type SandboxId = String;

/// Sandbox id used for trusted code with a full view of the address space.
pub const TRUSTED_SANDBOX: &str = "-1";

/// Package grouping code that is never part of a sandbox footprint.
pub const TRUSTED_PACKAGE: &str = "non-bloat";

/// Id of the language runtime. Its memory is never tagged per package.
pub const RUNTIME_PACKAGE_ID: PackageId = 0;

/// Pseudo package id used for memory that has no owner yet.
pub const UNOWNED_PACKAGE_ID: PackageId = -1;

/// First id handed out to packages synthesized for sandbox entry functions.
pub const FIRST_FAKE_PACKAGE_ID: PackageId = -10;

/// Name prefix of the packages mapped into every sandbox (the enforcement code itself).
pub const COMMON_PREFIX: &str = "litterbox";

bitflags! {
    /// Access rights attached to a section, a view entry or an address range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct Prot: u8 {
        const X = 0x01;
        const W = 0x02;
        const R = 0x04;
        /// Separately managed range (the C heap).
        const S = 0x08;
        const SUPER = 0x10;
        const USER = 0x30;
        /// Pristine: the sandbox starts from a fresh copy of itself.
        const P = 0x40;
        const UNMAP = 0x80;
    }
}

impl Prot {
    /// Unmapped: the package is not visible.
    pub const U: Prot = Prot::empty();
    pub const RWX: Prot = Prot::R.union(Prot::W).union(Prot::X);
    /// Default rights of a package visible to a sandbox.
    pub const DEFAULT: Prot = Prot::RWX.union(Prot::USER);
    pub const HEAP: Prot = Prot::R.union(Prot::W).union(Prot::USER);

    pub fn is_readable(self) -> bool {
        self.contains(Prot::R)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Prot::W)
    }

    pub fn is_executable(self) -> bool {
        self.contains(Prot::X)
    }
}

impl fmt::Display for Prot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |p: Prot, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(Prot::R, 'r'),
            bit(Prot::W, 'w'),
            bit(Prot::X, 'x'),
            bit(Prot::USER, 'u')
        )
    }
}

impl Serialize for Prot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for Prot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Prot::from_bits_retain)
    }
}

/// A contiguous byte range with its rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub addr: u64,
    pub size: u64,
    pub prot: Prot,
}

impl Section {
    pub fn new(addr: u64, size: u64, prot: Prot) -> Self {
        Self { addr, size, prot }
    }
}

/// A unit of code and data that sandboxes grant or deny access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub id: PackageId,
    pub sections: Vec<Section>,
    /// Sections registered at run time (e.g. heap spans handed to the package).
    pub dynamic: Vec<Section>,
}

impl Package {
    pub fn new(name: impl Into<String>, id: PackageId) -> Self {
        Self {
            name: name.into(),
            id,
            sections: Vec::new(),
            dynamic: Vec::new(),
        }
    }

    /// Record a static section. Re-adding a section at the same address is a
    /// no-op as long as it describes the same range.
    pub fn add_section(&mut self, section: Section) -> Result<()> {
        if let Some(existing) = self.sections.iter().find(|s| s.addr == section.addr) {
            if existing.size != section.size || existing.prot != section.prot {
                return Err(Error::invariant(format!(
                    "package {}: conflicting sections at 0x{:x}",
                    self.name, section.addr
                )));
            }
            return Ok(());
        }
        self.sections.push(section);
        Ok(())
    }

    pub fn add_dynamic_section(&mut self, section: Section) {
        self.dynamic.push(section);
    }

    pub fn all_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().chain(self.dynamic.iter())
    }

    /// Whether `addr` lies inside one of the package's sections.
    pub fn contains(&self, addr: u64) -> bool {
        self.all_sections()
            .any(|s| s.addr <= addr && addr < s.addr.saturating_add(s.size))
    }
}

/// Declared policy of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDomain {
    pub id: SandboxId,
    /// Name of the function that enters the sandbox.
    pub func: String,
    pub sys: SyscallMask,
    /// Package name to granted rights.
    pub view: BTreeMap<String, Prot>,
    /// Packages the sandbox may touch, including the dependency closure.
    pub pkgs: Vec<String>,
    pub pristine: bool,
}

impl SandboxDomain {
    /// Build a domain from its two configuration strings.
    pub fn parse(id: impl Into<SandboxId>, memory: &str, syscalls: &str) -> Result<Self> {
        let (entries, pristine) = parse_view(memory)?;
        let sys = SyscallMask::parse(syscalls)?;
        let view: BTreeMap<String, Prot> = entries.into_iter().map(|e| (e.name, e.prot)).collect();
        Ok(Self {
            id: id.into(),
            func: String::new(),
            sys,
            pkgs: view.keys().cloned().collect(),
            view,
            pristine,
        })
    }

    pub fn is_trusted(&self) -> bool {
        self.id == TRUSTED_SANDBOX
    }

    /// Rights the sandbox has over a package it may touch.
    pub fn rights_for(&self, name: &str) -> Prot {
        match self.view.get(name) {
            Some(prot) => *prot | Prot::USER,
            None => Prot::DEFAULT,
        }
    }
}

/// Materialized policy of a live sandbox.
#[derive(Debug, Clone)]
pub struct SandboxMemory {
    /// Every range the sandbox may touch, with its rights.
    pub static_view: VmAreas,
    pub config: SandboxDomain,
    /// Package id to granted rights.
    pub view: BTreeMap<PackageId, Prot>,
    /// Set once the view is final: at load time for manifest sandboxes,
    /// on first entry for dynamically declared ones.
    pub entered: bool,
}

impl SandboxMemory {
    pub fn new(config: SandboxDomain) -> Self {
        Self {
            static_view: VmAreas::new(),
            config,
            view: BTreeMap::new(),
            entered: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prot_combinations() {
        assert_eq!(Prot::DEFAULT.bits(), 0x37);
        assert_eq!(Prot::HEAP.bits(), 0x36);
        assert!(Prot::USER.contains(Prot::SUPER));
        assert_eq!(Prot::U, Prot::empty());
        assert_eq!(Prot::HEAP.to_string(), "rw-u");
    }

    #[test]
    fn test_prot_serde_as_byte() {
        let json = serde_json::to_string(&Section::new(0x1000, 0x2000, Prot::R | Prot::X)).unwrap();
        assert_eq!(json, r#"{"addr":4096,"size":8192,"prot":5}"#);
        let back: Section = serde_json::from_str(&json).unwrap();
        assert_eq!(back.prot, Prot::R | Prot::X);
    }

    #[test]
    fn test_package_add_section_dedup() {
        let mut pkg = Package::new("main", 1);
        pkg.add_section(Section::new(0x1000, 0x1000, Prot::R)).unwrap();
        pkg.add_section(Section::new(0x1000, 0x1000, Prot::R)).unwrap();
        assert_eq!(pkg.sections.len(), 1);
        assert!(pkg.add_section(Section::new(0x1000, 0x2000, Prot::R)).is_err());
        assert!(pkg.contains(0x1fff));
        assert!(!pkg.contains(0x2000));
    }

    #[test]
    fn test_sandbox_domain_parse() {
        let sb = SandboxDomain::parse("sb1", "self:P, foo:R", "net").unwrap();
        assert!(sb.pristine);
        assert_eq!(sb.pkgs, vec!["foo".to_string()]);
        assert_eq!(sb.rights_for("foo"), Prot::R | Prot::USER);
        assert_eq!(sb.rights_for("bar"), Prot::DEFAULT);
        assert!(sb.sys.allows(libc::SYS_socket as u64));
        assert!(!sb.sys.allows(libc::SYS_open as u64));
    }
}
