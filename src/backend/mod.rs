//! Enforcement backends.
//!
//! This module defines the trait every backend implements and the logic to
//! select and create one. Hooks are called around every cross-sandbox call
//! boundary, possibly from several threads at once, so backends are shared
//! (`&self`) and synchronize internally.

use std::fmt;
use std::str::FromStr;

use crate::config::PackageId;
use crate::error::{Error, Result};
use crate::memory::{layout, RegionLayout};
use crate::registry::Registry;

pub mod mpk;
pub mod sim;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod kvm;

/// Sandbox id of the trusted host context, the target of `execute` when
/// leaving every sandbox.
pub const HOST: &str = "";

/// `execute` target that detaches the calling thread from the backend
/// entirely (used before `clone`).
pub const DETACH: &str = "detach";

/// Environment variable selecting the backend.
pub const BACKEND_ENV: &str = "LITTERBOX_BACKEND";

/// Environment variable requesting extra C-heap headroom.
pub const INC_HEAP_ENV: &str = "LITTERBOX_INC_HEAP";

/// Available enforcement mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Bookkeeping only, no isolation.
    #[default]
    Sim,
    /// Hardware virtualization: one page-table view per sandbox.
    Vtx,
    /// Memory protection keys.
    Mpk,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sim => "SIM",
            BackendKind::Vtx => "VTX",
            BackendKind::Mpk => "MPK",
        }
    }

    /// Read [`BACKEND_ENV`]. Unset or empty selects [`BackendKind::Sim`].
    pub fn from_env() -> Result<Self> {
        match std::env::var(BACKEND_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(BackendKind::Sim),
        }
    }

    /// Whether the hardware this backend needs is present.
    pub fn is_available(&self) -> bool {
        match self {
            BackendKind::Sim => true,
            BackendKind::Mpk => mpk::is_available(),
            BackendKind::Vtx => {
                #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
                {
                    kvm::is_available()
                }

                #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
                {
                    false
                }
            }
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "SIM" => Ok(BackendKind::Sim),
            "VTX" => Ok(BackendKind::Vtx),
            "MPK" => Ok(BackendKind::Mpk),
            _ => Err(Error::InvalidBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings shared by every backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub layout: RegionLayout,
    /// Forbid page-table arenas after initialization.
    pub seal_arenas: bool,
    /// Extra bytes reserved past the C heap.
    pub c_heap_headroom: u64,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            layout: RegionLayout::default(),
            seal_arenas: true,
            c_heap_headroom: 0,
        }
    }
}

impl BackendOptions {
    /// Defaults adjusted by [`INC_HEAP_ENV`].
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if std::env::var_os(INC_HEAP_ENV).is_some() {
            options.c_heap_headroom = layout::C_HEAP_HEADROOM;
        }
        options
    }
}

/// Transition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Sandbox entries.
    pub entries: u64,
    /// Voluntary returns to the host.
    pub exits: u64,
    /// Involuntary returns: syscalls serviced for a guest, or returns to the
    /// trusted domain from inside a sandbox.
    pub escapes: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} exits={} escapes={}",
            self.entries, self.exits, self.escapes
        )
    }
}

/// Trait that all enforcement backends implement.
///
/// The registry is passed to every hook that needs package or sandbox
/// tables; backends keep only what they derive from it.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Build enforcement state for every sandbox known at start-up.
    fn init(&self, registry: &Registry) -> Result<()>;

    /// A sandbox was completed after [`init`](Self::init).
    fn add_sandbox(&self, registry: &Registry, id: &str) -> Result<()>;

    /// Enter sandbox `id` on the calling thread.
    fn prolog(&self, id: &str) -> Result<()>;

    /// Leave sandbox `id` on the calling thread.
    fn epilog(&self, id: &str) -> Result<()>;

    /// Switch the calling thread to `id`, [`HOST`] or [`DETACH`].
    fn execute(&self, id: &str) -> Result<()>;

    /// Memory `[start, start + size)` now belongs to package `id`.
    fn register(&self, registry: &Registry, id: PackageId, start: u64, size: u64) -> Result<()>;

    /// Memory moves from package `old` to package `new`.
    fn transfer(
        &self,
        registry: &Registry,
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()>;

    /// The process address space grew by `[start, start + size)`.
    fn runtime_growth(
        &self,
        registry: &Registry,
        heap: bool,
        id: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()>;

    fn stats(&self) -> Stats;

    fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// Check if any hardware backend can run on this machine.
pub fn is_available() -> bool {
    BackendKind::Vtx.is_available() || BackendKind::Mpk.is_available()
}

/// Name of the preferred hardware backend on this machine.
pub fn name() -> Option<&'static str> {
    [BackendKind::Vtx, BackendKind::Mpk]
        .into_iter()
        .find(BackendKind::is_available)
        .map(|k| k.name())
}

/// Create a backend of the given kind.
pub fn create(kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Sim => Ok(Box::new(sim::SimBackend::new())),
        BackendKind::Mpk => {
            mpk::MpkBackend::new(mpk::HardwareKeys).map(|b| Box::new(b) as Box<dyn Backend>)
        }
        BackendKind::Vtx => {
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            {
                kvm::VtxBackend::new(options.clone()).map(|b| Box::new(b) as Box<dyn Backend>)
            }

            #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
            {
                let _ = options;
                Err(Error::HypervisorNotAvailable)
            }
        }
    }
}
