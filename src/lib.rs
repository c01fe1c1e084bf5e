//! # litterbox
//!
//! In-process sandboxing of packages. Each sandbox sees only the memory of
//! the packages it was granted and may only issue the system calls its
//! policy allows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use litterbox::{BackendKind, Litterbox, Result};
//!
//! fn main() -> Result<()> {
//!     let lb = Litterbox::builder()
//!         .backend(BackendKind::Vtx)
//!         .manifest_path("app.manifest.json")
//!         .build()?;
//!
//!     lb.prolog("parse")?;
//!     // code here only sees what sandbox "parse" was granted
//!     lb.epilog("parse")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - **VTX**: the process runs inside a KVM guest with one page-table view
//!   per sandbox (Linux x86-64)
//! - **MPK**: memory protection keys, one key per protection domain
//! - **SIM**: bookkeeping only, for hosts without either
//!
//! A language runtime drives the context through the C hooks in [`ffi`].

mod builder;
pub mod debug;
mod error;
mod sandbox;

pub mod backend;
pub mod config;
pub mod domains;
pub mod ffi;
pub mod memory;
pub mod registry;

// Re-exports
pub use backend::{BackendKind, Stats};
pub use builder::LitterboxBuilder;
pub use config::{Manifest, Prot, SyscallMask};
pub use error::{ConfigError, Error, Result};
pub use registry::{NameResolution, Registry};
pub use sandbox::{Litterbox, State};

/// Check if a hardware enforcement backend can run on this machine.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Get the name of the preferred hardware backend on this machine.
///
/// Returns `None` if neither VT-x nor protection keys are usable.
pub fn backend_name() -> Option<&'static str> {
    backend::name()
}
