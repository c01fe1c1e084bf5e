//! JSON manifest describing packages and sandboxes of a binary.
//!
//! ```json
//! {
//!   "packages": [{ "name": "main", "id": 1, "sections": [{ "addr": 4096, "size": 4096, "prot": 5 }] }],
//!   "sandboxes": [{ "id": "sb1", "memory": "self:P,fmt:R", "syscalls": "io", "packages": ["main"] }],
//!   "dependencies": { "main": ["fmt"] }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{PackageId, Section};
use crate::error::Result;

/// A package with its static sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub id: PackageId,
    #[serde(default)]
    pub sections: Vec<Section>,
}

/// A sandbox declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEntry {
    pub id: String,
    /// Symbol of the entry function.
    #[serde(default)]
    pub func: String,
    /// Code of the entry function, mapped into the sandbox as its own package.
    #[serde(default)]
    pub func_section: Option<Section>,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub syscalls: String,
    /// Packages the sandboxed code depends on.
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub sandboxes: Vec<SandboxEntry>,
    /// Package name to the names of the packages it imports.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
