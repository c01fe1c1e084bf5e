//! Builder for configuring and creating a [`Litterbox`] context.

use std::path::PathBuf;

use crate::backend::{self, BackendKind, BackendOptions};
use crate::config::Manifest;
use crate::error::{Error, Result};
use crate::memory::{is_page_aligned, RegionLayout};
use crate::registry::{NameResolution, Registry};
use crate::sandbox::Litterbox;

/// Where the initial packages and sandboxes come from.
#[derive(Debug, Clone)]
enum Source {
    Manifest(Manifest),
    Path(PathBuf),
}

/// Builder for creating a [`Litterbox`].
///
/// # Example
///
/// ```rust,no_run
/// use litterbox::{BackendKind, Litterbox};
///
/// let lb = Litterbox::builder()
///     .backend(BackendKind::Vtx)
///     .manifest_path("/path/to/app.manifest.json")
///     .build()?;
///
/// lb.prolog("parse")?;
/// // ... sandboxed call ...
/// lb.epilog("parse")?;
/// # Ok::<(), litterbox::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct LitterboxBuilder {
    backend: Option<BackendKind>,
    source: Option<Source>,
    resolution: Option<NameResolution>,
    aliases: Vec<(String, String)>,
    layout: Option<RegionLayout>,
    seal_arenas: Option<bool>,
    c_heap_headroom: Option<u64>,
}

impl LitterboxBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the enforcement backend.
    ///
    /// Default: read from `LITTERBOX_BACKEND`, SIM when unset.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    /// Load packages and sandboxes from an already parsed manifest.
    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.source = Some(Source::Manifest(manifest));
        self
    }

    /// Load packages and sandboxes from a JSON manifest file.
    pub fn manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(Source::Path(path.into()));
        self
    }

    /// How dependency names reported by the runtime match packages.
    ///
    /// Default: [`NameResolution::Exact`]
    pub fn resolution(mut self, resolution: NameResolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Resolve package name `name` as `target`.
    pub fn alias(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.push((name.into(), target.into()));
        self
    }

    /// Override where the managed heap lives.
    pub fn layout(mut self, layout: RegionLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Forbid new page-table arenas once initialized.
    ///
    /// Default: sealed for manifest-driven binaries, open otherwise since a
    /// dynamic runtime keeps declaring sandboxes after start-up.
    pub fn seal_arenas(mut self, seal: bool) -> Self {
        self.seal_arenas = Some(seal);
        self
    }

    /// Extra bytes reserved past the C heap.
    ///
    /// Default: read from `LITTERBOX_INC_HEAP`.
    pub fn c_heap_headroom(mut self, bytes: u64) -> Self {
        self.c_heap_headroom = Some(bytes);
        self
    }

    /// Build and initialize the context.
    pub fn build(self) -> Result<Litterbox> {
        let (registry, static_binary) = self.registry()?;
        let options = self.options(static_binary)?;

        let kind = match self.backend {
            Some(kind) => kind,
            None => BackendKind::from_env()?,
        };
        if !kind.is_available() {
            tracing::warn!(backend = %kind, "backend hardware not detected");
        }
        let backend = backend::create(kind, &options)?;

        let lb = Litterbox::new(registry, backend);
        lb.init()?;
        Ok(lb)
    }

    fn registry(&self) -> Result<(Registry, bool)> {
        let resolution = self.resolution.unwrap_or_default();
        let (mut registry, static_binary) = match &self.source {
            Some(Source::Manifest(manifest)) => (Registry::from_manifest(manifest, resolution)?, true),
            Some(Source::Path(path)) => {
                let manifest = Manifest::load(path)?;
                (Registry::from_manifest(&manifest, resolution)?, true)
            }
            None => (Registry::new(resolution), false),
        };
        for (name, target) in &self.aliases {
            registry = registry.with_alias(name.clone(), target.clone());
        }
        Ok((registry, static_binary))
    }

    fn options(&self, static_binary: bool) -> Result<BackendOptions> {
        let mut options = BackendOptions::from_env();
        if let Some(layout) = &self.layout {
            if !is_page_aligned(layout.heap_start) || !is_page_aligned(layout.heap_end) {
                return Err(Error::InvalidAddress(layout.heap_start));
            }
            if layout.heap_end <= layout.heap_start {
                return Err(Error::InvalidAddress(layout.heap_end));
            }
            options.layout = layout.clone();
        }
        options.seal_arenas = self.seal_arenas.unwrap_or(static_binary);
        if let Some(bytes) = self.c_heap_headroom {
            options.c_heap_headroom = bytes;
        }
        Ok(options)
    }
}
