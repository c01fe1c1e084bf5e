//! Packages, sandboxes and the relations between them.
//!
//! The registry is filled once from a [`Manifest`] (static binaries) or
//! incrementally by the language runtime (dynamic registration). A sandbox
//! becomes usable once its view has been materialized into a
//! [`SandboxMemory`]: static sandboxes at load time, dynamic ones on first
//! entry.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::view::unquote;
use crate::config::{
    Manifest, Package, PackageId, Prot, SandboxDomain, SandboxId, SandboxMemory, Section,
    COMMON_PREFIX, FIRST_FAKE_PACKAGE_ID, TRUSTED_PACKAGE,
};
use crate::domains::{self, DomainAssignment};
use crate::error::{Error, Result};
use crate::memory::{package_areas, section_area, VmArea, VmAreas};

/// How dependency names reported by the runtime map to registered packages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NameResolution {
    /// Names must match a registered package exactly.
    #[default]
    Exact,
    /// A short name `b` also matches the unique package named `<prefix>.b`.
    Suffix,
}

/// Rights of every package reachable from `roots` through `deps`.
///
/// Packages named in `declared` get their declared rights, every other
/// reachable package gets [`Prot::DEFAULT`].
pub fn compute_memory_view(
    roots: &[String],
    deps: &BTreeMap<String, Vec<String>>,
    declared: &BTreeMap<String, Prot>,
) -> BTreeMap<String, Prot> {
    let mut result = BTreeMap::new();
    let mut queue: VecDeque<&String> = roots.iter().chain(declared.keys()).collect();
    while let Some(current) = queue.pop_front() {
        if result.contains_key(current) {
            continue;
        }
        if let Some(next) = deps.get(current) {
            queue.extend(next.iter());
        }
        let prot = declared
            .get(current)
            .map_or(Prot::DEFAULT, |p| *p | Prot::USER);
        result.insert(current.clone(), prot);
    }
    result
}

#[derive(Debug)]
pub struct Registry {
    packages: BTreeMap<PackageId, Package>,
    names: BTreeMap<String, PackageId>,
    sandboxes: BTreeMap<SandboxId, SandboxMemory>,
    /// Entry function of each sandbox.
    entry_points: BTreeMap<SandboxId, VmArea>,
    /// Sandboxes that may touch each package.
    pkg_deps: BTreeMap<PackageId, Vec<SandboxId>>,
    /// Package name to the names it imports.
    dependencies: BTreeMap<String, Vec<String>>,
    /// Dynamic sandboxes: names of the packages they call into.
    sandbox_deps: BTreeMap<SandboxId, Vec<String>>,
    /// Ranges mapped into every untrusted sandbox.
    common: VmAreas,
    /// Ranges owned by no package.
    trusted: VmAreas,
    /// Executable sections sorted by address.
    pc_map: Vec<(VmArea, PackageId)>,
    next_fake: PackageId,
    next_pristine: AtomicI64,
    resolution: NameResolution,
    aliases: BTreeMap<String, String>,
    domains: DomainAssignment<Prot>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(NameResolution::default())
    }
}

impl Registry {
    pub fn new(resolution: NameResolution) -> Self {
        Self {
            packages: BTreeMap::new(),
            names: BTreeMap::new(),
            sandboxes: BTreeMap::new(),
            entry_points: BTreeMap::new(),
            pkg_deps: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            sandbox_deps: BTreeMap::new(),
            common: VmAreas::new(),
            trusted: VmAreas::new(),
            pc_map: Vec::new(),
            next_fake: FIRST_FAKE_PACKAGE_ID,
            next_pristine: AtomicI64::new(1),
            resolution,
            aliases: BTreeMap::new(),
            domains: DomainAssignment::default(),
        }
    }

    /// Resolve `name` as `target` before any other lookup.
    pub fn with_alias(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.insert(name.into(), target.into());
        self
    }

    /// Load every package and sandbox of a manifest.
    pub fn from_manifest(manifest: &Manifest, resolution: NameResolution) -> Result<Self> {
        let mut registry = Self::new(resolution);
        registry.load_packages(manifest)?;
        registry.dependencies = manifest.dependencies.clone();
        registry.load_sandboxes(manifest)?;
        registry.update_trusted()?;
        registry.rebuild_pc_map();
        registry.recompute_domains();
        tracing::debug!(
            packages = registry.packages.len(),
            sandboxes = registry.sandboxes.len(),
            domains = registry.domains.len(),
            "registry loaded"
        );
        Ok(registry)
    }

    fn insert_package(&mut self, pkg: Package) -> Result<()> {
        if self.names.contains_key(&pkg.name) || self.packages.contains_key(&pkg.id) {
            return Err(Error::DuplicatePackage {
                name: pkg.name,
                id: pkg.id,
            });
        }
        self.names.insert(pkg.name.clone(), pkg.id);
        self.packages.insert(pkg.id, pkg);
        Ok(())
    }

    fn load_packages(&mut self, manifest: &Manifest) -> Result<()> {
        let mut max_id = 0;
        for entry in &manifest.packages {
            let mut pkg = Package::new(entry.name.clone(), entry.id);
            for section in &entry.sections {
                pkg.add_section(*section)?;
            }
            max_id = max_id.max(entry.id);

            if pkg.name == TRUSTED_PACKAGE {
                for area in pkg.sections.iter().filter_map(section_area) {
                    self.trusted.map(area)?;
                }
            }
            if pkg.name.starts_with(COMMON_PREFIX) {
                self.common.map_all(VmAreas::from_package(&pkg)?)?;
            }
            self.insert_package(pkg)?;
        }
        self.next_pristine.store(max_id + 1, Ordering::Relaxed);
        Ok(())
    }

    fn load_sandboxes(&mut self, manifest: &Manifest) -> Result<()> {
        for entry in &manifest.sandboxes {
            let id = unquote(&entry.id).to_string();
            if self.sandboxes.contains_key(&id) {
                return Err(Error::DuplicateSandbox(id));
            }
            let mut config = SandboxDomain::parse(id.clone(), &entry.memory, &entry.syscalls)?;
            config.view = self.resolve_declared(&config.view)?;
            config.func = entry.func.clone();
            config.pkgs = entry.packages.clone();

            if let (false, Some(section)) = (config.is_trusted(), entry.func_section) {
                let name = self.create_entry_package(&id, &entry.func, section)?;
                config.pkgs.push(name);
            }

            self.sandboxes.insert(id.clone(), SandboxMemory::new(config));
            self.materialize(&id, true)?;
            if let Some(sandbox) = self.sandboxes.get_mut(&id) {
                sandbox.entered = true;
            }
        }
        Ok(())
    }

    /// Synthesize a package holding a sandbox's entry function.
    fn create_entry_package(&mut self, id: &str, func: &str, section: Section) -> Result<String> {
        let name = if func.is_empty() {
            format!("sandbox.{}", id)
        } else {
            func.to_string()
        };
        let mut pkg = Package::new(name.clone(), self.next_fake);
        let section = Section::new(section.addr, section.size, Prot::R | Prot::X | Prot::USER);
        let area = section_area(&section)
            .ok_or_else(|| Error::invariant(format!("sandbox {}: empty entry function", id)))?;
        pkg.add_section(Section::new(area.start, area.size, area.prot))?;
        self.insert_package(pkg)?;
        self.entry_points.insert(id.to_string(), area);
        self.next_fake -= 1;
        Ok(name)
    }

    /// Key a declared view by full package names. Unknown names are kept as
    /// declared for [`materialize`](Self::materialize) to report or skip.
    /// Two names of one package keep the rights both allow.
    fn resolve_declared(&self, view: &BTreeMap<String, Prot>) -> Result<BTreeMap<String, Prot>> {
        let mut declared: BTreeMap<String, Prot> = BTreeMap::new();
        for (name, prot) in view {
            let full = match self.resolve(name) {
                Ok(full) => full,
                Err(Error::UnknownPackage(_)) => name.clone(),
                Err(e) => return Err(e),
            };
            declared
                .entry(full)
                .and_modify(|p| *p &= *prot)
                .or_insert(*prot);
        }
        Ok(declared)
    }

    /// Turn a sandbox's declared policy into package rights and address ranges.
    /// Unknown packages are an error when `strict`, and skipped otherwise.
    fn materialize(&mut self, id: &str, strict: bool) -> Result<()> {
        let sandbox = self
            .sandboxes
            .get(id)
            .ok_or_else(|| Error::UnknownSandbox(id.to_string()))?;
        let closure =
            compute_memory_view(&sandbox.config.pkgs, &self.dependencies, &sandbox.config.view);
        // Declared rights win over any other name reaching the same package.
        let declared: BTreeMap<PackageId, Prot> = sandbox
            .config
            .view
            .iter()
            .filter_map(|(name, prot)| self.names.get(name).map(|id| (*id, *prot | Prot::USER)))
            .collect();

        let mut view = BTreeMap::new();
        let mut areas = Vec::new();
        for (name, prot) in &closure {
            let pkg_id = match self.resolve(name) {
                Ok(resolved) => self.names[&resolved],
                Err(Error::UnknownPackage(_)) if sandbox.config.is_trusted() => continue,
                Err(Error::UnknownPackage(name)) if !strict => {
                    crate::debug_domains!("sandbox {}: skipping unknown package {}", id, name);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if view.contains_key(&pkg_id) {
                continue;
            }
            let prot = declared.get(&pkg_id).copied().unwrap_or(*prot);
            view.insert(pkg_id, prot);
            areas.extend(package_areas(&self.packages[&pkg_id], prot)?);
        }

        let mut static_view = VmAreas::from_areas(areas)?;
        if !sandbox.config.is_trusted() {
            static_view.map_copy(&self.common)?;
        }
        crate::debug_domains!("sandbox {} view {:?}", id, view);

        for pkg_id in view.keys() {
            let users = self.pkg_deps.entry(*pkg_id).or_default();
            if !users.iter().any(|s| s == id) {
                users.push(id.to_string());
            }
        }
        if let Some(sandbox) = self.sandboxes.get_mut(id) {
            sandbox.config.pkgs = closure.keys().cloned().collect();
            sandbox.view = view;
            sandbox.static_view = static_view;
        }
        Ok(())
    }

    /// Ranges of the trusted package: everything no other package claims.
    fn update_trusted(&mut self) -> Result<()> {
        self.trusted.unmap_area(&self.common);
        for area in self.entry_points.values() {
            self.trusted.unmap(*area);
        }
        for pkg in self.packages.values().filter(|p| p.name != TRUSTED_PACKAGE) {
            self.trusted.unmap_area(&VmAreas::from_package(pkg)?);
        }
        if let Some(id) = self.names.get(TRUSTED_PACKAGE) {
            if let Some(pkg) = self.packages.get_mut(id) {
                pkg.sections = self
                    .trusted
                    .iter()
                    .map(|a| Section::new(a.start, a.size, a.prot))
                    .collect();
            }
        }
        Ok(())
    }

    fn rebuild_pc_map(&mut self) {
        self.pc_map = self
            .packages
            .values()
            .flat_map(|p| p.sections.iter().map(move |s| (s, p.id)))
            .filter(|(s, _)| s.prot.contains(Prot::X))
            .filter_map(|(s, id)| section_area(s).map(|a| (a, id)))
            .collect();
        self.pc_map.sort_by_key(|(a, _)| a.start);
    }

    fn recompute_domains(&mut self) {
        let views: BTreeMap<SandboxId, BTreeMap<PackageId, Prot>> = self
            .sandboxes
            .iter()
            .map(|(id, sb)| (id.clone(), sb.view.clone()))
            .collect();
        self.domains = domains::assign(&views, self.packages.keys().copied());
    }

    /// Full name of a package given a name reported by the runtime.
    pub fn resolve(&self, name: &str) -> Result<String> {
        let name = self.aliases.get(name).map_or(name, String::as_str);
        if self.names.contains_key(name) {
            return Ok(name.to_string());
        }
        if self.resolution == NameResolution::Exact {
            return Err(Error::UnknownPackage(name.to_string()));
        }
        let suffix = format!(".{}", name);
        let candidates: Vec<String> = self
            .names
            .keys()
            .filter(|n| n.ends_with(&suffix))
            .cloned()
            .collect();
        match candidates.len() {
            0 => Err(Error::UnknownPackage(name.to_string())),
            1 => Ok(candidates[0].clone()),
            _ => Err(Error::AmbiguousName {
                name: name.to_string(),
                candidates,
            }),
        }
    }

    /// Register (or rename) a package reported by the runtime.
    pub fn register_package(&mut self, name: &str, id: PackageId) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invariant("package registered without a name"));
        }
        if let Some(existing) = self.names.get(name) {
            if *existing == id {
                return Ok(());
            }
            return Err(Error::DuplicatePackage {
                name: name.to_string(),
                id,
            });
        }
        match self.packages.get_mut(&id) {
            // Nested modules share the id of their parent, the latest name wins.
            Some(pkg) => {
                pkg.name = name.to_string();
                self.names.insert(name.to_string(), id);
            }
            None => self.insert_package(Package::new(name, id))?,
        }
        Ok(())
    }

    pub fn add_dependency(&mut self, current: &str, dependency: &str) -> Result<()> {
        if current.is_empty() || dependency.is_empty() {
            return Err(Error::invariant("dependency edge with an empty name"));
        }
        let deps = self.dependencies.entry(current.to_string()).or_default();
        if !deps.iter().any(|d| d == dependency) {
            deps.push(dependency.to_string());
        }
        Ok(())
    }

    /// Declare a sandbox. Re-declaring an existing sandbox is a no-op.
    pub fn register_sandbox(&mut self, id: &str, memory: &str, syscalls: &str) -> Result<()> {
        let config = SandboxDomain::parse(unquote(id), memory, syscalls)?;
        if self.sandboxes.contains_key(&config.id) {
            return Ok(());
        }
        self.sandboxes
            .insert(config.id.clone(), SandboxMemory::new(config));
        Ok(())
    }

    pub fn register_sandbox_dependency(&mut self, id: &str, pkg: &str) -> Result<()> {
        if !self.sandboxes.contains_key(id) {
            return Err(Error::UnknownSandbox(id.to_string()));
        }
        self.sandbox_deps
            .entry(id.to_string())
            .or_default()
            .push(pkg.to_string());
        Ok(())
    }

    /// Record a heap span handed to a package at run time.
    pub fn add_section(&mut self, id: PackageId, start: u64, size: u64) -> Result<()> {
        let pkg = self
            .packages
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownPackage(id.to_string()))?;
        pkg.add_dynamic_section(Section::new(start, size, Prot::HEAP));
        Ok(())
    }

    /// Every `a` depends on its submodules `a.b`.
    fn add_submodule_dependencies(&mut self) {
        let names: BTreeSet<String> = self
            .names
            .keys()
            .chain(self.dependencies.keys())
            .cloned()
            .collect();
        for parent in &names {
            let prefix = format!("{}.", parent);
            for child in names.range(prefix.clone()..).take_while(|n| n.starts_with(&prefix)) {
                let deps = self.dependencies.entry(parent.clone()).or_default();
                if !deps.contains(child) {
                    deps.push(child.clone());
                }
            }
        }
    }

    /// Complete a dynamically declared sandbox on its first entry. Returns
    /// true when this call did the work.
    pub fn complete_sandbox(&mut self, id: &str) -> Result<bool> {
        let sandbox = self
            .sandboxes
            .get(id)
            .ok_or_else(|| Error::UnknownSandbox(id.to_string()))?;
        if sandbox.entered {
            return Ok(false);
        }

        let declared = self.resolve_declared(&sandbox.config.view)?;
        let mut roots = Vec::new();
        for dep in self.sandbox_deps.get(id).into_iter().flatten() {
            match self.resolve(dep) {
                Ok(full) => roots.push(full),
                Err(Error::UnknownPackage(_)) => {
                    crate::debug_domains!("sandbox {}: dropping unknown dependency {}", id, dep)
                }
                Err(e) => return Err(e),
            }
        }
        self.add_submodule_dependencies();

        if let Some(sandbox) = self.sandboxes.get_mut(id) {
            sandbox.config.view = declared;
            sandbox.config.pkgs = roots;
        }
        self.materialize(id, false)?;
        if let Some(sandbox) = self.sandboxes.get_mut(id) {
            sandbox.entered = true;
        }
        self.recompute_domains();
        Ok(true)
    }

    /// Package whose code contains `pc`.
    pub fn package_at(&self, pc: u64) -> Option<PackageId> {
        let idx = self.pc_map.partition_point(|(a, _)| a.start <= pc);
        idx.checked_sub(1)
            .map(|i| self.pc_map[i])
            .filter(|(a, _)| a.contains(pc))
            .map(|(_, id)| id)
    }

    /// A fresh sandbox id for a pristine copy of `id`, with its numeric part.
    pub fn pristine_id(&self, id: &str) -> (SandboxId, i64) {
        let n = self.next_pristine.fetch_add(1, Ordering::Relaxed) + 1;
        (format!("p:{}:{}", n, id), n)
    }

    pub fn package(&self, id: PackageId) -> Option<&Package> {
        self.packages.get(&id)
    }

    pub fn package_by_name(&self, name: &str) -> Option<&Package> {
        self.names.get(name).and_then(|id| self.packages.get(id))
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub fn sandbox(&self, id: &str) -> Option<&SandboxMemory> {
        self.sandboxes.get(id)
    }

    pub fn sandboxes(&self) -> impl Iterator<Item = &SandboxMemory> {
        self.sandboxes.values()
    }

    pub fn is_pristine(&self, id: &str) -> bool {
        self.sandboxes.get(id).map_or(false, |s| s.config.pristine)
    }

    /// Sandboxes whose view includes package `id`.
    pub fn pkg_deps(&self, id: PackageId) -> &[SandboxId] {
        self.pkg_deps.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn entry_point(&self, id: &str) -> Option<&VmArea> {
        self.entry_points.get(id)
    }

    pub fn common(&self) -> &VmAreas {
        &self.common
    }

    pub fn trusted(&self) -> &VmAreas {
        &self.trusted
    }

    pub fn domains(&self) -> &DomainAssignment<Prot> {
        &self.domains
    }

    pub fn resolution(&self) -> NameResolution {
        self.resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RX: Prot = Prot::R.union(Prot::X).union(Prot::USER);
    const RO: Prot = Prot::R.union(Prot::USER);

    const MANIFEST: &str = r#"{
        "packages": [
            {"name": "main", "id": 1, "sections": [{"addr": 4194304, "size": 8192, "prot": 5}]},
            {"name": "fmt", "id": 2, "sections": [
                {"addr": 5242880, "size": 4096, "prot": 5},
                {"addr": 5308416, "size": 4096, "prot": 6}
            ]},
            {"name": "secret", "id": 3, "sections": [{"addr": 6291456, "size": 4096, "prot": 6}]},
            {"name": "litterbox", "id": 4, "sections": [{"addr": 7340032, "size": 4096, "prot": 5}]},
            {"name": "non-bloat", "id": 5, "sections": [{"addr": 3145728, "size": 5242880, "prot": 5}]}
        ],
        "sandboxes": [
            {"id": "\"sb1\"", "func": "main.sandboxed", "memory": "fmt:R",
             "func_section": {"addr": 4521984, "size": 256, "prot": 5},
             "syscalls": "io", "packages": ["main"]},
            {"id": "sb2", "memory": "secret:RW", "syscalls": ""}
        ],
        "dependencies": {"main": ["fmt"]}
    }"#;

    fn registry() -> Registry {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        Registry::from_manifest(&manifest, NameResolution::Exact).unwrap()
    }

    #[test]
    fn test_compute_memory_view() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), vec!["b".to_string(), "c".to_string()]);
        deps.insert("c".to_string(), vec!["a".to_string(), "d".to_string()]);
        let mut declared = BTreeMap::new();
        declared.insert("c".to_string(), Prot::R);
        declared.insert("e".to_string(), Prot::U);

        let view = compute_memory_view(&["a".to_string()], &deps, &declared);
        let expected: BTreeMap<String, Prot> = [
            ("a", Prot::DEFAULT),
            ("b", Prot::DEFAULT),
            ("c", RO),
            ("d", Prot::DEFAULT),
            ("e", Prot::USER),
        ]
        .into_iter()
        .map(|(n, p)| (n.to_string(), p))
        .collect();
        assert_eq!(view, expected);
    }

    #[test]
    fn test_static_view() {
        let reg = registry();
        let sb1 = reg.sandbox("sb1").unwrap();
        let expected: BTreeMap<PackageId, Prot> =
            [(-10, Prot::DEFAULT), (1, Prot::DEFAULT), (2, RO)].into_iter().collect();
        assert_eq!(sb1.view, expected);
        assert_eq!(sb1.config.func, "main.sandboxed");

        let areas = &sb1.static_view;
        assert_eq!(areas.find(0x40_1000).unwrap().prot, RX);
        assert_eq!(areas.find(0x45_0000).unwrap().prot, RX);
        assert_eq!(areas.find(0x50_0000).unwrap().prot, RO);
        assert_eq!(areas.find(0x51_0000).unwrap().prot, RO);
        assert!(!areas.contains(0x60_0000));
        // Common packages are visible everywhere.
        assert!(areas.contains(0x70_0000));
        assert!(areas.check_invariants().is_ok());

        let sb2 = reg.sandbox("sb2").unwrap();
        assert_eq!(sb2.static_view.find(0x60_0000).unwrap().prot, Prot::HEAP);
        assert!(sb2.config.sys.is_all());
    }

    #[test]
    fn test_package_dependencies() {
        let reg = registry();
        assert_eq!(reg.pkg_deps(1), &["sb1".to_string()]);
        assert_eq!(reg.pkg_deps(3), &["sb2".to_string()]);
        assert!(reg.pkg_deps(4).is_empty());
        assert_eq!(reg.package(-10).unwrap().name, "main.sandboxed");
        assert_eq!(reg.entry_point("sb1").unwrap().start, 0x45_0000);
    }

    #[test]
    fn test_trusted_space() {
        let reg = registry();
        let trusted = reg.trusted();
        assert!(trusted.contains(0x30_0000));
        assert!(trusted.contains(0x40_2000));
        assert!(!trusted.contains(0x40_0000));
        assert!(!trusted.contains(0x45_0000));
        assert!(!trusted.contains(0x70_0000));
        let pkg = reg.package_by_name(TRUSTED_PACKAGE).unwrap();
        assert_eq!(pkg.sections.len(), trusted.len());
    }

    #[test]
    fn test_package_at() {
        let reg = registry();
        assert_eq!(reg.package_at(0x40_0100), Some(1));
        assert_eq!(reg.package_at(0x45_0010), Some(-10));
        assert_eq!(reg.package_at(0x50_0800), Some(2));
        assert_eq!(reg.package_at(0x51_0000), None);
        assert_eq!(reg.package_at(0x30_0000), Some(5));
        assert_eq!(reg.package_at(0x1000), None);
    }

    #[test]
    fn test_domains_from_views() {
        let reg = registry();
        let domains = reg.domains();
        assert_eq!(domains.domain_of(1), Some(-10));
        assert_eq!(domains.domain_of(-10), Some(-10));
        assert_eq!(domains.domain_of(2), Some(2));
        assert_eq!(domains.unowned(), &[4, 5]);
    }

    #[test]
    fn test_pristine_ids() {
        let reg = registry();
        assert_eq!(reg.pristine_id("sb1"), ("p:7:sb1".to_string(), 7));
        assert_eq!(reg.pristine_id("sb1").1, 8);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.packages[1].id = 1;
        assert!(matches!(
            Registry::from_manifest(&manifest, NameResolution::Exact),
            Err(Error::DuplicatePackage { .. })
        ));

        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.sandboxes[1].id = "sb1".into();
        assert!(matches!(
            Registry::from_manifest(&manifest, NameResolution::Exact),
            Err(Error::DuplicateSandbox(_))
        ));

        let mut manifest = Manifest::from_json(MANIFEST).unwrap();
        manifest.sandboxes[1].memory = "secret:Q".into();
        assert!(matches!(
            Registry::from_manifest(&manifest, NameResolution::Exact),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_name_resolution() {
        let mut reg = Registry::new(NameResolution::Suffix).with_alias("os.path", "posixpath");
        reg.register_package("posixpath", 20).unwrap();
        reg.register_package("x.util", 21).unwrap();
        reg.register_package("y.util", 22).unwrap();
        reg.register_package("lib.json", 23).unwrap();

        assert_eq!(reg.resolve("json").unwrap(), "lib.json");
        assert_eq!(reg.resolve("os.path").unwrap(), "posixpath");
        assert!(matches!(reg.resolve("util"), Err(Error::AmbiguousName { .. })));
        assert!(matches!(reg.resolve("yaml"), Err(Error::UnknownPackage(_))));

        let exact = Registry::new(NameResolution::Exact);
        assert!(exact.resolve("json").is_err());
    }

    #[test]
    fn test_register_package_rules() {
        let mut reg = Registry::default();
        reg.register_package("a", 1).unwrap();
        reg.register_package("a", 1).unwrap();
        assert!(reg.register_package("a", 2).is_err());
        reg.register_package("a.inner", 1).unwrap();
        assert_eq!(reg.package(1).unwrap().name, "a.inner");
        assert!(reg.register_package("", 3).is_err());
    }

    #[test]
    fn test_dynamic_sandbox_completion() {
        let mut reg = Registry::new(NameResolution::Suffix);
        reg.register_package("app", 1).unwrap();
        reg.register_package("lib.json", 2).unwrap();
        reg.register_package("lib.secret", 3).unwrap();
        reg.add_dependency("app", "lib.json").unwrap();
        reg.register_sandbox("sb", "json:R", "").unwrap();
        reg.register_sandbox("sb", "other:R", "net").unwrap();
        reg.register_sandbox_dependency("sb", "app").unwrap();
        reg.register_sandbox_dependency("sb", "missing").unwrap();
        reg.add_section(1, 0x40_0000, 0x1000).unwrap();
        assert!(reg.add_section(9, 0x40_0000, 0x1000).is_err());
        assert!(reg.register_sandbox_dependency("nope", "app").is_err());

        assert!(!reg.sandbox("sb").unwrap().entered);
        assert!(reg.complete_sandbox("sb").unwrap());
        assert!(!reg.complete_sandbox("sb").unwrap());

        let sb = reg.sandbox("sb").unwrap();
        assert!(sb.entered);
        let expected: BTreeMap<PackageId, Prot> =
            [(1, Prot::DEFAULT), (2, RO)].into_iter().collect();
        assert_eq!(sb.view, expected);
        assert_eq!(sb.static_view.find(0x40_0000).unwrap().prot, Prot::HEAP);
        assert_eq!(reg.pkg_deps(1), &["sb".to_string()]);
        assert!(reg.pkg_deps(3).is_empty());
        assert_eq!(reg.domains().domain_of(2), Some(2));
        assert!(matches!(reg.complete_sandbox("x"), Err(Error::UnknownSandbox(_))));
    }

    #[test]
    fn test_declared_rights_win_over_dependency_name() {
        let manifest = Manifest::from_json(
            r#"{
                "packages": [
                    {"name": "main", "id": 1, "sections": [{"addr": 4194304, "size": 4096, "prot": 5}]},
                    {"name": "a.encoding", "id": 2, "sections": [{"addr": 5242880, "size": 4096, "prot": 6}]}
                ],
                "sandboxes": [{"id": "sb", "memory": "encoding:R", "packages": ["main"]}],
                "dependencies": {"main": ["encoding"]}
            }"#,
        )
        .unwrap();
        let reg = Registry::from_manifest(&manifest, NameResolution::Suffix).unwrap();
        let sb = reg.sandbox("sb").unwrap();
        assert_eq!(sb.view[&2], RO);
        assert_eq!(sb.static_view.find(0x50_0000).unwrap().prot, RO);
        assert!(!sb.static_view.find(0x50_0000).unwrap().prot.contains(Prot::W));
    }

    #[test]
    fn test_ambiguous_declared_name() {
        let mut reg = Registry::new(NameResolution::Suffix);
        reg.register_package("x.json", 1).unwrap();
        reg.register_package("y.json", 2).unwrap();
        reg.register_sandbox("sb", "json:R", "").unwrap();
        assert!(matches!(
            reg.complete_sandbox("sb"),
            Err(Error::AmbiguousName { .. })
        ));
        assert!(!reg.sandbox("sb").unwrap().entered);

        let manifest = Manifest::from_json(
            r#"{
                "packages": [{"name": "x.json", "id": 1}, {"name": "y.json", "id": 2}],
                "sandboxes": [{"id": "sb", "memory": "json:R"}]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            Registry::from_manifest(&manifest, NameResolution::Suffix),
            Err(Error::AmbiguousName { .. })
        ));
    }

    #[test]
    fn test_unknown_declared_name_skipped_when_dynamic() {
        let mut reg = Registry::new(NameResolution::Suffix);
        reg.register_package("lib.json", 1).unwrap();
        reg.register_sandbox("sb", "json:R,yaml:R", "").unwrap();
        assert!(reg.complete_sandbox("sb").unwrap());
        let expected: BTreeMap<PackageId, Prot> = [(1, RO)].into_iter().collect();
        assert_eq!(reg.sandbox("sb").unwrap().view, expected);
    }
}
