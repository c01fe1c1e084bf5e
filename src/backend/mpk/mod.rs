//! Memory-protection-key backend.
//!
//! Packages are grouped into domains exactly like the VT-x views, one key per
//! domain. Every page of a domain's packages is tagged with its key at init,
//! and each sandbox gets a precomputed PKRU value that entering it installs.
//! Packages no sandbox is granted, and memory handed back to the unowned
//! pool, share one more key that every sandbox has access-disabled.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::backend::{Backend, BackendKind, Stats, DETACH, HOST};
use crate::config::{
    PackageId, Prot, SandboxId, COMMON_PREFIX, RUNTIME_PACKAGE_ID, UNOWNED_PACKAGE_ID,
};
use crate::domains;
use crate::error::{Error, Result};
use crate::registry::Registry;

pub mod pkru;

pub use pkru::{KeyRights, Pkey, Pkru, MAX_KEYS};

thread_local! {
    static IN_SANDBOX: Cell<bool> = Cell::new(false);
}

/// `mprotect` rights of a section before keys narrow them.
fn section_prot(prot: Prot) -> i32 {
    let mut sys = libc::PROT_READ;
    if prot.contains(Prot::W) {
        sys |= libc::PROT_WRITE;
    }
    if prot.contains(Prot::X) {
        sys |= libc::PROT_EXEC;
    }
    sys
}

/// Key operations, a seam over the `pkey_*` syscalls and PKRU accesses.
pub trait KeyOps: Send + Sync {
    fn alloc(&self) -> Result<Pkey>;

    fn mprotect(&self, start: u64, size: u64, prot: i32, key: Pkey) -> Result<()>;

    fn write_pkru(&self, pkru: Pkru);
}

/// Keys of the running CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareKeys;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl KeyOps for HardwareKeys {
    fn alloc(&self) -> Result<Pkey> {
        // SAFETY: pkey_alloc takes no pointers.
        let key = unsafe { libc::syscall(libc::SYS_pkey_alloc, 0, 0) };
        if key < 0 {
            return Err(Error::last_os("pkey_alloc"));
        }
        Ok(Pkey(key as u32))
    }

    fn mprotect(&self, start: u64, size: u64, prot: i32, key: Pkey) -> Result<()> {
        // SAFETY: the kernel validates the range; tagging changes rights only.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pkey_mprotect,
                start as usize,
                size as usize,
                prot,
                key.0 as libc::c_int,
            )
        };
        if ret != 0 {
            return Err(Error::last_os("pkey_mprotect"));
        }
        Ok(())
    }

    fn write_pkru(&self, pkru: Pkru) {
        pkru::write_pkru(pkru)
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
impl KeyOps for HardwareKeys {
    fn alloc(&self) -> Result<Pkey> {
        Err(Error::PkeyUnavailable("not an x86_64 Linux host".into()))
    }

    fn mprotect(&self, _start: u64, _size: u64, _prot: i32, _key: Pkey) -> Result<()> {
        Err(Error::PkeyUnavailable("not an x86_64 Linux host".into()))
    }

    fn write_pkru(&self, _pkru: Pkru) {}
}

/// Whether the kernel hands out protection keys.
pub fn is_available() -> bool {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        // SAFETY: plain syscalls without pointers.
        unsafe {
            let key = libc::syscall(libc::SYS_pkey_alloc, 0, 0);
            if key < 0 {
                return false;
            }
            libc::syscall(libc::SYS_pkey_free, key);
        }
        true
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    {
        false
    }
}

#[derive(Debug, Default)]
struct KeyTables {
    pkru: BTreeMap<SandboxId, Pkru>,
    pkg_keys: BTreeMap<PackageId, Pkey>,
    initialized: bool,
}

pub struct MpkBackend<K: KeyOps> {
    keys: K,
    tables: RwLock<KeyTables>,
    entries: AtomicU64,
    exits: AtomicU64,
    escapes: AtomicU64,
}

impl<K: KeyOps> MpkBackend<K> {
    pub fn new(keys: K) -> Result<Self> {
        Ok(Self {
            keys,
            tables: RwLock::new(KeyTables::default()),
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            escapes: AtomicU64::new(0),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyTables>> {
        self.tables
            .read()
            .map_err(|_| Error::invariant("key tables lock poisoned"))
    }

    fn pkru_for(&self, id: &str) -> Result<Pkru> {
        self.read()?
            .pkru
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownSandbox(id.to_string()))
    }

    /// Precomputed PKRU value of a sandbox.
    pub fn sandbox_pkru(&self, id: &str) -> Option<Pkru> {
        self.pkru_for(id).ok()
    }

    pub fn package_key(&self, id: PackageId) -> Option<Pkey> {
        self.read().ok()?.pkg_keys.get(&id).copied()
    }

    fn tag_package(&self, registry: &Registry, id: PackageId, key: Pkey) -> Result<()> {
        let pkg = registry
            .package(id)
            .ok_or_else(|| Error::UnknownPackage(id.to_string()))?;
        for section in pkg.all_sections().filter(|s| s.addr != 0 && s.size > 0) {
            self.keys
                .mprotect(section.addr, section.size, section_prot(section.prot), key)?;
        }
        Ok(())
    }

    fn enter(&self, pkru: Pkru) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.keys.write_pkru(pkru);
        IN_SANDBOX.with(|s| s.set(true));
    }
}

impl<K: KeyOps> Backend for MpkBackend<K> {
    fn kind(&self) -> BackendKind {
        BackendKind::Mpk
    }

    fn init(&self, registry: &Registry) -> Result<()> {
        self.keys.write_pkru(Pkru::ALL_RIGHTS);

        let views: BTreeMap<SandboxId, BTreeMap<PackageId, KeyRights>> = registry
            .sandboxes()
            .filter(|s| !s.config.is_trusted())
            .map(|s| {
                let view = s
                    .view
                    .iter()
                    .filter(|(pkg, _)| **pkg != RUNTIME_PACKAGE_ID)
                    .map(|(pkg, prot)| (*pkg, KeyRights::from_prot(*prot)))
                    .collect();
                (s.id().to_string(), view)
            })
            .collect();
        // The runtime and the common packages stay on the default key.
        let packages = registry
            .packages()
            .filter(|p| p.id != RUNTIME_PACKAGE_ID && !p.name.starts_with(COMMON_PREFIX))
            .map(|p| p.id);
        let assignment = domains::assign(&views, packages);
        let needed = assignment.len() + 1;
        if needed > MAX_KEYS {
            return Err(Error::KeysExhausted(needed));
        }

        let mut tables = KeyTables::default();
        let mut domain_keys = BTreeMap::new();
        for domain in assignment.domains() {
            let key = self.keys.alloc()?;
            for pkg in assignment.members(domain) {
                self.tag_package(registry, *pkg, key)?;
                tables.pkg_keys.insert(*pkg, key);
            }
            crate::debug_mpk!("domain {} -> key {}", domain, key.0);
            domain_keys.insert(domain, key);
        }

        let unowned = self.keys.alloc()?;
        for pkg in assignment.unowned() {
            self.tag_package(registry, *pkg, unowned)?;
            tables.pkg_keys.insert(*pkg, unowned);
        }
        tables.pkg_keys.insert(UNOWNED_PACKAGE_ID, unowned);
        crate::debug_mpk!("unowned {:?} -> key {}", assignment.unowned(), unowned.0);

        for sandbox in registry.sandboxes() {
            let pkru = if sandbox.config.is_trusted() {
                Pkru::ALL_RIGHTS
            } else {
                assignment
                    .sandbox(sandbox.id())
                    .iter()
                    .fold(
                        Pkru::NO_RIGHTS.update(unowned, KeyRights::X),
                        |pkru, (domain, rights)| pkru.update(domain_keys[domain], *rights),
                    )
            };
            crate::debug_mpk!("sandbox {} pkru {:?}", sandbox.id(), pkru);
            tables.pkru.insert(sandbox.id().to_string(), pkru);
        }
        tables.initialized = true;

        tracing::info!(keys = domain_keys.len(), "protection keys assigned");
        *self
            .tables
            .write()
            .map_err(|_| Error::invariant("key tables lock poisoned"))? = tables;
        Ok(())
    }

    fn add_sandbox(&self, _registry: &Registry, id: &str) -> Result<()> {
        Err(Error::NotSupported(format!(
            "sandbox {} registered after key assignment",
            id
        )))
    }

    fn prolog(&self, id: &str) -> Result<()> {
        let pkru = self.pkru_for(id)?;
        self.enter(pkru);
        Ok(())
    }

    fn epilog(&self, _id: &str) -> Result<()> {
        IN_SANDBOX.with(|s| s.set(false));
        self.keys.write_pkru(Pkru::ALL_RIGHTS);
        self.exits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, id: &str) -> Result<()> {
        if id == HOST || id == DETACH {
            if IN_SANDBOX.with(|s| s.replace(false)) {
                self.escapes.fetch_add(1, Ordering::Relaxed);
            }
            self.keys.write_pkru(Pkru::ALL_RIGHTS);
            return Ok(());
        }
        let pkru = self.pkru_for(id)?;
        self.enter(pkru);
        Ok(())
    }

    fn register(&self, _registry: &Registry, id: PackageId, start: u64, size: u64) -> Result<()> {
        if id == RUNTIME_PACKAGE_ID {
            return Ok(());
        }
        match self.package_key(id) {
            Some(key) => self
                .keys
                .mprotect(start, size, libc::PROT_READ | libc::PROT_WRITE, key),
            None => {
                crate::debug_mpk!("register: package {} has no key", id);
                Ok(())
            }
        }
    }

    fn transfer(
        &self,
        _registry: &Registry,
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let rw = libc::PROT_READ | libc::PROT_WRITE;
        if new == RUNTIME_PACKAGE_ID {
            return self.keys.mprotect(start, size, rw, Pkey::DEFAULT);
        }
        let Some(key) = self.package_key(new) else {
            return Ok(());
        };
        if self.package_key(old) != Some(key) {
            self.keys.mprotect(start, size, rw, key)?;
        }
        Ok(())
    }

    fn runtime_growth(
        &self,
        _registry: &Registry,
        _heap: bool,
        _id: PackageId,
        _start: u64,
        _size: u64,
    ) -> Result<()> {
        // New memory carries the default key.
        Ok(())
    }

    fn stats(&self) -> Stats {
        Stats {
            entries: self.entries.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            escapes: self.escapes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Manifest;
    use crate::registry::NameResolution;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeKeys {
        next: AtomicU32,
        tagged: Mutex<Vec<(u64, u64, i32, Pkey)>>,
        pkru: AtomicU32,
    }

    impl FakeKeys {
        fn pkru(&self) -> Pkru {
            Pkru(self.pkru.load(Ordering::SeqCst))
        }

        fn tagged(&self) -> Vec<(u64, u64, i32, Pkey)> {
            self.tagged.lock().unwrap().clone()
        }
    }

    impl KeyOps for &'static FakeKeys {
        fn alloc(&self) -> Result<Pkey> {
            Ok(Pkey(self.next.fetch_add(1, Ordering::SeqCst) + 1))
        }

        fn mprotect(&self, start: u64, size: u64, prot: i32, key: Pkey) -> Result<()> {
            self.tagged.lock().unwrap().push((start, size, prot, key));
            Ok(())
        }

        fn write_pkru(&self, pkru: Pkru) {
            self.pkru.store(pkru.0, Ordering::SeqCst);
        }
    }

    const MANIFEST: &str = r#"{
        "packages": [
            {"name": "a", "id": 1, "sections": [{"addr": 4194304, "size": 4096, "prot": 5}]},
            {"name": "b", "id": 2, "sections": [{"addr": 5242880, "size": 8192, "prot": 6}]},
            {"name": "c", "id": 3, "sections": [{"addr": 6291456, "size": 4096, "prot": 6}]}
        ],
        "sandboxes": [
            {"id": "sb1", "memory": "a:R", "syscalls": ""},
            {"id": "sb2", "memory": "a:R,b:RW", "syscalls": ""}
        ]
    }"#;

    fn setup() -> (MpkBackend<&'static FakeKeys>, &'static FakeKeys, Registry) {
        let keys: &'static FakeKeys = Box::leak(Box::default());
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let registry = Registry::from_manifest(&manifest, NameResolution::Exact).unwrap();
        let backend = MpkBackend::new(keys).unwrap();
        backend.init(&registry).unwrap();
        (backend, keys, registry)
    }

    #[test]
    fn test_init_tags_domains() {
        let (backend, keys, _) = setup();
        assert_eq!(backend.package_key(1), Some(Pkey(1)));
        assert_eq!(backend.package_key(2), Some(Pkey(2)));
        assert_eq!(backend.package_key(3), Some(Pkey(3)));
        assert_eq!(backend.package_key(UNOWNED_PACKAGE_ID), Some(Pkey(3)));
        assert_eq!(
            keys.tagged(),
            vec![
                (0x40_0000, 0x1000, libc::PROT_READ | libc::PROT_EXEC, Pkey(1)),
                (0x50_0000, 0x2000, libc::PROT_READ | libc::PROT_WRITE, Pkey(2)),
                (0x60_0000, 0x1000, libc::PROT_READ | libc::PROT_WRITE, Pkey(3)),
            ]
        );
        assert_eq!(backend.sandbox_pkru("sb1"), Some(Pkru(0x5555_5558)));
        assert_eq!(backend.sandbox_pkru("sb2"), Some(Pkru(0x5555_5548)));
    }

    #[test]
    fn test_ungranted_package_denied() {
        let (backend, _, _) = setup();
        let key = backend.package_key(3).unwrap();
        assert_ne!(key, Pkey::DEFAULT);
        for sandbox in ["sb1", "sb2"] {
            let pkru = backend.sandbox_pkru(sandbox).unwrap();
            assert_eq!(pkru.rights(key), KeyRights::X);
        }
    }

    #[test]
    fn test_common_and_runtime_keep_default_key() {
        let keys: &'static FakeKeys = Box::leak(Box::default());
        let mut registry = Registry::new(NameResolution::Exact);
        registry.register_package("runtime", RUNTIME_PACKAGE_ID).unwrap();
        registry.register_package("litterbox.hooks", 5).unwrap();
        registry.register_package("secret", 6).unwrap();
        let backend = MpkBackend::new(keys).unwrap();
        backend.init(&registry).unwrap();
        assert_eq!(backend.package_key(RUNTIME_PACKAGE_ID), None);
        assert_eq!(backend.package_key(5), None);
        assert_eq!(backend.package_key(6), Some(Pkey(1)));
    }

    #[test]
    fn test_dynamic_sections_tagged_at_init() {
        let keys: &'static FakeKeys = Box::leak(Box::default());
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let mut registry = Registry::from_manifest(&manifest, NameResolution::Exact).unwrap();
        registry.add_section(2, 0x90_0000, 0x1000).unwrap();
        registry.add_section(3, 0xa0_0000, 0x1000).unwrap();
        let backend = MpkBackend::new(keys).unwrap();
        backend.init(&registry).unwrap();

        let rw = libc::PROT_READ | libc::PROT_WRITE;
        let tagged = keys.tagged();
        assert!(tagged.contains(&(0x90_0000, 0x1000, rw, Pkey(2))));
        assert!(tagged.contains(&(0xa0_0000, 0x1000, rw, Pkey(3))));
    }

    #[test]
    fn test_prolog_epilog_write_pkru() {
        let (backend, keys, _) = setup();
        backend.prolog("sb2").unwrap();
        assert_eq!(keys.pkru(), Pkru(0x5555_5548));
        backend.epilog("sb2").unwrap();
        assert_eq!(keys.pkru(), Pkru::ALL_RIGHTS);

        backend.execute("sb1").unwrap();
        assert_eq!(keys.pkru(), Pkru(0x5555_5558));
        backend.execute(HOST).unwrap();
        backend.execute(HOST).unwrap();
        assert_eq!(keys.pkru(), Pkru::ALL_RIGHTS);
        assert_eq!(
            backend.stats(),
            Stats {
                entries: 2,
                exits: 1,
                escapes: 1
            }
        );
        assert!(matches!(backend.prolog("nope"), Err(Error::UnknownSandbox(_))));
    }

    #[test]
    fn test_transfer_retags() {
        let (backend, keys, registry) = setup();
        let before = keys.tagged().len();
        backend.transfer(&registry, 1, 1, 0x70_0000, 0x1000).unwrap();
        backend.transfer(&registry, 3, 2, 0x70_0000, 0x1000).unwrap();
        backend.transfer(&registry, 2, RUNTIME_PACKAGE_ID, 0x70_0000, 0x1000).unwrap();
        backend.register(&registry, RUNTIME_PACKAGE_ID, 0x71_0000, 0x1000).unwrap();
        backend.register(&registry, 1, 0x72_0000, 0x1000).unwrap();
        backend
            .transfer(&registry, 1, UNOWNED_PACKAGE_ID, 0x73_0000, 0x1000)
            .unwrap();
        let rw = libc::PROT_READ | libc::PROT_WRITE;
        assert_eq!(
            keys.tagged()[before..].to_vec(),
            vec![
                (0x70_0000, 0x1000, rw, Pkey(2)),
                (0x70_0000, 0x1000, rw, Pkey::DEFAULT),
                (0x72_0000, 0x1000, rw, Pkey(1)),
                (0x73_0000, 0x1000, rw, Pkey(3)),
            ]
        );
    }

    #[test]
    fn test_keys_exhausted() {
        let keys: &'static FakeKeys = Box::leak(Box::default());
        let mut registry = Registry::new(NameResolution::Exact);
        for i in 1..=16 {
            let name = format!("p{}", i);
            let sandbox = format!("sb{}", i);
            registry.register_package(&name, i).unwrap();
            registry
                .register_sandbox(&sandbox, &format!("{}:R", name), "")
                .unwrap();
            registry.complete_sandbox(&sandbox).unwrap();
        }
        let backend = MpkBackend::new(keys).unwrap();
        assert!(matches!(
            backend.init(&registry),
            Err(Error::KeysExhausted(17))
        ));
        assert!(backend.add_sandbox(&registry, "sb1").is_err());
    }
}
