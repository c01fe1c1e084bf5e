//! The LitterBox context: one registry, one backend, and the hooks an
//! embedding runtime calls around sandboxed code.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BackendKind, Stats, HOST};
use crate::builder::LitterboxBuilder;
use crate::config::{PackageId, SandboxId, UNOWNED_PACKAGE_ID};
use crate::error::{Error, Result};
use crate::registry::Registry;

thread_local! {
    /// Sandboxes the calling thread has entered through `prolog`, innermost last.
    static STACK: RefCell<Vec<SandboxId>> = const { RefCell::new(Vec::new()) };
}

/// Where the calling thread stands with respect to a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// [`Litterbox::init`] has not run yet.
    Uninitialized,
    /// Running trusted code.
    Ready,
    /// Inside the given sandbox.
    InSandbox(SandboxId),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Uninitialized => write!(f, "Uninitialized"),
            State::Ready => write!(f, "Ready"),
            State::InSandbox(id) => write!(f, "InSandbox({})", id),
        }
    }
}

/// A sandboxing context.
///
/// Created through [`Litterbox::builder`]. Every hook takes `&self` and may
/// be called from several threads at once.
pub struct Litterbox {
    registry: RwLock<Registry>,
    backend: Box<dyn Backend>,
    pids: Mutex<BTreeMap<SandboxId, i32>>,
    initialized: AtomicBool,
}

impl Litterbox {
    /// Start configuring a new context.
    pub fn builder() -> LitterboxBuilder {
        LitterboxBuilder::new()
    }

    pub(crate) fn new(registry: Registry, backend: Box<dyn Backend>) -> Self {
        Self {
            registry: RwLock::new(registry),
            backend,
            pids: Mutex::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Build the backend's enforcement state from the registry. Calling it
    /// again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let registry = self.registry()?;
        self.backend.init(&registry)?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            backend = self.backend.name(),
            sandboxes = registry.sandboxes().count(),
            "litterbox initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// State of the calling thread.
    pub fn state(&self) -> State {
        if !self.is_initialized() {
            return State::Uninitialized;
        }
        match self.current() {
            id if id == HOST => State::Ready,
            id => State::InSandbox(id),
        }
    }

    /// Innermost sandbox the calling thread entered, [`HOST`] outside of any.
    pub fn current(&self) -> SandboxId {
        STACK.with(|s| s.borrow().last().cloned().unwrap_or_default())
    }

    /// Enter sandbox `id`. A dynamically declared sandbox is completed and
    /// handed to the backend on its first entry.
    pub fn prolog(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let completed = self.registry_mut()?.complete_sandbox(id)?;
        if completed {
            tracing::debug!(sandbox = id, "sandbox completed on first entry");
            self.backend.add_sandbox(&*self.registry()?, id)?;
        }

        STACK.with(|s| s.borrow_mut().push(id.to_string()));
        if let Err(e) = self.backend.prolog(id) {
            STACK.with(|s| s.borrow_mut().pop());
            return Err(e);
        }
        Ok(())
    }

    /// Leave sandbox `id`, which must be the innermost one the calling
    /// thread entered. The thread resumes in the enclosing sandbox, if any.
    pub fn epilog(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let current = self.current();
        if current != id {
            return Err(Error::InvalidState {
                expected: id.to_string(),
                actual: current,
            });
        }
        self.backend.epilog(id)?;
        let outer = STACK.with(|s| {
            let mut stack = s.borrow_mut();
            stack.pop();
            stack.last().cloned()
        });
        match outer {
            Some(outer) => self.backend.execute(&outer),
            None => Ok(()),
        }
    }

    /// Switch the calling thread to `id`, [`HOST`] or [`crate::backend::DETACH`]
    /// without touching the prolog stack. Used by the runtime scheduler.
    pub fn execute(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        self.backend.execute(id)
    }

    /// Memory `[start, start + size)` now belongs to package `id`.
    pub fn register(&self, id: PackageId, start: u64, size: u64) -> Result<()> {
        self.backend.register(&*self.registry()?, id, start, size)
    }

    /// Memory `[start, start + size)` moves from package `old` to `new`.
    pub fn transfer(&self, old: PackageId, new: PackageId, start: u64, size: u64) -> Result<()> {
        self.backend
            .transfer(&*self.registry()?, old, new, start, size)
    }

    /// The address space grew: `heap` is set for the managed heap, clear for
    /// runtime metadata.
    pub fn runtime_growth(&self, heap: bool, id: PackageId, start: u64, size: u64) -> Result<()> {
        self.backend
            .runtime_growth(&*self.registry()?, heap, id, start, size)
    }

    pub fn register_package(&self, name: &str, id: PackageId) -> Result<()> {
        self.registry_mut()?.register_package(name, id)
    }

    /// Record that package `current` imports `dependency`.
    pub fn register_dependency(&self, current: &str, dependency: &str) -> Result<()> {
        self.registry_mut()?.add_dependency(current, dependency)
    }

    /// Declare a sandbox. Declaring an id again keeps the first declaration.
    /// `pid` is the process id the runtime associates with it.
    pub fn register_sandbox(&self, pid: i32, id: &str, memory: &str, syscalls: &str) -> Result<()> {
        self.registry_mut()?.register_sandbox(id, memory, syscalls)?;
        self.lock_pids().insert(id.to_string(), pid);
        Ok(())
    }

    pub fn register_sandbox_dependency(&self, id: &str, package: &str) -> Result<()> {
        self.registry_mut()?.register_sandbox_dependency(id, package)
    }

    /// Record a new section of package `id` and hand its memory over from the
    /// unowned pool.
    pub fn add_section(&self, id: PackageId, start: u64, size: u64) -> Result<()> {
        self.registry_mut()?.add_section(id, start, size)?;
        if self.is_initialized() {
            self.transfer(UNOWNED_PACKAGE_ID, id, start, size)?;
        }
        Ok(())
    }

    /// Process id registered with sandbox `id`.
    pub fn sandbox_pid(&self, id: &str) -> Option<i32> {
        self.lock_pids().get(id).copied()
    }

    pub fn stats(&self) -> Stats {
        self.backend.stats()
    }

    /// Read access to the registry.
    pub fn registry(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry
            .read()
            .map_err(|_| Error::invariant("registry lock poisoned"))
    }

    fn registry_mut(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .write()
            .map_err(|_| Error::invariant("registry lock poisoned"))
    }

    fn lock_pids(&self) -> std::sync::MutexGuard<'_, BTreeMap<SandboxId, i32>> {
        self.pids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: State::Ready.to_string(),
                actual: State::Uninitialized.to_string(),
            })
        }
    }
}

impl fmt::Debug for Litterbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Litterbox")
            .field("backend", &self.backend.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::backend::DETACH;
    use crate::config::Manifest;
    use crate::registry::NameResolution;

    fn context(registry: Registry) -> Litterbox {
        let lb = Litterbox::new(registry, Box::new(SimBackend::new()));
        lb.init().unwrap();
        lb
    }

    fn manifest() -> Manifest {
        Manifest::from_json(
            r#"{
                "packages": [
                    {"name": "main", "id": 1, "sections": [{"addr": 4194304, "size": 4096, "prot": 5}]},
                    {"name": "json", "id": 2, "sections": [{"addr": 8388608, "size": 4096, "prot": 4}]}
                ],
                "sandboxes": [
                    {"id": "\"parse\"", "memory": "json:R", "packages": ["main"]}
                ],
                "dependencies": {"main": ["json"]}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hooks_require_init() {
        let lb = Litterbox::new(Registry::default(), Box::new(SimBackend::new()));
        assert_eq!(lb.state(), State::Uninitialized);
        assert!(matches!(lb.prolog("sb"), Err(Error::InvalidState { .. })));
        lb.init().unwrap();
        lb.init().unwrap();
        assert_eq!(lb.state(), State::Ready);
    }

    #[test]
    fn test_nested_prolog_epilog() {
        let registry = Registry::from_manifest(&manifest(), NameResolution::Exact).unwrap();
        let lb = context(registry);
        lb.register_sandbox(7, "inner", "", "").unwrap();

        lb.prolog("parse").unwrap();
        lb.prolog("inner").unwrap();
        assert_eq!(lb.state(), State::InSandbox("inner".to_string()));

        let err = lb.epilog("parse").unwrap_err();
        assert!(matches!(err, Error::InvalidState { ref actual, .. } if actual == "inner"));

        lb.epilog("inner").unwrap();
        assert_eq!(lb.current(), "parse");
        lb.epilog("parse").unwrap();
        assert_eq!(lb.state(), State::Ready);
        assert_eq!(lb.stats().entries, 3);
        assert_eq!(lb.stats().exits, 2);
    }

    #[test]
    fn test_manifest_sandbox_not_recompleted() {
        let registry = Registry::from_manifest(&manifest(), NameResolution::Exact).unwrap();
        let lb = context(registry);
        let before = lb.registry().unwrap().sandbox("parse").unwrap().view.clone();
        lb.prolog("parse").unwrap();
        lb.epilog("parse").unwrap();
        let after = lb.registry().unwrap().sandbox("parse").unwrap().view.clone();
        pretty_assertions::assert_eq!(before, after);
    }

    #[test]
    fn test_dynamic_sandbox_completed_on_entry() {
        let lb = context(Registry::new(NameResolution::Suffix));
        lb.register_package("app", 1).unwrap();
        lb.register_package("lib.json", 2).unwrap();
        lb.register_dependency("app", "lib.json").unwrap();
        lb.register_sandbox(42, "sb", "json:R", "").unwrap();
        lb.register_sandbox_dependency("sb", "app").unwrap();
        lb.add_section(1, 0x40_0000, 0x1000).unwrap();

        assert!(!lb.registry().unwrap().sandbox("sb").unwrap().entered);
        lb.prolog("sb").unwrap();
        assert!(lb.registry().unwrap().sandbox("sb").unwrap().entered);
        lb.epilog("sb").unwrap();

        assert_eq!(lb.sandbox_pid("sb"), Some(42));
        assert_eq!(lb.sandbox_pid("other"), None);
    }

    #[test]
    fn test_prolog_unknown_sandbox() {
        let lb = context(Registry::default());
        assert!(matches!(lb.prolog("nope"), Err(Error::UnknownSandbox(_))));
        assert_eq!(lb.current(), HOST);
    }

    #[test]
    fn test_execute_leaves_stack_alone() {
        let lb = context(Registry::default());
        lb.register_sandbox(1, "sb", "", "").unwrap();
        lb.prolog("sb").unwrap();
        lb.execute(HOST).unwrap();
        lb.execute(DETACH).unwrap();
        assert_eq!(lb.current(), "sb");
        assert_eq!(lb.stats().escapes, 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::InSandbox("sb".into()).to_string(), "InSandbox(sb)");
        assert_eq!(State::Ready.to_string(), "Ready");
    }
}
