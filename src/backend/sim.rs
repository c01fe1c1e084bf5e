//! Simulation backend: follows sandbox transitions without enforcing anything.
//!
//! Useful to validate the hook protocol of an embedding runtime on machines
//! without VT-x or protection keys.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::backend::{Backend, BackendKind, Stats, DETACH, HOST};
use crate::config::{PackageId, SandboxId};
use crate::error::{Error, Result};
use crate::registry::Registry;

thread_local! {
    static CURRENT: RefCell<SandboxId> = RefCell::new(String::new());
}

#[derive(Debug, Default)]
pub struct SimBackend {
    sandboxes: RwLock<BTreeSet<SandboxId>>,
    entries: AtomicU64,
    exits: AtomicU64,
    escapes: AtomicU64,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sandbox the calling thread runs in, [`HOST`] outside of any.
    pub fn current(&self) -> SandboxId {
        CURRENT.with(|c| c.borrow().clone())
    }

    fn set_current(&self, id: &str) {
        CURRENT.with(|c| {
            let mut current = c.borrow_mut();
            current.clear();
            current.push_str(id);
        });
    }

    fn check_known(&self, id: &str) -> Result<()> {
        let known = self
            .sandboxes
            .read()
            .map_err(|_| Error::invariant("sandbox set lock poisoned"))?
            .contains(id);
        if known {
            Ok(())
        } else {
            Err(Error::UnknownSandbox(id.to_string()))
        }
    }

    fn insert(&self, id: &str) -> Result<()> {
        self.sandboxes
            .write()
            .map_err(|_| Error::invariant("sandbox set lock poisoned"))?
            .insert(id.to_string());
        Ok(())
    }
}

impl Backend for SimBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sim
    }

    fn init(&self, registry: &Registry) -> Result<()> {
        for sandbox in registry.sandboxes() {
            self.insert(sandbox.id())?;
        }
        Ok(())
    }

    fn add_sandbox(&self, _registry: &Registry, id: &str) -> Result<()> {
        self.insert(id)
    }

    fn prolog(&self, id: &str) -> Result<()> {
        self.check_known(id)?;
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.set_current(id);
        Ok(())
    }

    fn epilog(&self, id: &str) -> Result<()> {
        let current = self.current();
        if current != id {
            return Err(Error::InvalidState {
                expected: id.to_string(),
                actual: current,
            });
        }
        self.exits.fetch_add(1, Ordering::Relaxed);
        self.set_current(HOST);
        Ok(())
    }

    fn execute(&self, id: &str) -> Result<()> {
        let current = self.current();
        if id == DETACH {
            self.set_current(HOST);
            return Ok(());
        }
        if current == id {
            return Ok(());
        }
        if id == HOST {
            self.escapes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.check_known(id)?;
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        self.set_current(id);
        Ok(())
    }

    fn register(&self, _registry: &Registry, id: PackageId, start: u64, size: u64) -> Result<()> {
        tracing::trace!(id, start, size, "register");
        Ok(())
    }

    fn transfer(
        &self,
        _registry: &Registry,
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        tracing::trace!(old, new, start, size, "transfer");
        Ok(())
    }

    fn runtime_growth(
        &self,
        _registry: &Registry,
        heap: bool,
        id: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        tracing::trace!(heap, id, start, size, "runtime growth");
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
    use crate::registry::NameResolution;

    fn backend() -> (SimBackend, Registry) {
        let mut registry = Registry::new(NameResolution::Exact);
        registry.register_sandbox("sb", "", "").unwrap();
        let backend = SimBackend::new();
        backend.init(&registry).unwrap();
        (backend, registry)
    }

    #[test]
    fn test_prolog_epilog() {
        let (backend, _) = backend();
        backend.prolog("sb").unwrap();
        assert_eq!(backend.current(), "sb");
        assert!(matches!(
            backend.epilog("other"),
            Err(Error::InvalidState { .. })
        ));
        backend.epilog("sb").unwrap();
        assert_eq!(backend.current(), HOST);
        assert!(matches!(backend.prolog("nope"), Err(Error::UnknownSandbox(_))));
        assert_eq!(
            backend.stats(),
            Stats {
                entries: 1,
                exits: 1,
                escapes: 0
            }
        );
    }

    #[test]
    fn test_execute_transitions() {
        let (backend, mut registry) = backend();
        backend.execute("sb").unwrap();
        backend.execute("sb").unwrap();
        backend.execute(HOST).unwrap();
        backend.execute(HOST).unwrap();
        assert_eq!(backend.stats().entries, 1);
        assert_eq!(backend.stats().escapes, 1);

        registry.register_sandbox("late", "", "").unwrap();
        assert!(backend.execute("late").is_err());
        backend.add_sandbox(&registry, "late").unwrap();
        backend.execute("late").unwrap();
        backend.execute(DETACH).unwrap();
        assert_eq!(backend.current(), HOST);
    }
}
