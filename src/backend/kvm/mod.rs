//! Hardware-virtualization backend over Linux KVM.
//!
//! Every thread that enters a sandbox moves into a KVM guest that shares the
//! process address space: guest page tables give each sandbox its own view
//! of the process, and the God view maps everything. Threads stay in the
//! guest once they are in; leaving a sandbox only switches back to the God
//! view. System calls and faults halt the vCPU and are judged on the host.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Access to /dev/kvm
//! - CPU with VT-x (Intel) or AMD-V (AMD)
//!
//! ## References
//!
//! - https://www.kernel.org/doc/html/latest/virt/kvm/api.html

use std::sync::Mutex;

use arrayvec::ArrayVec;

use crate::backend::{Backend, BackendKind, BackendOptions, Stats, DETACH, HOST};
use crate::config::{PackageId, Prot, SyscallMask};
use crate::error::{Error, Result};
use crate::memory::{ProcessMaps, PAGE_SIZE};
use crate::registry::Registry;

pub mod bindings;
pub mod bluepill;
pub mod machine;
pub mod ring0;
pub mod trap;
pub mod vcpu;
pub mod views;

use machine::{Hypervisor, Machine, SandboxEntry, SandboxTable, MACHINE};
use ring0::KernelArea;
use trap::Redpill;
use vcpu::{Vcpu, VcpuSetup};
use views::MemoryViews;

/// Ownership events kept until the machine exists.
const PENDING_EVENTS: usize = 50;

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    std::path::Path::new("/dev/kvm").exists()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Growth {
        heap: bool,
        id: PackageId,
        start: u64,
        size: u64,
    },
    Transfer {
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    },
}

/// VT-x backend. The machine itself is process-wide, see [`MACHINE`].
pub struct VtxBackend {
    options: BackendOptions,
    pending: Mutex<ArrayVec<Pending, PENDING_EVENTS>>,
}

impl VtxBackend {
    pub fn new(options: BackendOptions) -> Result<Self> {
        if !is_available() {
            return Err(Error::HypervisorNotAvailable);
        }
        Ok(Self {
            options,
            pending: Mutex::new(ArrayVec::new()),
        })
    }

    fn machine(&self) -> Result<&'static Machine> {
        MACHINE.get().ok_or_else(|| Error::InvalidState {
            expected: "initialized VT-x machine".into(),
            actual: "uninitialized".into(),
        })
    }

    fn build_machine(&self, registry: &Registry) -> Result<Machine> {
        let hv = Hypervisor::open()?;
        let kernel = KernelArea::new(hv.max_vcpus())?;

        // Read the maps after the kernel area exists so the God view has it.
        let maps = ProcessMaps::current(self.options.c_heap_headroom)?;
        let mut views = MemoryViews::new(&maps, self.options.layout.clone())?;
        views.map_kernel(kernel.start(), kernel.size(), Prot::R | Prot::W)?;
        for page in ring0::entry_pages()
            .into_iter()
            .chain(bluepill::stub_pages())
        {
            views.map_kernel(page, PAGE_SIZE, Prot::R | Prot::X | Prot::USER)?;
        }
        for sandbox in registry.sandboxes().filter(|s| s.entered) {
            views.add_sandbox(sandbox)?;
        }

        let pending = std::mem::take(&mut *self.lock_pending());
        for event in &pending {
            match *event {
                Pending::Growth {
                    heap,
                    id,
                    start,
                    size,
                } => views.runtime_growth(registry, &hv, heap, id, start, size)?,
                Pending::Transfer {
                    old,
                    new,
                    start,
                    size,
                } => views.transfer(registry, old, new, start, size)?,
            }
        }

        let slots = views.register_regions(&hv)?;
        views.sync_arenas(&hv, self.options.seal_arenas)?;
        crate::debug_kvm!(
            "{} views, {} slots, {} pending events applied",
            views.len(),
            slots,
            pending.len()
        );

        let setup = VcpuSetup {
            vm: hv.vm_fd(),
            run_size: hv.run_size(),
            cpuid: hv.cpuid(),
            xcr0: bluepill::host_xcr0(),
        };
        let mut vcpus = Vec::with_capacity(kernel.len());
        for index in 0..kernel.len() {
            // SAFETY: nobody runs on the vCPUs yet.
            let tables = unsafe { kernel.tables(index) }
                .ok_or_else(|| Error::invariant(format!("no kernel tables for vCPU {}", index)))?;
            vcpus.push(Vcpu::new(index, &setup, tables)?);
        }

        let god_cr3 = views.god.cr3(0, false);
        let mut table = SandboxTable::default();
        for sandbox in registry.sandboxes().filter(|s| s.entered) {
            table.insert(sandbox_entry(&views, god_cr3, sandbox)?);
        }
        Ok(Machine::new(hv, kernel, views, table, vcpus))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, ArrayVec<Pending, PENDING_EVENTS>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, event: Pending) -> Result<()> {
        self.lock_pending()
            .try_push(event)
            .map_err(|_| Error::invariant("too many ownership events before init"))
    }

    /// Move a thread that holds no vCPU into the guest, on sandbox `entry`.
    fn enter(&self, machine: &'static Machine, entry: &SandboxEntry) -> Result<()> {
        {
            let mut views = machine.views();
            let maps = ProcessMaps::current(self.options.c_heap_headroom)?;
            views.update_missing(&maps, &machine.hv)?;
            views.sync_arenas(&machine.hv, false)?;
            views.replenish();
        }
        let vcpu = machine
            .acquire()
            .ok_or_else(|| Error::VcpuError("no free vCPU".into()))?;
        // SAFETY: we just acquired the vCPU.
        let ctx = unsafe { vcpu.context() };
        let set = if entry.trusted {
            ctx.sandbox.clear();
            ctx.god = true;
            Ok(())
        } else {
            ctx.set_sandbox(&entry.id, entry.cr3, entry.mask)
                .map_err(|fatal| Error::VcpuError(fatal.to_string()))
        };
        if let Err(e) = set {
            machine.release(vcpu);
            return Err(e);
        }
        crate::debug_kvm!("thread enters vCPU {} in sandbox {}", vcpu.index(), entry.id);
        bluepill::enter(vcpu)
    }

    /// Switch a thread already in the guest.
    fn switch(&self, machine: &Machine, entry: &SandboxEntry) -> Result<()> {
        let pill = if entry.trusted {
            Redpill::God
        } else {
            Redpill::Switch(entry.cr3)
        };
        let ret = bluepill::redpill(pill);
        if ret != 0 {
            return Err(Error::VcpuError(format!("redpill {:?} returned {}", pill, ret)));
        }
        if let Some(vcpu) = bluepill::current().and_then(|i| machine.vcpus.get(i)) {
            vcpu.count_entry();
        }
        Ok(())
    }

    fn god(&self) -> Result<()> {
        if bluepill::current().is_none() {
            return Ok(());
        }
        match bluepill::redpill(Redpill::God) {
            0 => Ok(()),
            ret => Err(Error::VcpuError(format!("redpill God returned {}", ret))),
        }
    }

    /// Sandbox the calling thread currently runs in, if it is in the guest.
    fn current_sandbox<'m>(&self, machine: &'m Machine) -> Option<(bool, &'m str)> {
        let vcpu = machine.vcpus.get(bluepill::current()?)?;
        // SAFETY: the calling thread owns this vCPU.
        let ctx = unsafe { vcpu.context() };
        Some((ctx.god, ctx.sandbox.as_str()))
    }
}

fn sandbox_entry(
    views: &MemoryViews,
    god_cr3: u64,
    sandbox: &crate::config::SandboxMemory,
) -> Result<SandboxEntry> {
    if sandbox.config.is_trusted() {
        return Ok(SandboxEntry {
            id: sandbox.id().to_string(),
            cr3: god_cr3,
            mask: SyscallMask::ALL,
            trusted: true,
        });
    }
    let view = views
        .view(sandbox.id())
        .ok_or_else(|| Error::invariant(format!("no view for sandbox {}", sandbox.id())))?;
    Ok(SandboxEntry {
        id: sandbox.id().to_string(),
        cr3: view.cr3(0, false),
        mask: sandbox.config.sys,
        trusted: false,
    })
}

impl Backend for VtxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vtx
    }

    fn init(&self, registry: &Registry) -> Result<()> {
        if MACHINE.get().is_some() {
            return Err(Error::InvalidState {
                expected: "uninitialized".into(),
                actual: "VT-x machine already running".into(),
            });
        }
        bluepill::install_handler()?;
        let machine = self.build_machine(registry)?;
        let vcpus = machine.vcpus.len();
        MACHINE.set(machine).map_err(|_| Error::InvalidState {
            expected: "uninitialized".into(),
            actual: "VT-x machine initialized concurrently".into(),
        })?;
        tracing::info!(vcpus, "VT-x backend ready");
        Ok(())
    }

    fn add_sandbox(&self, registry: &Registry, id: &str) -> Result<()> {
        let machine = self.machine()?;
        let sandbox = registry
            .sandbox(id)
            .ok_or_else(|| Error::UnknownSandbox(id.to_string()))?;
        let entry = {
            let mut views = machine.views();
            views.add_sandbox(sandbox)?;
            views.sync_arenas(&machine.hv, false)?;
            sandbox_entry(&views, machine.god_cr3, sandbox)?
        };
        crate::debug_kvm!("sandbox {} added, cr3=0x{:x}", id, entry.cr3);
        machine.insert_sandbox(entry);
        Ok(())
    }

    fn prolog(&self, id: &str) -> Result<()> {
        let machine = self.machine()?;
        let entry = machine
            .sandbox(id)
            .ok_or_else(|| Error::UnknownSandbox(id.to_string()))?;
        if bluepill::current().is_some() {
            self.switch(machine, &entry)
        } else {
            self.enter(machine, &entry)
        }
    }

    fn epilog(&self, _id: &str) -> Result<()> {
        self.god()
    }

    fn execute(&self, id: &str) -> Result<()> {
        let machine = self.machine()?;
        match id {
            DETACH => {
                if bluepill::current().is_some() {
                    let ret = bluepill::redpill(Redpill::Exit);
                    if ret != 0 {
                        return Err(Error::VcpuError(format!("redpill Exit returned {}", ret)));
                    }
                }
                Ok(())
            }
            HOST => self.god(),
            _ => {
                if let Some((false, current)) = self.current_sandbox(machine) {
                    if current == id {
                        return Ok(());
                    }
                }
                self.prolog(id)
            }
        }
    }

    fn register(&self, _registry: &Registry, id: PackageId, _start: u64, _size: u64) -> Result<()> {
        Err(Error::NotSupported(format!(
            "register of package {} with the VT-x backend",
            id
        )))
    }

    fn transfer(
        &self,
        registry: &Registry,
        old: PackageId,
        new: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        let Some(machine) = MACHINE.get() else {
            return self.queue(Pending::Transfer {
                old,
                new,
                start,
                size,
            });
        };
        machine.views().transfer(registry, old, new, start, size)
    }

    fn runtime_growth(
        &self,
        registry: &Registry,
        heap: bool,
        id: PackageId,
        start: u64,
        size: u64,
    ) -> Result<()> {
        let Some(machine) = MACHINE.get() else {
            return self.queue(Pending::Growth {
                heap,
                id,
                start,
                size,
            });
        };
        let mut views = machine.views();
        views.runtime_growth(registry, &machine.hv, heap, id, start, size)?;
        views.sync_arenas(&machine.hv, false)
    }

    fn stats(&self) -> Stats {
        MACHINE.get().map(Machine::stats).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NameResolution;

    fn unstarted() -> VtxBackend {
        VtxBackend {
            options: BackendOptions::default(),
            pending: Mutex::new(ArrayVec::new()),
        }
    }

    #[test]
    fn test_growth_queued_before_init() {
        if MACHINE.get().is_some() {
            return;
        }
        let backend = unstarted();
        let registry = Registry::new(NameResolution::Exact);
        backend
            .runtime_growth(&registry, true, 1, 0xc0_0000_0000, 0x1000)
            .unwrap();
        backend.transfer(&registry, 1, 2, 0xc0_0000_0000, 0x1000).unwrap();
        assert_eq!(
            backend.lock_pending().as_slice(),
            &[
                Pending::Growth {
                    heap: true,
                    id: 1,
                    start: 0xc0_0000_0000,
                    size: 0x1000,
                },
                Pending::Transfer {
                    old: 1,
                    new: 2,
                    start: 0xc0_0000_0000,
                    size: 0x1000,
                },
            ]
        );
        for i in 2..PENDING_EVENTS {
            backend
                .runtime_growth(&registry, true, 1, 0xc0_0000_0000 + i as u64 * 0x1000, 0x1000)
                .unwrap();
        }
        assert!(backend
            .runtime_growth(&registry, true, 1, 0xd0_0000_0000, 0x1000)
            .is_err());
        assert!(matches!(
            backend.transfer(&registry, 2, 1, 0xc0_0000_0000, 0x1000),
            Err(Error::Invariant(_))
        ));
        assert!(backend.prolog("sb").is_err());
        assert_eq!(backend.stats(), Stats::default());
    }

    #[test]
    fn test_register_not_supported() {
        if !is_available() {
            return;
        }
        let backend = VtxBackend::new(BackendOptions::default()).unwrap();
        let registry = Registry::new(NameResolution::Exact);
        assert!(matches!(
            backend.register(&registry, 1, 0x1000, 0x1000),
            Err(Error::NotSupported(_))
        ));
        assert_eq!(backend.name(), "VTX");
    }
}
