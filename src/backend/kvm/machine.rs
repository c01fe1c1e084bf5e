//! The KVM virtual machine every thread enters, and the policy applied when
//! a guest halts.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};

use super::bindings::{self, ioctl, kvm_regs};
use super::ring0::{self, KernelArea, VECTOR_BOUNCE, VECTOR_BREAKPOINT, VECTOR_PAGE_FAULT};
use super::trap::{
    check_syscall, classify_fault, Redpill, SpaceAccess, SyscallAction, SyscallFrame, TrapDetails,
    TrapOutcome,
};
use super::vcpu::{Fatal, HaltHandler, Step, Vcpu};
use super::views::{MemoryViews, SlotRegistrar};
use crate::backend::Stats;
use crate::config::{SandboxId, SyscallMask};
use crate::error::{Error, Result};

/// Upper bound on vCPUs, whatever KVM allows.
pub const MAX_VCPUS: usize = 16;

/// The machine of the process, set once by the VT-x backend.
pub static MACHINE: OnceLock<Machine> = OnceLock::new();

/// Handles on `/dev/kvm` and the VM.
pub struct Hypervisor {
    kvm: OwnedFd,
    vm: OwnedFd,
    run_size: usize,
    max_vcpus: usize,
    cpuid: Box<bindings::kvm_cpuid2>,
    next_slot: AtomicU32,
}

impl Hypervisor {
    pub fn open() -> Result<Self> {
        // SAFETY: plain open of a device node, checked below.
        let fd = unsafe {
            libc::open(
                b"/dev/kvm\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Error::last_os("open /dev/kvm"));
        }
        // SAFETY: freshly opened descriptor we own.
        let kvm = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: argument-less system ioctls.
        let version = unsafe { ioctl(kvm.as_raw_fd(), bindings::KVM_GET_API_VERSION, 0) }
            .map_err(|e| Error::from_kvm(format!("KVM_GET_API_VERSION: errno {}", e)))?;
        if version != bindings::KVM_API_VERSION {
            return Err(Error::from_kvm(format!("unsupported KVM API version {}", version)));
        }

        let vm = loop {
            // SAFETY: machine type 0 is the default.
            match unsafe { ioctl(kvm.as_raw_fd(), bindings::KVM_CREATE_VM, 0) } {
                Ok(fd) => break fd,
                Err(libc::EINTR) => continue,
                Err(e) => return Err(Error::from_kvm(format!("KVM_CREATE_VM: errno {}", e))),
            }
        };
        // SAFETY: freshly returned descriptor we own.
        let vm = unsafe { OwnedFd::from_raw_fd(vm) };

        // SAFETY: argument-less system ioctl.
        let run_size = unsafe { ioctl(kvm.as_raw_fd(), bindings::KVM_GET_VCPU_MMAP_SIZE, 0) }
            .map_err(|e| Error::from_kvm(format!("KVM_GET_VCPU_MMAP_SIZE: errno {}", e)))?;

        let check = |cap| {
            // SAFETY: KVM_CHECK_EXTENSION takes the capability by value.
            unsafe { ioctl(vm.as_raw_fd(), bindings::KVM_CHECK_EXTENSION, cap) }.unwrap_or(0)
        };
        let max_vcpus = match check(bindings::KVM_CAP_MAX_VCPUS) {
            0 => check(bindings::KVM_CAP_NR_VCPUS),
            n => n,
        };
        let max_vcpus = (max_vcpus.max(1) as usize).min(MAX_VCPUS);

        let mut cpuid = Box::<bindings::kvm_cpuid2>::default();
        // SAFETY: `cpuid` advertises room for `nent` entries.
        unsafe {
            ioctl(
                kvm.as_raw_fd(),
                bindings::KVM_GET_SUPPORTED_CPUID,
                cpuid.as_mut() as *mut _ as u64,
            )
        }
        .map_err(|e| Error::from_kvm(format!("KVM_GET_SUPPORTED_CPUID: errno {}", e)))?;

        crate::debug_kvm!(
            "KVM ready: run page {} bytes, {} vCPUs, {} CPUID entries",
            run_size,
            max_vcpus,
            cpuid.nent
        );
        Ok(Self {
            kvm,
            vm,
            run_size: run_size as usize,
            max_vcpus,
            cpuid,
            next_slot: AtomicU32::new(0),
        })
    }

    pub fn vm_fd(&self) -> RawFd {
        self.vm.as_raw_fd()
    }

    pub fn kvm_fd(&self) -> RawFd {
        self.kvm.as_raw_fd()
    }

    pub fn run_size(&self) -> usize {
        self.run_size
    }

    pub fn max_vcpus(&self) -> usize {
        self.max_vcpus
    }

    pub fn cpuid(&self) -> &bindings::kvm_cpuid2 {
        &self.cpuid
    }

    /// Slots handed out so far.
    pub fn slots(&self) -> u32 {
        self.next_slot.load(Ordering::Relaxed)
    }
}

impl SlotRegistrar for Hypervisor {
    fn register_slot(&self, gpa: u64, size: u64, hva: u64) -> Result<u32> {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed) + 1;
        let region = bindings::kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: gpa,
            memory_size: size,
            userspace_addr: hva,
        };
        // SAFETY: `region` is a live kvm_userspace_memory_region.
        unsafe {
            ioctl(
                self.vm.as_raw_fd(),
                bindings::KVM_SET_USER_MEMORY_REGION,
                &region as *const _ as u64,
            )
        }
        .map_err(|e| {
            Error::from_kvm(format!(
                "slot {} gpa=0x{:x} size=0x{:x} hva=0x{:x}: errno {}",
                slot, gpa, size, hva, e
            ))
        })?;
        Ok(slot)
    }
}

/// A sandbox a thread can switch to.
#[derive(Debug, Clone)]
pub struct SandboxEntry {
    pub id: SandboxId,
    pub cr3: u64,
    pub mask: SyscallMask,
    /// Runs on the God view.
    pub trusted: bool,
}

/// Sandboxes by id and by page-table root.
#[derive(Debug, Default)]
pub struct SandboxTable {
    by_id: BTreeMap<SandboxId, SandboxEntry>,
    by_cr3: BTreeMap<u64, SandboxId>,
}

impl SandboxTable {
    pub fn insert(&mut self, entry: SandboxEntry) {
        if !entry.trusted {
            self.by_cr3.insert(entry.cr3, entry.id.clone());
        }
        self.by_id.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&SandboxEntry> {
        self.by_id.get(id)
    }

    pub fn by_cr3(&self, cr3: u64) -> Option<&SandboxEntry> {
        self.by_cr3.get(&cr3).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

pub struct Machine {
    pub hv: Hypervisor,
    pub kernel: KernelArea,
    views: Mutex<MemoryViews>,
    sandboxes: RwLock<SandboxTable>,
    pub god_cr3: u64,
    pub vcpus: Vec<Vcpu>,
}

impl Machine {
    pub fn new(
        hv: Hypervisor,
        kernel: KernelArea,
        views: MemoryViews,
        sandboxes: SandboxTable,
        vcpus: Vec<Vcpu>,
    ) -> Self {
        let god_cr3 = views.god.cr3(0, false);
        Self {
            hv,
            kernel,
            views: Mutex::new(views),
            sandboxes: RwLock::new(sandboxes),
            god_cr3,
            vcpus,
        }
    }

    /// Lock the views. A poisoned lock still hands them out: the trap path
    /// must keep enforcing whatever panicked elsewhere.
    pub fn views(&self) -> MutexGuard<'_, MemoryViews> {
        self.views.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sandbox(&self, id: &str) -> Option<SandboxEntry> {
        self.sandboxes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
    }

    pub fn insert_sandbox(&self, entry: SandboxEntry) {
        self.sandboxes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(entry);
    }

    /// Claim a free vCPU for the calling thread.
    pub fn acquire(&self) -> Option<&Vcpu> {
        let vcpu = self.vcpus.iter().find(|v| v.state.try_acquire())?;
        // SAFETY: gettid has no preconditions.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        vcpu.tid.store(tid, Ordering::Release);
        Some(vcpu)
    }

    pub fn release(&self, vcpu: &Vcpu) {
        vcpu.tid.store(0, Ordering::Release);
        vcpu.state.release();
    }

    pub fn stats(&self) -> Stats {
        self.vcpus.iter().fold(Stats::default(), |acc, v| {
            let s = v.stats();
            Stats {
                entries: acc.entries + s.entries,
                exits: acc.exits + s.exits,
                escapes: acc.escapes + s.escapes,
            }
        })
    }
}

/// Handles the halts of one guest entry.
pub struct Session<'a> {
    machine: &'a Machine,
    vcpu: &'a Vcpu,
}

impl<'a> Session<'a> {
    pub fn new(machine: &'a Machine, vcpu: &'a Vcpu) -> Self {
        Self { machine, vcpu }
    }

    fn syscall(&mut self) -> Step {
        // SAFETY: the session runs on the thread owning the vCPU.
        let ctx = unsafe { self.vcpu.context() };
        let frame = SyscallFrame::from_regs(&ctx.regs);
        ctx.details = TrapDetails {
            syscall: Some(frame.nr),
            ..TrapDetails::default()
        };

        let action = {
            let views = self.machine.views();
            let god = SpaceAccess {
                space: &views.god,
                phys: &views.phys,
            };
            let space = if ctx.god {
                Some(&views.god)
            } else {
                views.view(&ctx.sandbox)
            };
            let Some(space) = space else {
                return Step::Die(Fatal::Exit("no view for the current sandbox"));
            };
            let view = SpaceAccess {
                space,
                phys: &views.phys,
            };
            let mask = if ctx.god { SyscallMask::ALL } else { ctx.mask };
            check_syscall(&frame, &view, &god, &mask, views.c_heap(), |addr| {
                // SAFETY: the address was checked executable in the process.
                unsafe { std::ptr::read_unaligned(addr as *const u16) }
            })
        };

        let mut cr3 = None;
        match action {
            SyscallAction::Redpill(Redpill::Exit) => {
                self.vcpu.count_exit();
                ctx.regs.rax = 0;
                return_to_caller(&mut ctx.regs);
                return Step::Bail;
            }
            SyscallAction::Redpill(Redpill::God) => {
                ctx.god = true;
                ctx.regs.rax = 0;
                cr3 = Some(self.machine.god_cr3);
            }
            SyscallAction::Redpill(Redpill::Norm) => match ctx.leave_god() {
                Ok(root) => {
                    ctx.regs.rax = 0;
                    cr3 = Some(root);
                }
                Err(fatal) => return Step::Die(fatal),
            },
            SyscallAction::Redpill(Redpill::Switch(target)) => {
                if target == self.machine.god_cr3 {
                    ctx.god = true;
                } else {
                    let table = self
                        .machine
                        .sandboxes
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let Some(entry) = table.by_cr3(target) else {
                        return Step::Die(Fatal::Exit("switch to an unknown view"));
                    };
                    if let Err(fatal) = ctx.set_sandbox(&entry.id, entry.cr3, entry.mask) {
                        return Step::Die(fatal);
                    }
                }
                ctx.regs.rax = 0;
                cr3 = Some(target);
            }
            SyscallAction::Redpill(Redpill::Check) => ctx.regs.rax = 1,
            SyscallAction::Emulate(value) => ctx.regs.rax = value,
            SyscallAction::Forward => {
                self.vcpu.count_escape();
                if frame.nr as i64 == libc::SYS_exit {
                    // The thread is gone once the call runs.
                    self.machine.release(self.vcpu);
                }
                let a = frame.args;
                // SAFETY: the call is allowed for this sandbox and runs on
                // behalf of the guest with its own arguments.
                let ret = unsafe {
                    libc::syscall(frame.nr as libc::c_long, a[0], a[1], a[2], a[3], a[4], a[5])
                };
                ctx.regs.rax = if ret == -1 {
                    (-(bindings::errno() as i64)) as u64
                } else {
                    ret as u64
                };
            }
            SyscallAction::Reject(outcome) => {
                return_to_caller(&mut ctx.regs);
                return Step::Die(Fatal::Trap(outcome));
            }
        }

        if let Err(errno) = self.vcpu.set_regs(&ctx.regs) {
            return Step::Die(Fatal::Errno("KVM_SET_REGS", errno));
        }
        if let Some(cr3) = cr3 {
            if let Err(errno) = self.vcpu.write_cr3(&mut ctx.sregs, cr3) {
                return Step::Die(Fatal::Errno("KVM_SET_SREGS", errno));
            }
        }
        Step::Resume
    }

    fn exception(&mut self) -> Step {
        // SAFETY: as above.
        let ctx = unsafe { self.vcpu.context() };
        // SAFETY: the kernel tables of a vCPU belong to its owner.
        let Some(tables) = (unsafe { self.machine.kernel.tables(self.vcpu.index()) }) else {
            return Step::Die(Fatal::Exit("vCPU without kernel tables"));
        };
        let Some(frame) = tables.frame_at(ctx.regs.rsp) else {
            return Step::Die(Fatal::Exit("halt outside the entry stubs"));
        };
        ctx.details = TrapDetails {
            vector: Some(frame.vector),
            error_code: has_error_code(frame.vector).then_some(frame.error_code),
            ..TrapDetails::default()
        };
        if frame.vector == VECTOR_BOUNCE {
            return Step::Resume;
        }

        // Report and return with the state of the interrupted code.
        ctx.regs.rip = frame.rip;
        ctx.regs.rsp = frame.rsp;
        ctx.regs.rflags = frame.rflags;

        match frame.vector {
            VECTOR_BREAKPOINT => {
                // Let the host run the int3 again and get its SIGTRAP.
                ctx.regs.rip = frame.rip.wrapping_sub(1);
                Step::Bail
            }
            VECTOR_PAGE_FAULT => {
                if let Err(errno) = self.vcpu.get_sregs(&mut ctx.sregs) {
                    return Step::Die(Fatal::Errno("KVM_GET_SREGS", errno));
                }
                let addr = ctx.sregs.cr2;
                ctx.details.fault_addr = Some(addr);
                let views = self.machine.views();
                let god = SpaceAccess {
                    space: &views.god,
                    phys: &views.phys,
                };
                let outcome = match views.view(&ctx.sandbox) {
                    Some(space) if !ctx.god => {
                        let view = SpaceAccess {
                            space,
                            phys: &views.phys,
                        };
                        classify_fault(&view, &god, addr)
                    }
                    _ => classify_fault(&god, &god, addr),
                };
                Step::Die(Fatal::Trap(outcome))
            }
            _ => Step::Die(Fatal::Trap(TrapOutcome::Exception)),
        }
    }
}

impl HaltHandler for Session<'_> {
    fn halted(&mut self) -> Step {
        // SAFETY: as above.
        let ctx = unsafe { self.vcpu.context() };
        if let Err(errno) = self.vcpu.get_regs(&mut ctx.regs) {
            return Step::Die(Fatal::Errno("KVM_GET_REGS", errno));
        }
        // rip sits right after the hlt.
        if ctx.regs.rip.wrapping_sub(1) == ring0::syscall_entry() {
            self.syscall()
        } else {
            self.exception()
        }
    }
}

/// Registers as the code that issued the system call sees them on return.
fn return_to_caller(regs: &mut kvm_regs) {
    regs.rip = regs.rcx;
    regs.rflags = regs.r11;
}

/// Vectors for which the CPU pushes an error code.
pub fn has_error_code(vector: u64) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_table() {
        let mut table = SandboxTable::default();
        table.insert(SandboxEntry {
            id: "sb1".into(),
            cr3: 0x1000,
            mask: SyscallMask::NONE,
            trusted: false,
        });
        table.insert(SandboxEntry {
            id: "-1".into(),
            cr3: 0x9000,
            mask: SyscallMask::ALL,
            trusted: true,
        });
        assert_eq!(table.len(), 2);
        assert_eq!(table.by_cr3(0x1000).map(|e| e.id.as_str()), Some("sb1"));
        // Trusted sandboxes share the God root and are never a switch target.
        assert!(table.by_cr3(0x9000).is_none());
        assert!(table.get("-1").unwrap().trusted);
    }

    #[test]
    fn test_return_to_caller() {
        let mut regs = kvm_regs {
            rip: 0x1001,
            rcx: 0x40_1234,
            r11: 0x246,
            ..kvm_regs::default()
        };
        return_to_caller(&mut regs);
        assert_eq!(regs.rip, 0x40_1234);
        assert_eq!(regs.rflags, 0x246);
    }

    #[test]
    fn test_error_code_vectors() {
        let with: Vec<u64> = (0..32).filter(|v| has_error_code(*v)).collect();
        assert_eq!(with, vec![8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
    }
}
