//! KVM vCPU management and the run loop.

use std::cell::UnsafeCell;
use std::fmt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayString;

use super::bindings::{self, ioctl, kvm_regs, kvm_run, kvm_sregs, kvm_xsave};
use super::ring0::{self, KernelTables, VECTOR_BOUNCE};
use super::trap::{Diagnostic, TrapDetails, TrapOutcome};
use crate::backend::Stats;
use crate::config::SyscallMask;
use crate::error::{Error, Result};

/// Longest sandbox id a vCPU can carry.
pub const SANDBOX_ID_CAP: usize = 128;

/// Ownership of a vCPU: `READY` when free, `USER` once a thread owns it,
/// `USER | GUEST` while that thread runs inside the guest.
#[derive(Debug, Default)]
pub struct VcpuState(AtomicU32);

impl VcpuState {
    pub const READY: u32 = 0;
    pub const USER: u32 = 1 << 0;
    pub const GUEST: u32 = 1 << 1;

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Claim a free vCPU.
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(Self::READY, Self::USER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark guest entry. Fails with the previous state unless the caller
    /// owned the vCPU without being in the guest.
    pub fn enter_guest(&self) -> std::result::Result<(), u32> {
        match self.0.swap(Self::USER | Self::GUEST, Ordering::AcqRel) {
            Self::USER => Ok(()),
            other => {
                self.0.store(other, Ordering::Release);
                Err(other)
            }
        }
    }

    pub fn leave_guest(&self) {
        self.0.store(Self::USER, Ordering::Release);
    }

    pub fn release(&self) {
        self.0.store(Self::READY, Ordering::Release);
    }
}

/// Why the run loop gave up on the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    Trap(TrapOutcome),
    /// Unexpected exit reason.
    Exit(&'static str),
    /// A KVM call failed with this errno.
    Errno(&'static str, i32),
}

impl Fatal {
    pub fn label(&self) -> &'static str {
        match self {
            Fatal::Trap(outcome) => outcome.label(),
            Fatal::Exit(label) | Fatal::Errno(label, _) => label,
        }
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::Errno(label, errno) => write!(f, "{} (errno {})", label, errno),
            other => f.write_str(other.label()),
        }
    }
}

/// What the loop does after a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Resume,
    Bail,
    Die(Fatal),
}

/// Operations the run loop needs from a vCPU.
pub trait VcpuOps {
    /// Enter the guest until the next exit. Returns the exit reason or the
    /// errno of the failed run.
    fn run(&mut self) -> std::result::Result<u32, i32>;

    fn ready_for_interrupt(&self) -> bool;

    fn request_interrupt_window(&mut self, on: bool);

    /// Consume a pending bounce signal, if any.
    fn take_bounce(&mut self) -> bool;

    fn inject_interrupt(&mut self, vector: u32) -> std::result::Result<(), i32>;

    fn inject_nmi(&mut self) -> std::result::Result<(), i32>;
}

/// Decides what a halt at an entry stub means.
pub trait HaltHandler {
    fn halted(&mut self) -> Step;
}

/// Drive the guest until it asks to leave or breaks a rule.
pub fn run_loop<O: VcpuOps, H: HaltHandler>(ops: &mut O, handler: &mut H) -> Step {
    loop {
        let reason = match ops.run() {
            Ok(reason) => reason,
            Err(libc::EINTR) => {
                if !ops.take_bounce() {
                    continue;
                }
                if !ops.ready_for_interrupt() {
                    // Interrupts are masked: ask to be told when they are not
                    // and inject then.
                    ops.request_interrupt_window(true);
                    continue;
                }
                bindings::KVM_EXIT_IRQ_WINDOW_OPEN
            }
            Err(libc::EFAULT) => {
                if let Err(errno) = ops.inject_nmi() {
                    return Step::Die(Fatal::Errno("NMI injection failed", errno));
                }
                continue;
            }
            Err(libc::ENOSPC) => return Step::Die(Fatal::Errno("run out of space", libc::ENOSPC)),
            Err(errno) => return Step::Die(Fatal::Errno("run failed", errno)),
        };

        match reason {
            bindings::KVM_EXIT_HLT => match handler.halted() {
                Step::Resume => continue,
                other => return other,
            },
            bindings::KVM_EXIT_IRQ_WINDOW_OPEN => {
                if let Err(errno) = ops.inject_interrupt(VECTOR_BOUNCE as u32) {
                    return Step::Die(Fatal::Errno("interrupt injection failed", errno));
                }
                ops.request_interrupt_window(false);
            }
            bindings::KVM_EXIT_INTR => continue,
            bindings::KVM_EXIT_MMIO => return Step::Die(Fatal::Exit("MMIO access")),
            bindings::KVM_EXIT_IO => return Step::Die(Fatal::Exit("port I/O")),
            bindings::KVM_EXIT_EXCEPTION => return Step::Die(Fatal::Exit("exception exit")),
            bindings::KVM_EXIT_HYPERCALL => return Step::Die(Fatal::Exit("hypercall")),
            bindings::KVM_EXIT_DEBUG => return Step::Die(Fatal::Exit("debug exit")),
            bindings::KVM_EXIT_SHUTDOWN => return Step::Die(Fatal::Exit("guest shutdown")),
            bindings::KVM_EXIT_FAIL_ENTRY => return Step::Die(Fatal::Exit("entry failure")),
            bindings::KVM_EXIT_INTERNAL_ERROR => return Step::Die(Fatal::Exit("internal error")),
            _ => return Step::Die(Fatal::Exit("unknown exit reason")),
        }
    }
}

/// Enforcement state and scratch space of a vCPU, owned by the thread that
/// holds the vCPU.
pub struct VcpuContext {
    pub sandbox: ArrayString<SANDBOX_ID_CAP>,
    /// Root of the sandbox view.
    pub cr3: u64,
    pub mask: SyscallMask,
    /// Running on the God view with every system call allowed.
    pub god: bool,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub xsave: kvm_xsave,
    pub details: TrapDetails,
    pub diagnostic: Diagnostic,
}

impl VcpuContext {
    fn new() -> Self {
        Self {
            sandbox: ArrayString::new(),
            cr3: 0,
            mask: SyscallMask::ALL,
            god: true,
            regs: kvm_regs::default(),
            sregs: kvm_sregs::default(),
            xsave: kvm_xsave::default(),
            details: TrapDetails::default(),
            diagnostic: Diagnostic::default(),
        }
    }

    /// Enforce `sandbox` with the view rooted at `cr3`. Runs on the trap
    /// path, so failures are static.
    pub fn set_sandbox(
        &mut self,
        sandbox: &str,
        cr3: u64,
        mask: SyscallMask,
    ) -> std::result::Result<(), Fatal> {
        self.sandbox.clear();
        self.sandbox
            .try_push_str(sandbox)
            .map_err(|_| Fatal::Exit("sandbox id too long"))?;
        self.cr3 = cr3;
        self.mask = mask;
        self.god = false;
        Ok(())
    }

    /// Drop from the God view back to the sandbox view. Returns its root.
    pub fn leave_god(&mut self) -> std::result::Result<u64, Fatal> {
        if self.cr3 == 0 {
            return Err(Fatal::Exit("norm without a sandbox view"));
        }
        self.god = false;
        Ok(self.cr3)
    }

    /// Root the guest runs on, `None` when no sandbox view was ever set.
    pub fn active_cr3(&self, god_cr3: u64) -> Option<u64> {
        match (self.god, self.cr3) {
            (true, _) => Some(god_cr3),
            (false, 0) => None,
            (false, cr3) => Some(cr3),
        }
    }
}

/// A KVM vCPU together with its run page and counters.
pub struct Vcpu {
    index: usize,
    fd: OwnedFd,
    run: NonNull<kvm_run>,
    run_size: usize,
    pub state: VcpuState,
    /// Thread owning the vCPU, 0 when free.
    pub tid: AtomicI32,
    context: UnsafeCell<VcpuContext>,
    entries: AtomicU64,
    exits: AtomicU64,
    escapes: AtomicU64,
}

// SAFETY: the run page and context are only touched by the thread that
// acquired the vCPU through `state`; counters are atomic.
unsafe impl Send for Vcpu {}
unsafe impl Sync for Vcpu {}

/// Per-VM settings every vCPU is created with.
pub struct VcpuSetup<'a> {
    pub vm: RawFd,
    pub run_size: usize,
    pub cpuid: &'a bindings::kvm_cpuid2,
    pub xcr0: u64,
}

impl Vcpu {
    pub fn new(index: usize, setup: &VcpuSetup<'_>, tables: &KernelTables) -> Result<Self> {
        // SAFETY: KVM_CREATE_VCPU takes the vCPU id by value.
        let fd = unsafe { ioctl(setup.vm, bindings::KVM_CREATE_VCPU, index as u64) }
            .map_err(|e| Error::VcpuError(format!("KVM_CREATE_VCPU {}: errno {}", index, e)))?;
        // SAFETY: freshly returned descriptor we own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: shared mapping of the vCPU fd, checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                setup.run_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os("vCPU run page mmap"));
        }
        let run = NonNull::new(ptr as *mut kvm_run)
            .ok_or_else(|| Error::VcpuError("run page mapped at null".into()))?;

        let vcpu = Self {
            index,
            fd,
            run,
            run_size: setup.run_size,
            state: VcpuState::default(),
            tid: AtomicI32::new(0),
            context: UnsafeCell::new(VcpuContext::new()),
            entries: AtomicU64::new(0),
            exits: AtomicU64::new(0),
            escapes: AtomicU64::new(0),
        };
        vcpu.init(setup, tables)?;
        crate::debug_kvm!("vCPU {} created", index);
        Ok(vcpu)
    }

    fn init(&self, setup: &VcpuSetup<'_>, tables: &KernelTables) -> Result<()> {
        self.vcpu_ioctl("KVM_SET_CPUID2", bindings::KVM_SET_CPUID2, setup.cpuid as *const _ as u64)?;

        // Only the bounce signal may interrupt KVM_RUN.
        let blocked: u64 = !(1u64 << (libc::SIGCHLD - 1));
        let mask = bindings::kvm_signal_mask {
            len: 8,
            sigset: blocked.to_le_bytes(),
        };
        self.vcpu_ioctl("KVM_SET_SIGNAL_MASK", bindings::KVM_SET_SIGNAL_MASK, &mask as *const _ as u64)?;

        let msr = |index, data| bindings::kvm_msr_entry {
            index,
            reserved: 0,
            data,
        };
        let msrs = bindings::kvm_msrs::<5> {
            nmsrs: 5,
            pad: 0,
            entries: [
                msr(bindings::MSR_STAR, ring0::STAR),
                msr(bindings::MSR_LSTAR, ring0::syscall_entry()),
                msr(bindings::MSR_CSTAR, 0),
                msr(bindings::MSR_SYSCALL_MASK, ring0::SYSCALL_MASK),
                msr(bindings::MSR_KERNEL_GS_BASE, 0),
            ],
        };
        // KVM_SET_MSRS returns how many entries were written.
        // SAFETY: `msrs` is a live kvm_msrs with `nmsrs` entries.
        let written = unsafe { ioctl(self.fd.as_raw_fd(), bindings::KVM_SET_MSRS, &msrs as *const _ as u64) }
            .map_err(|e| Error::VcpuError(format!("KVM_SET_MSRS: errno {}", e)))?;
        if written != 5 {
            return Err(Error::VcpuError(format!("KVM_SET_MSRS wrote {} of 5", written)));
        }

        let mut xcrs = bindings::kvm_xcrs {
            nr_xcrs: 1,
            ..bindings::kvm_xcrs::default()
        };
        xcrs.xcrs[0].value = setup.xcr0;
        self.vcpu_ioctl("KVM_SET_XCRS", bindings::KVM_SET_XCRS, &xcrs as *const _ as u64)?;

        // SAFETY: nobody else holds the vCPU during construction.
        let ctx = unsafe { self.context() };
        ctx.sregs = kvm_sregs {
            cs: ring0::user_code_segment(),
            ds: ring0::user_data_segment(0),
            es: ring0::user_data_segment(0),
            fs: ring0::user_data_segment(0),
            gs: ring0::user_data_segment(0),
            ss: ring0::user_data_segment(0),
            tr: ring0::task_segment(tables.tss_base()),
            gdt: tables.gdt_table(),
            idt: tables.idt_table(),
            cr0: ring0::CR0,
            cr4: ring0::CR4,
            efer: ring0::EFER,
            ..kvm_sregs::default()
        };
        Ok(())
    }

    fn vcpu_ioctl(&self, name: &str, request: u64, arg: u64) -> Result<()> {
        // SAFETY: callers pass a pointer to the structure `request` expects.
        unsafe { ioctl(self.fd.as_raw_fd(), request, arg) }
            .map(|_| ())
            .map_err(|e| Error::VcpuError(format!("{}: errno {}", name, e)))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// # Safety
    ///
    /// The caller must own the vCPU (state not `READY`), or be building it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context(&self) -> &mut VcpuContext {
        &mut *self.context.get()
    }

    /// # Safety
    ///
    /// Same as [`context`](Self::context).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn run_page(&self) -> &mut kvm_run {
        &mut *self.run.as_ptr()
    }

    pub fn count_entry(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_exit(&self) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_escape(&self) {
        self.escapes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.entries.load(Ordering::Relaxed),
            exits: self.exits.load(Ordering::Relaxed),
            escapes: self.escapes.load(Ordering::Relaxed),
        }
    }

    pub fn get_regs(&self, regs: &mut kvm_regs) -> std::result::Result<(), i32> {
        // SAFETY: `regs` is a live kvm_regs.
        unsafe { ioctl(self.fd(), bindings::KVM_GET_REGS, regs as *mut _ as u64) }.map(|_| ())
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> std::result::Result<(), i32> {
        // SAFETY: as above.
        unsafe { ioctl(self.fd(), bindings::KVM_SET_REGS, regs as *const _ as u64) }.map(|_| ())
    }

    pub fn get_sregs(&self, sregs: &mut kvm_sregs) -> std::result::Result<(), i32> {
        // SAFETY: `sregs` is a live kvm_sregs.
        unsafe { ioctl(self.fd(), bindings::KVM_GET_SREGS, sregs as *mut _ as u64) }.map(|_| ())
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> std::result::Result<(), i32> {
        // SAFETY: as above.
        unsafe { ioctl(self.fd(), bindings::KVM_SET_SREGS, sregs as *const _ as u64) }.map(|_| ())
    }

    pub fn get_xsave(&self, xsave: &mut kvm_xsave) -> std::result::Result<(), i32> {
        // SAFETY: `xsave` is a live 4 KiB image.
        unsafe { ioctl(self.fd(), bindings::KVM_GET_XSAVE, xsave as *mut _ as u64) }.map(|_| ())
    }

    pub fn set_xsave(&self, xsave: &kvm_xsave) -> std::result::Result<(), i32> {
        // SAFETY: as above.
        unsafe { ioctl(self.fd(), bindings::KVM_SET_XSAVE, xsave as *const _ as u64) }.map(|_| ())
    }

    /// Point the guest at page-table root `cr3`, using `sregs` as scratch.
    pub fn write_cr3(&self, sregs: &mut kvm_sregs, cr3: u64) -> std::result::Result<(), i32> {
        self.get_sregs(sregs)?;
        sregs.cr3 = cr3;
        self.set_sregs(sregs)
    }

    /// Record a fatal trap for the report printed on the way out.
    pub fn record_fatal(&self, fatal: Fatal) {
        // SAFETY: only the owning thread reports.
        let ctx = unsafe { self.context() };
        let outcome = match fatal {
            Fatal::Trap(outcome) => outcome,
            _ => TrapOutcome::Exception,
        };
        let sandbox = if ctx.god { "" } else { ctx.sandbox.as_str() };
        ctx.diagnostic.record(outcome, sandbox, &ctx.regs, &ctx.details);
        if !matches!(fatal, Fatal::Trap(_)) {
            ctx.diagnostic.append(format_args!("  exit: {}\n", fatal));
        }
    }
}

impl Drop for Vcpu {
    fn drop(&mut self) {
        // SAFETY: we own the run page mapping.
        unsafe { libc::munmap(self.run.as_ptr() as *mut libc::c_void, self.run_size) };
    }
}

/// [`VcpuOps`] over a real KVM vCPU.
pub struct KvmOps<'a> {
    vcpu: &'a Vcpu,
}

impl<'a> KvmOps<'a> {
    pub fn new(vcpu: &'a Vcpu) -> Self {
        Self { vcpu }
    }
}

impl VcpuOps for KvmOps<'_> {
    fn run(&mut self) -> std::result::Result<u32, i32> {
        // SAFETY: KVM_RUN takes no argument.
        unsafe { ioctl(self.vcpu.fd(), bindings::KVM_RUN, 0) }?;
        // SAFETY: the owning thread reads its own run page.
        Ok(unsafe { self.vcpu.run_page() }.exit_reason)
    }

    fn ready_for_interrupt(&self) -> bool {
        // SAFETY: as above.
        unsafe { self.vcpu.run_page() }.ready_for_interrupt_injection != 0
    }

    fn request_interrupt_window(&mut self, on: bool) {
        // SAFETY: as above.
        unsafe { self.vcpu.run_page() }.request_interrupt_window = on as u8;
    }

    fn take_bounce(&mut self) -> bool {
        // SAFETY: plain signal set manipulation on stack values.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCHLD);
            let timeout = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            libc::syscall(
                libc::SYS_rt_sigtimedwait,
                &set as *const libc::sigset_t,
                std::ptr::null_mut::<libc::siginfo_t>(),
                &timeout as *const libc::timespec,
                8usize,
            ) >= 0
        }
    }

    fn inject_interrupt(&mut self, vector: u32) -> std::result::Result<(), i32> {
        let irq = bindings::kvm_interrupt { irq: vector };
        // SAFETY: `irq` is a live kvm_interrupt.
        unsafe { ioctl(self.vcpu.fd(), bindings::KVM_INTERRUPT, &irq as *const _ as u64) }.map(|_| ())
    }

    fn inject_nmi(&mut self) -> std::result::Result<(), i32> {
        // SAFETY: KVM_NMI takes no argument.
        unsafe { ioctl(self.vcpu.fd(), bindings::KVM_NMI, 0) }.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a script of run results.
    #[derive(Default)]
    struct Script {
        runs: VecDeque<std::result::Result<u32, i32>>,
        ready: bool,
        bounces: usize,
        window: bool,
        injected: Vec<u32>,
        nmis: usize,
    }

    impl VcpuOps for Script {
        fn run(&mut self) -> std::result::Result<u32, i32> {
            let next = self.runs.pop_front().unwrap_or(Ok(bindings::KVM_EXIT_SHUTDOWN));
            // The guest opens its interrupt window after one more run.
            if self.window {
                self.ready = true;
            }
            next
        }

        fn ready_for_interrupt(&self) -> bool {
            self.ready
        }

        fn request_interrupt_window(&mut self, on: bool) {
            self.window = on;
        }

        fn take_bounce(&mut self) -> bool {
            if self.bounces > 0 {
                self.bounces -= 1;
                true
            } else {
                false
            }
        }

        fn inject_interrupt(&mut self, vector: u32) -> std::result::Result<(), i32> {
            self.injected.push(vector);
            Ok(())
        }

        fn inject_nmi(&mut self) -> std::result::Result<(), i32> {
            self.nmis += 1;
            Ok(())
        }
    }

    struct Halts(VecDeque<Step>);

    impl HaltHandler for Halts {
        fn halted(&mut self) -> Step {
            self.0.pop_front().unwrap_or(Step::Bail)
        }
    }

    fn script(runs: &[std::result::Result<u32, i32>]) -> Script {
        Script {
            runs: runs.iter().copied().collect(),
            ..Script::default()
        }
    }

    #[test]
    fn test_state_machine() {
        let state = VcpuState::default();
        assert_eq!(state.enter_guest(), Err(VcpuState::READY));
        assert!(state.try_acquire());
        assert!(!state.try_acquire());
        state.enter_guest().unwrap();
        assert_eq!(state.load(), VcpuState::USER | VcpuState::GUEST);
        assert_eq!(state.enter_guest(), Err(VcpuState::USER | VcpuState::GUEST));
        state.leave_guest();
        assert_eq!(state.load(), VcpuState::USER);
        state.release();
        assert!(state.try_acquire());
    }

    #[test]
    fn test_halts_resume_until_bail() {
        let mut ops = script(&[
            Ok(bindings::KVM_EXIT_HLT),
            Ok(bindings::KVM_EXIT_INTR),
            Ok(bindings::KVM_EXIT_HLT),
        ]);
        let mut halts = Halts(VecDeque::from([Step::Resume, Step::Bail]));
        assert_eq!(run_loop(&mut ops, &mut halts), Step::Bail);
        assert!(ops.runs.is_empty());
    }

    #[test]
    fn test_fatal_halt_stops() {
        let mut ops = script(&[Ok(bindings::KVM_EXIT_HLT)]);
        let fatal = Step::Die(Fatal::Trap(TrapOutcome::MissingWrite));
        let mut halts = Halts(VecDeque::from([fatal]));
        assert_eq!(run_loop(&mut ops, &mut halts), fatal);
    }

    #[test]
    fn test_interrupt_waits_for_window() {
        let mut ops = script(&[
            Err(libc::EINTR),
            Ok(bindings::KVM_EXIT_IRQ_WINDOW_OPEN),
            Ok(bindings::KVM_EXIT_HLT),
        ]);
        ops.bounces = 1;
        let mut halts = Halts(VecDeque::new());
        assert_eq!(run_loop(&mut ops, &mut halts), Step::Bail);
        assert_eq!(ops.injected, vec![VECTOR_BOUNCE as u32]);
        assert!(!ops.window);
    }

    #[test]
    fn test_interrupt_injected_when_ready() {
        let mut ops = script(&[Err(libc::EINTR), Err(libc::EINTR), Ok(bindings::KVM_EXIT_HLT)]);
        ops.ready = true;
        ops.bounces = 1;
        let mut halts = Halts(VecDeque::new());
        assert_eq!(run_loop(&mut ops, &mut halts), Step::Bail);
        // The second interruption carried no bounce.
        assert_eq!(ops.injected.len(), 1);
    }

    #[test]
    fn test_run_errors() {
        let mut ops = script(&[Err(libc::EFAULT), Err(libc::ENOSPC)]);
        let mut halts = Halts(VecDeque::new());
        assert_eq!(
            run_loop(&mut ops, &mut halts),
            Step::Die(Fatal::Errno("run out of space", libc::ENOSPC))
        );
        assert_eq!(ops.nmis, 1);

        for (reason, label) in [
            (bindings::KVM_EXIT_MMIO, "MMIO access"),
            (bindings::KVM_EXIT_SHUTDOWN, "guest shutdown"),
            (bindings::KVM_EXIT_FAIL_ENTRY, "entry failure"),
            (bindings::KVM_EXIT_INTERNAL_ERROR, "internal error"),
            (99, "unknown exit reason"),
        ] {
            let mut ops = script(&[Ok(reason)]);
            assert_eq!(run_loop(&mut ops, &mut halts), Step::Die(Fatal::Exit(label)));
        }
    }

    #[test]
    fn test_context_sandbox() {
        let mut ctx = VcpuContext::new();
        assert!(ctx.god);
        ctx.set_sandbox("sb1", 0x1000, SyscallMask::NONE).unwrap();
        assert_eq!(ctx.sandbox.as_str(), "sb1");
        assert!(!ctx.god);
        let long = "x".repeat(SANDBOX_ID_CAP + 1);
        assert_eq!(
            ctx.set_sandbox(&long, 0, SyscallMask::ALL),
            Err(Fatal::Exit("sandbox id too long"))
        );
    }

    #[test]
    fn test_norm_needs_sandbox_view() {
        let mut ctx = VcpuContext::new();
        assert_eq!(ctx.active_cr3(0x9000), Some(0x9000));
        assert_eq!(
            ctx.leave_god(),
            Err(Fatal::Exit("norm without a sandbox view"))
        );
        // Still on the God view.
        assert!(ctx.god);

        ctx.god = false;
        assert_eq!(ctx.active_cr3(0x9000), None);

        ctx.set_sandbox("sb1", 0x1000, SyscallMask::NONE).unwrap();
        ctx.god = true;
        assert_eq!(ctx.leave_god(), Ok(0x1000));
        assert!(!ctx.god);
        assert_eq!(ctx.active_cr3(0x9000), Some(0x1000));
    }
}
