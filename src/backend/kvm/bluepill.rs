//! Moving a host thread into the guest and back.
//!
//! A thread enters by executing `cli` in ring 3 with a tagged `rax`. The
//! resulting SIGSEGV lands in [`handle_fault`], which copies the signal
//! context into a vCPU and runs it on the signal stack. The guest carries on
//! from the instruction after `cli`. When the guest asks to leave, the vCPU
//! state is copied back into the signal context and returning from the
//! handler resumes the host thread right where the guest stopped.

use std::cell::{Cell, RefCell};
use std::sync::OnceLock;

use super::bindings::kvm_regs;
use super::machine::{Machine, Session, MACHINE};
use super::trap::Redpill;
use super::vcpu::{run_loop, KvmOps, Step, Vcpu};
use crate::error::{Error, Result};

/// High bits of `rax` on a bluepill; the low bits carry the vCPU index.
pub const BLUEPILL_MAGIC: u64 = 0x6c62_7078_0000_0000;
const TAG_MASK: u64 = 0xffff_ffff_0000_0000;

/// Smallest signal stack the run loop is given.
pub const MIN_SIGNAL_STACK: usize = 64 * 1024;

const ARCH_GET_FS: libc::c_int = 0x1003;
const ARCH_GET_GS: libc::c_int = 0x1004;

/// `FP_XSTATE_MAGIC1` of an extended signal frame.
const FP_XSTATE_MAGIC1: u32 = 0x4650_5853;
const FXSAVE_SIZE: usize = 512;
const XSAVE_MAX: usize = 4096;

core::arch::global_asm!(
    ".pushsection .text.litterbox_ring0, \"ax\"",
    ".balign 16",
    ".globl litterbox_bluepill",
    "litterbox_bluepill:",
    "mov rax, rdi",
    ".globl litterbox_bluepill_cli",
    "litterbox_bluepill_cli:",
    "cli",
    "ret",
    ".balign 16",
    ".globl litterbox_redpill",
    "litterbox_redpill:",
    "mov rax, -1",
    "syscall",
    "ret",
    ".popsection",
);

extern "C" {
    fn litterbox_bluepill(tag: u64);
    fn litterbox_bluepill_cli();
    fn litterbox_redpill(rdi: u64, rsi: u64, rdx: u64) -> i64;
}

thread_local! {
    /// vCPU index the calling thread holds.
    static CURRENT: Cell<Option<usize>> = const { Cell::new(None) };
    static ALT_STACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
}

static PREVIOUS: OnceLock<libc::sigaction> = OnceLock::new();

pub fn bluepill_cli() -> u64 {
    litterbox_bluepill_cli as usize as u64
}

/// Pages of the enter and leave stubs, run by sandboxed code.
pub fn stub_pages() -> Vec<u64> {
    let mut pages: Vec<u64> = [
        litterbox_bluepill as usize as u64,
        bluepill_cli(),
        litterbox_redpill as usize as u64,
    ]
    .iter()
    .map(|addr| addr & !(crate::memory::PAGE_SIZE - 1))
    .collect();
    pages.sort_unstable();
    pages.dedup();
    pages
}

/// vCPU held by the calling thread, if it is in the guest.
pub fn current() -> Option<usize> {
    CURRENT.with(|c| c.get())
}

/// Issue a redpill. Outside the guest this is an unknown system call and
/// returns `-ENOSYS`.
pub fn redpill(pill: Redpill) -> i64 {
    let (rdi, rsi, rdx) = pill.encode();
    // SAFETY: the stub only issues the system call.
    unsafe { litterbox_redpill(rdi, rsi, rdx) }
}

/// Whether the calling thread runs inside the guest.
pub fn in_guest() -> bool {
    redpill(Redpill::Check) == 1
}

/// Move the calling thread into `vcpu`, whose context is already set up.
/// Returns inside the guest.
pub fn enter(vcpu: &Vcpu) -> Result<()> {
    ensure_alt_stack()?;
    CURRENT.with(|c| c.set(Some(vcpu.index())));
    vcpu.count_entry();
    // SAFETY: traps into `handle_fault`, which runs the guest from the
    // instruction after `cli`.
    unsafe { litterbox_bluepill(BLUEPILL_MAGIC | vcpu.index() as u64) };
    Ok(())
}

/// Install the SIGSEGV handler, keeping the previous one for faults that
/// are not ours.
pub fn install_handler() -> Result<()> {
    if PREVIOUS.get().is_some() {
        return Ok(());
    }
    // SAFETY: sigaction with fully initialized structures.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut previous) != 0 {
            return Err(Error::last_os("sigaction SIGSEGV"));
        }
        if previous.sa_sigaction != handle_fault as usize {
            let _ = PREVIOUS.set(previous);
        }
    }
    crate::debug_kvm!("SIGSEGV handler installed");
    Ok(())
}

/// Per-thread signal stack, disabled when the thread exits.
struct AltStack {
    _memory: Box<[u8]>,
}

impl Drop for AltStack {
    fn drop(&mut self) {
        // SAFETY: disabling the alternate stack of the exiting thread.
        unsafe {
            let disable = libc::stack_t {
                ss_sp: std::ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            libc::sigaltstack(&disable, std::ptr::null_mut());
        }
    }
}

fn ensure_alt_stack() -> Result<()> {
    // SAFETY: querying the current alternate stack.
    let mut current: libc::stack_t = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaltstack(std::ptr::null(), &mut current) } != 0 {
        return Err(Error::last_os("sigaltstack"));
    }
    if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= MIN_SIGNAL_STACK {
        return Ok(());
    }
    let mut memory = vec![0u8; MIN_SIGNAL_STACK].into_boxed_slice();
    let stack = libc::stack_t {
        ss_sp: memory.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: memory.len(),
    };
    // SAFETY: the stack lives in ALT_STACK until the thread exits.
    if unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) } != 0 {
        return Err(Error::last_os("sigaltstack"));
    }
    ALT_STACK.with(|s| *s.borrow_mut() = Some(AltStack { _memory: memory }));
    Ok(())
}

extern "C" fn handle_fault(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    let uc = uctx as *mut libc::ucontext_t;
    // SAFETY: the kernel hands us a valid ucontext.
    let gregs = unsafe { &mut (*uc).uc_mcontext.gregs };
    let rax = gregs[libc::REG_RAX as usize] as u64;
    let rip = gregs[libc::REG_RIP as usize] as u64;

    if rip == bluepill_cli() && rax & TAG_MASK == BLUEPILL_MAGIC {
        let index = (rax & !TAG_MASK) as usize;
        if let Some(machine) = MACHINE.get() {
            if let Some(vcpu) = machine.vcpus.get(index) {
                // SAFETY: as above.
                unsafe { run_guest(machine, vcpu, &mut *uc) };
                return;
            }
        }
    }
    chain(sig, info, uctx);
}

fn chain(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    let Some(previous) = PREVIOUS.get() else {
        return reset_default(sig);
    };
    match previous.sa_sigaction {
        libc::SIG_DFL | libc::SIG_IGN => reset_default(sig),
        handler if previous.sa_flags & libc::SA_SIGINFO != 0 => {
            // SAFETY: the previous handler was installed for SA_SIGINFO.
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                unsafe { std::mem::transmute(handler) };
            f(sig, info, uctx)
        }
        handler => {
            // SAFETY: a plain one-argument handler.
            let f: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(handler) };
            f(sig)
        }
    }
}

/// Let the fault happen again, this time fatally.
fn reset_default(sig: libc::c_int) {
    // SAFETY: resetting a signal disposition.
    unsafe { libc::signal(sig, libc::SIG_DFL) };
}

/// Copy the signal context into the vCPU, run it, copy the result back.
///
/// # Safety
///
/// Must run in the SIGSEGV handler of the thread owning `vcpu`.
unsafe fn run_guest(machine: &Machine, vcpu: &Vcpu, uc: &mut libc::ucontext_t) {
    if vcpu.state.enter_guest().is_err() {
        fatal_message(b"litterbox: bluepill on a vCPU the thread does not own\n");
    }
    let ctx = vcpu.context();

    regs_from_context(&uc.uc_mcontext.gregs, &mut ctx.regs);
    // Resume after the cli.
    ctx.regs.rip += 1;
    if vcpu.set_regs(&ctx.regs).is_err() {
        fatal_message(b"litterbox: KVM_SET_REGS failed on entry\n");
    }

    let mut fs: u64 = 0;
    let mut gs: u64 = 0;
    libc::syscall(libc::SYS_arch_prctl, ARCH_GET_FS, &mut fs as *mut u64);
    libc::syscall(libc::SYS_arch_prctl, ARCH_GET_GS, &mut gs as *mut u64);
    ctx.sregs.fs.base = fs;
    ctx.sregs.gs.base = gs;
    ctx.sregs.cr3 = match ctx.active_cr3(machine.god_cr3) {
        Some(cr3) => cr3,
        None => fatal_message(b"litterbox: entry without a sandbox view\n"),
    };
    if vcpu.set_sregs(&ctx.sregs).is_err() {
        fatal_message(b"litterbox: KVM_SET_SREGS failed on entry\n");
    }

    if let Some(fpstate) = xsave_area(uc) {
        let dst = ctx.xsave.region.as_mut_ptr() as *mut u8;
        std::ptr::copy_nonoverlapping(fpstate.0, dst, fpstate.1);
        if vcpu.set_xsave(&ctx.xsave).is_err() {
            fatal_message(b"litterbox: KVM_SET_XSAVE failed on entry\n");
        }
    }

    let step = run_loop(&mut KvmOps::new(vcpu), &mut Session::new(machine, vcpu));

    let ctx = vcpu.context();
    regs_to_context(&ctx.regs, &mut uc.uc_mcontext.gregs);
    match step {
        Step::Bail | Step::Resume => {
            if let Some(fpstate) = xsave_area(uc) {
                if vcpu.get_xsave(&mut ctx.xsave).is_ok() {
                    let src = ctx.xsave.region.as_ptr() as *const u8;
                    std::ptr::copy_nonoverlapping(src, fpstate.0, fpstate.1);
                }
            }
            vcpu.state.leave_guest();
            machine.release(vcpu);
            CURRENT.with(|c| c.set(None));
        }
        Step::Die(fatal) => {
            vcpu.record_fatal(fatal);
            vcpu.state.leave_guest();
            divert_to_die(&mut uc.uc_mcontext.gregs, vcpu.index());
        }
    }
}

/// The FP state of a signal frame and how many bytes of it are valid.
unsafe fn xsave_area(uc: &libc::ucontext_t) -> Option<(*mut u8, usize)> {
    let base = uc.uc_mcontext.fpregs as *mut u8;
    if base.is_null() {
        return None;
    }
    // The software-reserved bytes of the legacy area describe the extended
    // state.
    let magic = std::ptr::read_unaligned(base.add(464) as *const u32);
    let size = if magic == FP_XSTATE_MAGIC1 {
        std::ptr::read_unaligned(base.add(480) as *const u32) as usize
    } else {
        FXSAVE_SIZE
    };
    Some((base, size.clamp(FXSAVE_SIZE, XSAVE_MAX)))
}

/// Make the interrupted thread "call" the die trampoline from the fault
/// site, so its report comes with a usable backtrace.
fn divert_to_die(gregs: &mut [libc::greg_t; 23], index: usize) {
    let rip = gregs[libc::REG_RIP as usize] as u64;
    // Skip the red zone, keep the ABI alignment for a call.
    let mut rsp = (gregs[libc::REG_RSP as usize] as u64 - 128) & !0xf;
    rsp -= 8;
    // SAFETY: the thread's own stack, below anything it uses.
    unsafe { std::ptr::write(rsp as *mut u64, rip) };
    gregs[libc::REG_RSP as usize] = rsp as i64;
    gregs[libc::REG_RIP as usize] = die as usize as i64;
    gregs[libc::REG_RDI as usize] = index as i64;
}

/// Print the report of vCPU `index` and abort.
extern "C" fn die(index: usize) -> ! {
    if let Some(vcpu) = MACHINE.get().and_then(|m| m.vcpus.get(index)) {
        // SAFETY: the dying thread still owns the vCPU.
        unsafe { vcpu.context() }.diagnostic.emit();
    }
    std::process::abort()
}

fn fatal_message(msg: &[u8]) -> ! {
    // SAFETY: plain write of a static buffer.
    unsafe { libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len()) };
    std::process::abort()
}

fn regs_from_context(gregs: &[libc::greg_t; 23], regs: &mut kvm_regs) {
    let g = |r: libc::c_int| gregs[r as usize] as u64;
    *regs = kvm_regs {
        rax: g(libc::REG_RAX),
        rbx: g(libc::REG_RBX),
        rcx: g(libc::REG_RCX),
        rdx: g(libc::REG_RDX),
        rsi: g(libc::REG_RSI),
        rdi: g(libc::REG_RDI),
        rsp: g(libc::REG_RSP),
        rbp: g(libc::REG_RBP),
        r8: g(libc::REG_R8),
        r9: g(libc::REG_R9),
        r10: g(libc::REG_R10),
        r11: g(libc::REG_R11),
        r12: g(libc::REG_R12),
        r13: g(libc::REG_R13),
        r14: g(libc::REG_R14),
        r15: g(libc::REG_R15),
        rip: g(libc::REG_RIP),
        rflags: g(libc::REG_EFL),
    };
}

fn regs_to_context(regs: &kvm_regs, gregs: &mut [libc::greg_t; 23]) {
    let pairs = [
        (libc::REG_RAX, regs.rax),
        (libc::REG_RBX, regs.rbx),
        (libc::REG_RCX, regs.rcx),
        (libc::REG_RDX, regs.rdx),
        (libc::REG_RSI, regs.rsi),
        (libc::REG_RDI, regs.rdi),
        (libc::REG_RSP, regs.rsp),
        (libc::REG_RBP, regs.rbp),
        (libc::REG_R8, regs.r8),
        (libc::REG_R9, regs.r9),
        (libc::REG_R10, regs.r10),
        (libc::REG_R11, regs.r11),
        (libc::REG_R12, regs.r12),
        (libc::REG_R13, regs.r13),
        (libc::REG_R14, regs.r14),
        (libc::REG_R15, regs.r15),
        (libc::REG_RIP, regs.rip),
        (libc::REG_EFL, regs.rflags),
    ];
    for (reg, value) in pairs {
        gregs[reg as usize] = value as libc::greg_t;
    }
}

/// XCR0 of the host, given to every vCPU.
pub fn host_xcr0() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: xgetbv is available whenever OSXSAVE is, which the KVM
    // backend requires.
    unsafe {
        core::arch::asm!(
            "xgetbv",
            in("ecx") 0,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        )
    };
    (hi as u64) << 32 | lo as u64
}
