//! What to do when a guest traps.
//!
//! Everything here runs inside the signal handler that drives the vCPU, so
//! it neither allocates nor locks: decisions are pure functions over the
//! current view, and diagnostics go to a fixed buffer written straight to
//! stderr.

use std::fmt::{self, Write};

use arrayvec::ArrayString;

use crate::backend::kvm::bindings::kvm_regs;
use crate::config::{Prot, SyscallMask};
use crate::memory::{AddressSpace, Physical};

/// `rax` of a redpill system call.
pub const REDPILL: u64 = !0;

const RED_EXIT: u64 = 0x111;
const RED_NORM: u64 = 0x555;
const RED_GOD: u64 = 0x777;
const RED_SWITCH: u64 = 0x888;
const RED_CHECK: u64 = 0x999;
const RED_FILLER: u64 = 0x222;
const RED_TRAILER: u64 = 0x333;

/// `syscall` encoding, as read little-endian from the instruction stream.
pub const SYSCALL_INSTR: u16 = 0x050f;

/// Requests a thread makes to the host through a system call that cannot
/// exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redpill {
    /// Leave the guest.
    Exit,
    /// Back to the view of the current sandbox.
    Norm,
    /// Full view of the process, every system call allowed.
    God,
    /// Switch to the view whose page-table root is this CR3.
    Switch(u64),
    /// Probe: returns 1 inside the guest. On the host the call fails with
    /// `ENOSYS`.
    Check,
}

impl Redpill {
    pub fn decode(rdi: u64, rsi: u64) -> Option<Self> {
        match rdi {
            RED_EXIT => Some(Redpill::Exit),
            RED_NORM => Some(Redpill::Norm),
            RED_GOD => Some(Redpill::God),
            RED_SWITCH => Some(Redpill::Switch(rsi)),
            RED_CHECK => Some(Redpill::Check),
            _ => None,
        }
    }

    /// Arguments `(rdi, rsi, rdx)` of the system call.
    pub fn encode(self) -> (u64, u64, u64) {
        match self {
            Redpill::Exit => (RED_EXIT, RED_FILLER, RED_TRAILER),
            Redpill::Norm => (RED_NORM, RED_FILLER, RED_TRAILER),
            Redpill::God => (RED_GOD, RED_FILLER, RED_TRAILER),
            Redpill::Switch(cr3) => (RED_SWITCH, cr3, RED_TRAILER),
            Redpill::Check => (RED_CHECK, RED_FILLER, RED_TRAILER),
        }
    }
}

/// Result of handling one trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Handled, continue the guest.
    Resume,
    /// Return the thread to the host.
    Bail,
    InvalidAddress,
    NotASyscall,
    /// The view covers the page but without write access.
    MissingWrite,
    /// The view grants the access yet the page faulted: a stale table.
    ShouldNotFault,
    /// Read or fetch of a page the view lacks.
    MissingReadExec,
    /// The address is not mapped in the process at all.
    InvalidAccess,
    InvalidSyscall,
    Exception,
    BrkOutOfRange,
}

impl TrapOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrapOutcome::Resume => "Valid",
            TrapOutcome::Bail => "Bail",
            TrapOutcome::InvalidAddress => "Invalid address",
            TrapOutcome::NotASyscall => "Not a syscall",
            TrapOutcome::MissingWrite => "PF trying to do a write",
            TrapOutcome::ShouldNotFault => "Should not page fault!",
            TrapOutcome::MissingReadExec => "PF trying to do a read or exec",
            TrapOutcome::InvalidAccess => "PF on an unmapped address",
            TrapOutcome::InvalidSyscall => "Invalid system call",
            TrapOutcome::Exception => "Received an exception",
            TrapOutcome::BrkOutOfRange => "brk outside of the C heap",
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, TrapOutcome::Resume | TrapOutcome::Bail)
    }
}

impl fmt::Display for TrapOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Questions the trap policy asks about a view.
pub trait AccessCheck {
    fn valid_address(&self, addr: u64) -> bool;
    fn has_rights(&self, addr: u64, prot: Prot) -> bool;
}

/// An address space together with the allocator its tables live in.
pub struct SpaceAccess<'a> {
    pub space: &'a AddressSpace,
    pub phys: &'a Physical,
}

impl AccessCheck for SpaceAccess<'_> {
    fn valid_address(&self, addr: u64) -> bool {
        self.space.valid_address(addr)
    }

    fn has_rights(&self, addr: u64, prot: Prot) -> bool {
        self.space.has_rights(self.phys, addr, prot)
    }
}

/// A guest system call as seen at the entry stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallFrame {
    pub nr: u64,
    pub args: [u64; 6],
    /// Return address, right after the `syscall` instruction.
    pub rip: u64,
}

impl SyscallFrame {
    pub fn from_regs(regs: &kvm_regs) -> Self {
        Self {
            nr: regs.rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            rip: regs.rcx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAction {
    Redpill(Redpill),
    /// Complete the call with this return value without running it.
    Emulate(u64),
    /// Run the call on the host and hand back its result.
    Forward,
    Reject(TrapOutcome),
}

/// Decide what happens to a system call made under `view`.
///
/// `read_instr` is only called once the caller's address is known to be
/// executable, and returns the two bytes before it.
pub fn check_syscall<V, G, F>(
    frame: &SyscallFrame,
    view: &V,
    god: &G,
    mask: &SyscallMask,
    c_heap: Option<(u64, u64)>,
    read_instr: F,
) -> SyscallAction
where
    V: AccessCheck,
    G: AccessCheck,
    F: FnOnce(u64) -> u16,
{
    let instr = frame.rip.wrapping_sub(2);
    if !view.valid_address(instr) || !god.has_rights(instr, Prot::X) {
        return SyscallAction::Reject(TrapOutcome::InvalidAddress);
    }
    if read_instr(instr) != SYSCALL_INSTR {
        return SyscallAction::Reject(TrapOutcome::NotASyscall);
    }

    if frame.nr == REDPILL {
        return match Redpill::decode(frame.args[0], frame.args[1]) {
            Some(pill) => SyscallAction::Redpill(pill),
            None => SyscallAction::Redpill(Redpill::Exit),
        };
    }

    if !mask.allows(frame.nr) {
        return SyscallAction::Reject(TrapOutcome::InvalidSyscall);
    }

    match frame.nr as i64 {
        libc::SYS_rt_sigprocmask | libc::SYS_sigaltstack => SyscallAction::Emulate(0),
        libc::SYS_brk => {
            let addr = frame.args[0];
            match c_heap {
                Some((start, end)) if !(start..end).contains(&addr) => {
                    SyscallAction::Reject(TrapOutcome::BrkOutOfRange)
                }
                _ => SyscallAction::Forward,
            }
        }
        _ => SyscallAction::Forward,
    }
}

/// Classify a guest page fault at `addr`.
pub fn classify_fault<V: AccessCheck, G: AccessCheck>(view: &V, god: &G, addr: u64) -> TrapOutcome {
    if view.valid_address(addr) {
        if view.has_rights(addr, Prot::R | Prot::W | Prot::USER) {
            return TrapOutcome::ShouldNotFault;
        }
        if god.has_rights(addr, Prot::R) {
            return TrapOutcome::MissingWrite;
        }
    }
    if god.has_rights(addr, Prot::R) {
        TrapOutcome::MissingReadExec
    } else {
        TrapOutcome::InvalidAccess
    }
}

/// Details of a fatal trap, formatted without allocating.
pub struct Diagnostic {
    buf: ArrayString<1024>,
}

impl Default for Diagnostic {
    fn default() -> Self {
        Self {
            buf: ArrayString::new(),
        }
    }
}

/// Trap-specific facts worth reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapDetails {
    pub vector: Option<u64>,
    pub error_code: Option<u64>,
    pub fault_addr: Option<u64>,
    pub syscall: Option<u64>,
}

impl Diagnostic {
    pub fn record(
        &mut self,
        outcome: TrapOutcome,
        sandbox: &str,
        regs: &kvm_regs,
        details: &TrapDetails,
    ) {
        self.buf.clear();
        // Overflow only truncates the report.
        let _ = self.format(outcome, sandbox, regs, details);
    }

    fn format(
        &mut self,
        outcome: TrapOutcome,
        sandbox: &str,
        regs: &kvm_regs,
        details: &TrapDetails,
    ) -> fmt::Result {
        let sandbox = if sandbox.is_empty() { "<host>" } else { sandbox };
        writeln!(self.buf, "litterbox: {} in sandbox {}", outcome.label(), sandbox)?;
        if let Some(vector) = details.vector {
            write!(self.buf, "  vector={}", vector)?;
            if let Some(code) = details.error_code {
                write!(self.buf, " error=0x{:x}", code)?;
            }
            self.buf.write_char('\n')?;
        }
        if let Some(addr) = details.fault_addr {
            writeln!(self.buf, "  fault address=0x{:x}", addr)?;
        }
        if let Some(nr) = details.syscall {
            writeln!(self.buf, "  syscall={}", nr)?;
        }
        writeln!(
            self.buf,
            "  rip=0x{:x} rsp=0x{:x} rbp=0x{:x} rflags=0x{:x}",
            regs.rip, regs.rsp, regs.rbp, regs.rflags
        )?;
        writeln!(
            self.buf,
            "  rax=0x{:x} rbx=0x{:x} rcx=0x{:x} rdx=0x{:x}",
            regs.rax, regs.rbx, regs.rcx, regs.rdx
        )?;
        writeln!(
            self.buf,
            "  rdi=0x{:x} rsi=0x{:x} r8=0x{:x} r9=0x{:x} r10=0x{:x} r11=0x{:x}",
            regs.rdi, regs.rsi, regs.r8, regs.r9, regs.r10, regs.r11
        )
    }

    /// Add a line to the current report.
    pub fn append(&mut self, args: fmt::Arguments<'_>) {
        let _ = self.buf.write_fmt(args);
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Write the report to stderr.
    pub fn emit(&self) {
        let bytes = self.buf.as_bytes();
        // SAFETY: plain write of a live buffer.
        unsafe { libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const CODE: u64 = 0x40_0000;
    const DATA: u64 = 0x60_0000;
    const SECRET: u64 = 0x80_0000;

    /// Page rights by page address.
    #[derive(Default)]
    struct FakeView(BTreeMap<u64, Prot>);

    impl FakeView {
        fn with(mut self, page: u64, prot: Prot) -> Self {
            self.0.insert(page, prot);
            self
        }
    }

    impl AccessCheck for FakeView {
        fn valid_address(&self, addr: u64) -> bool {
            self.0.contains_key(&(addr & !0xfff))
        }

        fn has_rights(&self, addr: u64, prot: Prot) -> bool {
            self.0.get(&(addr & !0xfff)).map_or(false, |p| p.contains(prot))
        }
    }

    fn god() -> FakeView {
        FakeView::default()
            .with(CODE, Prot::R | Prot::X | Prot::USER)
            .with(DATA, Prot::HEAP)
            .with(SECRET, Prot::HEAP)
    }

    fn sandbox() -> FakeView {
        FakeView::default()
            .with(CODE, Prot::R | Prot::X | Prot::USER)
            .with(DATA, Prot::R | Prot::USER)
    }

    fn call(nr: u64, args: [u64; 6]) -> SyscallFrame {
        SyscallFrame {
            nr,
            args,
            rip: CODE + 0x102,
        }
    }

    fn check(frame: &SyscallFrame, mask: &SyscallMask) -> SyscallAction {
        check_syscall(frame, &sandbox(), &god(), mask, Some((DATA, DATA + 0x1000)), |_| {
            SYSCALL_INSTR
        })
    }

    #[test]
    fn test_redpills() {
        let mask = SyscallMask::NONE;
        for pill in [
            Redpill::Exit,
            Redpill::Norm,
            Redpill::God,
            Redpill::Switch(0x1234_5000),
            Redpill::Check,
        ] {
            let (rdi, rsi, rdx) = pill.encode();
            assert_eq!(rdx, RED_TRAILER);
            let frame = call(REDPILL, [rdi, rsi, rdx, 0, 0, 0]);
            assert_eq!(check(&frame, &mask), SyscallAction::Redpill(pill));
        }
        let unknown = call(REDPILL, [0x42, 0, 0, 0, 0, 0]);
        assert_eq!(check(&unknown, &mask), SyscallAction::Redpill(Redpill::Exit));
    }

    #[test]
    fn test_syscall_filtering() {
        let mask = SyscallMask::from_numbers(&[libc::SYS_write, libc::SYS_brk]);
        let write = call(libc::SYS_write as u64, [1, 0, 0, 0, 0, 0]);
        assert_eq!(check(&write, &mask), SyscallAction::Forward);

        let open = call(libc::SYS_openat as u64, [0; 6]);
        assert_eq!(
            check(&open, &mask),
            SyscallAction::Reject(TrapOutcome::InvalidSyscall)
        );
        assert_eq!(check(&open, &SyscallMask::ALL), SyscallAction::Forward);

        let sigmask = call(libc::SYS_rt_sigprocmask as u64, [0; 6]);
        assert_eq!(check(&sigmask, &SyscallMask::ALL), SyscallAction::Emulate(0));
    }

    #[test]
    fn test_brk_stays_in_c_heap() {
        let mask = SyscallMask::ALL;
        let brk = |addr| call(libc::SYS_brk as u64, [addr, 0, 0, 0, 0, 0]);
        assert_eq!(check(&brk(DATA), &mask), SyscallAction::Forward);
        assert_eq!(check(&brk(DATA + 0x800), &mask), SyscallAction::Forward);
        assert_eq!(check(&brk(DATA + 0xfff), &mask), SyscallAction::Forward);
        for addr in [0, DATA + 0x1000, SECRET] {
            assert_eq!(
                check(&brk(addr), &mask),
                SyscallAction::Reject(TrapOutcome::BrkOutOfRange),
                "brk({:#x})",
                addr
            );
        }
    }

    #[test]
    fn test_syscall_origin() {
        let mask = SyscallMask::ALL;
        let mut frame = call(libc::SYS_getpid as u64, [0; 6]);
        frame.rip = SECRET + 0x10;
        assert_eq!(
            check(&frame, &mask),
            SyscallAction::Reject(TrapOutcome::InvalidAddress)
        );

        frame.rip = CODE + 0x10;
        let action = check_syscall(&frame, &sandbox(), &god(), &mask, None, |_| 0x80cd);
        assert_eq!(action, SyscallAction::Reject(TrapOutcome::NotASyscall));
    }

    #[test]
    fn test_classify_fault() {
        let view = sandbox();
        let god = god();
        assert_eq!(classify_fault(&view, &god, DATA + 8), TrapOutcome::MissingWrite);
        assert_eq!(
            classify_fault(&view, &god, SECRET),
            TrapOutcome::MissingReadExec
        );
        assert_eq!(
            classify_fault(&view, &god, 0x1000),
            TrapOutcome::InvalidAccess
        );
        let stale = FakeView::default().with(DATA, Prot::HEAP);
        assert_eq!(classify_fault(&stale, &god, DATA), TrapOutcome::ShouldNotFault);
    }

    #[test]
    fn test_labels_distinct() {
        let outcomes = [
            TrapOutcome::InvalidAddress,
            TrapOutcome::NotASyscall,
            TrapOutcome::MissingWrite,
            TrapOutcome::ShouldNotFault,
            TrapOutcome::MissingReadExec,
            TrapOutcome::InvalidAccess,
            TrapOutcome::InvalidSyscall,
            TrapOutcome::Exception,
            TrapOutcome::BrkOutOfRange,
        ];
        let labels: std::collections::BTreeSet<_> = outcomes.iter().map(|o| o.label()).collect();
        assert_eq!(labels.len(), outcomes.len());
        assert!(outcomes.iter().all(TrapOutcome::is_fatal));
        assert!(!TrapOutcome::Resume.is_fatal());
    }

    #[test]
    fn test_diagnostic() {
        let regs = kvm_regs {
            rip: 0x40_1234,
            rsp: 0x7ff0_0000,
            ..kvm_regs::default()
        };
        let mut diag = Diagnostic::default();
        diag.record(
            TrapOutcome::MissingWrite,
            "sb1",
            &regs,
            &TrapDetails {
                vector: Some(14),
                error_code: Some(0x7),
                fault_addr: Some(0x60_0008),
                syscall: None,
            },
        );
        let text = diag.as_str();
        assert!(text.starts_with("litterbox: PF trying to do a write in sandbox sb1\n"));
        assert!(text.contains("vector=14 error=0x7"));
        assert!(text.contains("fault address=0x600008"));
        assert!(text.contains("rip=0x401234"));

        diag.record(TrapOutcome::Exception, "", &regs, &TrapDetails::default());
        assert!(diag.as_str().contains("in sandbox <host>"));
        assert!(!diag.as_str().contains("fault address"));
    }
}
