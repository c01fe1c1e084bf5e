//! The guest kernel: descriptor tables and ring-0 entry stubs.
//!
//! Sandboxed code runs in guest ring 3 on the thread's own registers and
//! stack. The kernel only exists to bounce traps to the host: `syscall`
//! enters [`litterbox_syscall_entry`], which halts; an exception enters a
//! per-vector stub, which pushes its vector and halts. The host inspects the
//! vCPU through KVM, then resumes the stub, which returns to ring 3.

use std::ptr::NonNull;

use crate::backend::kvm::bindings::{kvm_dtable, kvm_segment};
use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_DS: u16 = 0x18 | 3;
pub const USER_CS: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

const GDT_ENTRIES: usize = 8;
const IDT_ENTRIES: usize = 256;
/// Exception vectors with a stub.
pub const EXCEPTION_VECTORS: usize = 32;
pub const KERNEL_STACK_SIZE: usize = 0x4000;

pub const VECTOR_BREAKPOINT: u64 = 3;
pub const VECTOR_PAGE_FAULT: u64 = 14;
/// Injected to kick a vCPU out of the guest.
pub const VECTOR_BOUNCE: u64 = 20;

pub mod cr0 {
    pub const PE: u64 = 1 << 0;
    pub const MP: u64 = 1 << 1;
    pub const ET: u64 = 1 << 4;
    pub const NE: u64 = 1 << 5;
    pub const WP: u64 = 1 << 16;
    pub const AM: u64 = 1 << 18;
    pub const PG: u64 = 1 << 31;
}

pub mod cr4 {
    pub const PAE: u64 = 1 << 5;
    pub const OSFXSR: u64 = 1 << 9;
    pub const OSXMMEXCPT: u64 = 1 << 10;
    pub const FSGSBASE: u64 = 1 << 16;
    pub const OSXSAVE: u64 = 1 << 18;
}

pub mod efer {
    pub const SCE: u64 = 1 << 0;
    pub const LME: u64 = 1 << 8;
    pub const LMA: u64 = 1 << 10;
    pub const NXE: u64 = 1 << 11;
}

pub const CR0: u64 = cr0::PE | cr0::MP | cr0::ET | cr0::NE | cr0::WP | cr0::AM | cr0::PG;
pub const CR4: u64 = cr4::PAE | cr4::OSFXSR | cr4::OSXMMEXCPT | cr4::FSGSBASE | cr4::OSXSAVE;
pub const EFER: u64 = efer::SCE | efer::LME | efer::LMA | efer::NXE;

/// `syscall` loads the kernel selectors, `sysret` the user ones right above
/// the kernel data segment.
pub const STAR: u64 = ((KERNEL_DS as u64 | 3) << 48) | ((KERNEL_CS as u64) << 32);

/// RFLAGS bits cleared on `syscall`: TF, IF, DF and AC.
pub const SYSCALL_MASK: u64 = 0x100 | 0x200 | 0x400 | 0x4_0000;

const KERNEL_CODE: u64 = 0x00af_9a00_0000_ffff;
const KERNEL_DATA: u64 = 0x00cf_9200_0000_ffff;
const USER_DATA: u64 = 0x00cf_f200_0000_ffff;
const USER_CODE: u64 = 0x00af_fa00_0000_ffff;

macro_rules! vector_stub {
    ($name:ident, $vector:literal) => {
        core::arch::global_asm!(
            ".pushsection .text.litterbox_ring0, \"ax\"",
            ".balign 16",
            concat!(".globl ", stringify!($name)),
            concat!(stringify!($name), ":"),
            "push 0",
            concat!("push ", stringify!($vector)),
            "hlt",
            "add rsp, 16",
            // iretq
            ".byte 0x48, 0xcf",
            ".popsection",
        );
    };
    ($name:ident, $vector:literal, error_code) => {
        core::arch::global_asm!(
            ".pushsection .text.litterbox_ring0, \"ax\"",
            ".balign 16",
            concat!(".globl ", stringify!($name)),
            concat!(stringify!($name), ":"),
            concat!("push ", stringify!($vector)),
            "hlt",
            "add rsp, 16",
            ".byte 0x48, 0xcf",
            ".popsection",
        );
    };
}

core::arch::global_asm!(
    ".pushsection .text.litterbox_ring0, \"ax\"",
    ".balign 16",
    ".globl litterbox_syscall_entry",
    "litterbox_syscall_entry:",
    "hlt",
    // sysretq
    ".byte 0x48, 0x0f, 0x07",
    ".popsection",
);

vector_stub!(litterbox_vector_0, 0);
vector_stub!(litterbox_vector_1, 1);
vector_stub!(litterbox_vector_2, 2);
vector_stub!(litterbox_vector_3, 3);
vector_stub!(litterbox_vector_4, 4);
vector_stub!(litterbox_vector_5, 5);
vector_stub!(litterbox_vector_6, 6);
vector_stub!(litterbox_vector_7, 7);
vector_stub!(litterbox_vector_8, 8, error_code);
vector_stub!(litterbox_vector_9, 9);
vector_stub!(litterbox_vector_10, 10, error_code);
vector_stub!(litterbox_vector_11, 11, error_code);
vector_stub!(litterbox_vector_12, 12, error_code);
vector_stub!(litterbox_vector_13, 13, error_code);
vector_stub!(litterbox_vector_14, 14, error_code);
vector_stub!(litterbox_vector_15, 15);
vector_stub!(litterbox_vector_16, 16);
vector_stub!(litterbox_vector_17, 17, error_code);
vector_stub!(litterbox_vector_18, 18);
vector_stub!(litterbox_vector_19, 19);
vector_stub!(litterbox_vector_20, 20);
vector_stub!(litterbox_vector_21, 21, error_code);
vector_stub!(litterbox_vector_22, 22);
vector_stub!(litterbox_vector_23, 23);
vector_stub!(litterbox_vector_24, 24);
vector_stub!(litterbox_vector_25, 25);
vector_stub!(litterbox_vector_26, 26);
vector_stub!(litterbox_vector_27, 27);
vector_stub!(litterbox_vector_28, 28);
vector_stub!(litterbox_vector_29, 29, error_code);
vector_stub!(litterbox_vector_30, 30, error_code);
vector_stub!(litterbox_vector_31, 31);

extern "C" {
    pub fn litterbox_syscall_entry();
    fn litterbox_vector_0();
    fn litterbox_vector_1();
    fn litterbox_vector_2();
    fn litterbox_vector_3();
    fn litterbox_vector_4();
    fn litterbox_vector_5();
    fn litterbox_vector_6();
    fn litterbox_vector_7();
    fn litterbox_vector_8();
    fn litterbox_vector_9();
    fn litterbox_vector_10();
    fn litterbox_vector_11();
    fn litterbox_vector_12();
    fn litterbox_vector_13();
    fn litterbox_vector_14();
    fn litterbox_vector_15();
    fn litterbox_vector_16();
    fn litterbox_vector_17();
    fn litterbox_vector_18();
    fn litterbox_vector_19();
    fn litterbox_vector_20();
    fn litterbox_vector_21();
    fn litterbox_vector_22();
    fn litterbox_vector_23();
    fn litterbox_vector_24();
    fn litterbox_vector_25();
    fn litterbox_vector_26();
    fn litterbox_vector_27();
    fn litterbox_vector_28();
    fn litterbox_vector_29();
    fn litterbox_vector_30();
    fn litterbox_vector_31();
}

/// Address of the `hlt` a guest system call stops on.
pub fn syscall_entry() -> u64 {
    litterbox_syscall_entry as usize as u64
}

/// Entry points of the exception stubs, by vector.
pub fn vector_handlers() -> [u64; EXCEPTION_VECTORS] {
    let handlers: [unsafe extern "C" fn(); EXCEPTION_VECTORS] = [
        litterbox_vector_0,
        litterbox_vector_1,
        litterbox_vector_2,
        litterbox_vector_3,
        litterbox_vector_4,
        litterbox_vector_5,
        litterbox_vector_6,
        litterbox_vector_7,
        litterbox_vector_8,
        litterbox_vector_9,
        litterbox_vector_10,
        litterbox_vector_11,
        litterbox_vector_12,
        litterbox_vector_13,
        litterbox_vector_14,
        litterbox_vector_15,
        litterbox_vector_16,
        litterbox_vector_17,
        litterbox_vector_18,
        litterbox_vector_19,
        litterbox_vector_20,
        litterbox_vector_21,
        litterbox_vector_22,
        litterbox_vector_23,
        litterbox_vector_24,
        litterbox_vector_25,
        litterbox_vector_26,
        litterbox_vector_27,
        litterbox_vector_28,
        litterbox_vector_29,
        litterbox_vector_30,
        litterbox_vector_31,
    ];
    handlers.map(|h| h as usize as u64)
}

/// Pages holding the entry stubs. Every view must map them.
pub fn entry_pages() -> Vec<u64> {
    let mut pages: Vec<u64> = vector_handlers()
        .iter()
        .chain(std::iter::once(&syscall_entry()))
        .map(|addr| addr & !(PAGE_SIZE - 1))
        .collect();
    pages.sort_unstable();
    pages.dedup();
    pages
}

/// What the stubs leave on the kernel stack.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFrame {
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdtGate {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtGate {
    /// Present 64-bit interrupt gate callable from ring `dpl`.
    pub fn new(handler: u64, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS,
            ist: 0,
            attributes: 0x8e | ((dpl & 3) << 5),
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> u64 {
        self.offset_low as u64 | (self.offset_mid as u64) << 16 | (self.offset_high as u64) << 32
    }

    pub fn dpl(&self) -> u8 {
        (self.attributes >> 5) & 3
    }
}

/// 64-bit task state segment. Only `rsp[0]` matters: the stack exceptions
/// from ring 3 land on.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Tss {
    reserved0: u32,
    pub rsp: [u64; 3],
    reserved1: u64,
    pub ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    pub iomap_base: u16,
}

impl Tss {
    pub const LIMIT: u32 = std::mem::size_of::<Tss>() as u32 - 1;
}

/// Per-vCPU kernel state. Lives in host memory the guest reaches through
/// every view.
#[repr(C, align(4096))]
pub struct KernelTables {
    pub stack: [u8; KERNEL_STACK_SIZE],
    pub idt: [IdtGate; IDT_ENTRIES],
    pub gdt: [u64; GDT_ENTRIES],
    pub tss: Tss,
}

impl KernelTables {
    pub fn setup(&mut self) {
        for (vector, handler) in vector_handlers().into_iter().enumerate() {
            // int3 must be usable from ring 3.
            let dpl = if vector as u64 == VECTOR_BREAKPOINT { 3 } else { 0 };
            self.idt[vector] = IdtGate::new(handler, dpl);
        }
        self.tss = Tss {
            rsp: [self.stack_top(), 0, 0],
            iomap_base: std::mem::size_of::<Tss>() as u16,
            ..Tss::default()
        };
        let (low, high) = tss_descriptor(self.tss_base());
        self.gdt = [0, KERNEL_CODE, KERNEL_DATA, USER_DATA, USER_CODE, low, high, 0];
    }

    pub fn stack_top(&self) -> u64 {
        self.stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }

    pub fn stack_contains(&self, addr: u64) -> bool {
        let base = self.stack.as_ptr() as u64;
        addr >= base && addr < base + KERNEL_STACK_SIZE as u64
    }

    pub fn tss_base(&self) -> u64 {
        std::ptr::addr_of!(self.tss) as u64
    }

    pub fn gdt_table(&self) -> kvm_dtable {
        kvm_dtable {
            base: self.gdt.as_ptr() as u64,
            limit: (std::mem::size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
            padding: [0; 3],
        }
    }

    pub fn idt_table(&self) -> kvm_dtable {
        kvm_dtable {
            base: self.idt.as_ptr() as u64,
            limit: (std::mem::size_of::<[IdtGate; IDT_ENTRIES]>() - 1) as u16,
            padding: [0; 3],
        }
    }

    /// Read the frame an exception stub stopped with, `rsp` being the
    /// stack pointer at the halt.
    pub fn frame_at(&self, rsp: u64) -> Option<ExceptionFrame> {
        let end = rsp.checked_add(std::mem::size_of::<ExceptionFrame>() as u64)?;
        if !self.stack_contains(rsp) || end > self.stack_top() {
            return None;
        }
        // SAFETY: the range lies inside our kernel stack.
        Some(unsafe { std::ptr::read_unaligned(rsp as *const ExceptionFrame) })
    }

    /// Overwrite the frame an exception stub will return through.
    pub fn write_frame(&mut self, rsp: u64, frame: &ExceptionFrame) -> bool {
        if self.frame_at(rsp).is_none() {
            return false;
        }
        // SAFETY: checked above.
        unsafe { std::ptr::write_unaligned(rsp as *mut ExceptionFrame, *frame) };
        true
    }
}

fn tss_descriptor(base: u64) -> (u64, u64) {
    let limit = Tss::LIMIT as u64;
    let low = (limit & 0xffff)
        | (base & 0xff_ffff) << 16
        | 0x89 << 40
        | ((limit >> 16) & 0xf) << 48
        | ((base >> 24) & 0xff) << 56;
    (low, base >> 32)
}

pub fn kernel_code_segment() -> kvm_segment {
    kvm_segment {
        selector: KERNEL_CS,
        limit: 0xffff_ffff,
        type_: 0xb,
        present: 1,
        s: 1,
        l: 1,
        g: 1,
        ..kvm_segment::default()
    }
}

pub fn user_code_segment() -> kvm_segment {
    kvm_segment {
        selector: USER_CS,
        dpl: 3,
        ..kernel_code_segment()
    }
}

pub fn user_data_segment(base: u64) -> kvm_segment {
    kvm_segment {
        base,
        selector: USER_DS,
        limit: 0xffff_ffff,
        type_: 0x3,
        present: 1,
        dpl: 3,
        db: 1,
        s: 1,
        g: 1,
        ..kvm_segment::default()
    }
}

pub fn task_segment(base: u64) -> kvm_segment {
    kvm_segment {
        base,
        selector: TSS_SELECTOR,
        limit: Tss::LIMIT,
        type_: 0xb,
        present: 1,
        ..kvm_segment::default()
    }
}

/// One mapping holding the kernel tables of every vCPU.
pub struct KernelArea {
    base: NonNull<KernelTables>,
    count: usize,
}

// SAFETY: each table is only touched by the thread owning its vCPU.
unsafe impl Send for KernelArea {}
unsafe impl Sync for KernelArea {}

impl KernelArea {
    pub fn new(count: usize) -> Result<Self> {
        let size = Self::bytes(count);
        // SAFETY: anonymous mapping, checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os("kernel area mmap"));
        }
        let base = NonNull::new(ptr as *mut KernelTables)
            .ok_or_else(|| Error::MemoryAllocationFailed("kernel area mmap returned null".into()))?;
        let area = Self { base, count };
        for i in 0..count {
            // SAFETY: fresh zeroed mapping large enough for `count` tables.
            unsafe { (*area.base.as_ptr().add(i)).setup() };
        }
        Ok(area)
    }

    fn bytes(count: usize) -> usize {
        count * std::mem::size_of::<KernelTables>()
    }

    pub fn start(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn size(&self) -> u64 {
        Self::bytes(self.count) as u64
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// # Safety
    ///
    /// The caller must own vCPU `index`, nobody else may hold its tables.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn tables(&self, index: usize) -> Option<&mut KernelTables> {
        if index < self.count {
            Some(&mut *self.base.as_ptr().add(index))
        } else {
            None
        }
    }
}

impl Drop for KernelArea {
    fn drop(&mut self) {
        // SAFETY: we own the mapping.
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, Self::bytes(self.count)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::size_of::<Tss>(), 104);
        assert_eq!(std::mem::size_of::<IdtGate>(), 16);
        assert_eq!(std::mem::size_of::<ExceptionFrame>(), 56);
        assert_eq!(std::mem::align_of::<KernelTables>(), 4096);
        assert_eq!(STAR, 0x0013_0008_0000_0000);
    }

    #[test]
    fn test_kernel_area_setup() {
        let area = KernelArea::new(2).unwrap();
        assert_eq!(area.len(), 2);
        let tables = unsafe { area.tables(1) }.unwrap();
        assert_eq!(tables.stack_top() % PAGE_SIZE, 0);
        let handlers = vector_handlers();
        assert_eq!(tables.idt[14].handler(), handlers[14]);
        assert_eq!(tables.idt[3].dpl(), 3);
        assert_eq!(tables.idt[14].dpl(), 0);
        let rsp0 = tables.tss.rsp;
        assert_eq!(rsp0[0], tables.stack_top());
        assert_eq!(tables.gdt[(TSS_SELECTOR >> 3) as usize + 1], tables.tss_base() >> 32);
        assert!(unsafe { area.tables(2) }.is_none());
    }

    #[test]
    fn test_frame_round_trip() {
        let area = KernelArea::new(1).unwrap();
        let tables = unsafe { area.tables(0) }.unwrap();
        let rsp = tables.stack_top() - std::mem::size_of::<ExceptionFrame>() as u64;
        let frame = ExceptionFrame {
            vector: VECTOR_BREAKPOINT,
            rip: 0x40_1000,
            ..ExceptionFrame::default()
        };
        assert!(tables.write_frame(rsp, &frame));
        assert_eq!(tables.frame_at(rsp), Some(frame));
        assert_eq!(tables.frame_at(tables.stack_top() - 8), None);
        assert_eq!(tables.frame_at(0x1000), None);
    }

    #[test]
    fn test_entry_pages() {
        let pages = entry_pages();
        assert!(!pages.is_empty());
        assert!(pages.iter().all(|p| p % PAGE_SIZE == 0));
        assert!(pages.contains(&(syscall_entry() & !(PAGE_SIZE - 1))));
    }
}
