//! Raw KVM ioctl bindings.
//!
//! Only the subset of `<linux/kvm.h>` the VT-x backend drives: VM and vCPU
//! creation, memory slots, register access and the run loop.
//!
//! ## References
//!
//! - https://www.kernel.org/doc/html/latest/virt/kvm/api.html

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use std::os::unix::io::RawFd;

const KVMIO: u64 = 0xAE;

const fn io(nr: u64) -> u64 {
    (KVMIO << 8) | nr
}

const fn iow(nr: u64, size: u64) -> u64 {
    (1 << 30) | (size << 16) | (KVMIO << 8) | nr
}

const fn ior(nr: u64, size: u64) -> u64 {
    (2 << 30) | (size << 16) | (KVMIO << 8) | nr
}

const fn iowr(nr: u64, size: u64) -> u64 {
    (3 << 30) | (size << 16) | (KVMIO << 8) | nr
}

pub const KVM_API_VERSION: i32 = 12;

// System ioctls
pub const KVM_GET_API_VERSION: u64 = io(0x00);
pub const KVM_CREATE_VM: u64 = io(0x01);
pub const KVM_CHECK_EXTENSION: u64 = io(0x03);
pub const KVM_GET_VCPU_MMAP_SIZE: u64 = io(0x04);
pub const KVM_GET_SUPPORTED_CPUID: u64 = iowr(0x05, 8);

// VM ioctls
pub const KVM_CREATE_VCPU: u64 = io(0x41);
pub const KVM_SET_USER_MEMORY_REGION: u64 = iow(0x46, 32);

// vCPU ioctls
pub const KVM_RUN: u64 = io(0x80);
pub const KVM_GET_REGS: u64 = ior(0x81, 144);
pub const KVM_SET_REGS: u64 = iow(0x82, 144);
pub const KVM_GET_SREGS: u64 = ior(0x83, 312);
pub const KVM_SET_SREGS: u64 = iow(0x84, 312);
pub const KVM_INTERRUPT: u64 = iow(0x86, 4);
pub const KVM_SET_MSRS: u64 = iow(0x89, 8);
pub const KVM_SET_SIGNAL_MASK: u64 = iow(0x8b, 4);
pub const KVM_SET_CPUID2: u64 = iow(0x90, 8);
pub const KVM_NMI: u64 = io(0x9a);
pub const KVM_GET_XSAVE: u64 = ior(0xa4, 4096);
pub const KVM_SET_XSAVE: u64 = iow(0xa5, 4096);
pub const KVM_SET_XCRS: u64 = iow(0xa7, 392);

// Capabilities
pub const KVM_CAP_NR_VCPUS: u64 = 9;
pub const KVM_CAP_MAX_VCPUS: u64 = 66;

// Exit reasons
pub const KVM_EXIT_UNKNOWN: u32 = 0;
pub const KVM_EXIT_EXCEPTION: u32 = 1;
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_HYPERCALL: u32 = 3;
pub const KVM_EXIT_DEBUG: u32 = 4;
pub const KVM_EXIT_HLT: u32 = 5;
pub const KVM_EXIT_MMIO: u32 = 6;
pub const KVM_EXIT_IRQ_WINDOW_OPEN: u32 = 7;
pub const KVM_EXIT_SHUTDOWN: u32 = 8;
pub const KVM_EXIT_FAIL_ENTRY: u32 = 9;
pub const KVM_EXIT_INTR: u32 = 10;
pub const KVM_EXIT_INTERNAL_ERROR: u32 = 17;

/// Memory slot flag: guest writes are not allowed.
pub const KVM_MEM_READONLY: u32 = 1 << 1;

// MSRs programmed on every vCPU
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_SYSCALL_MASK: u32 = 0xc000_0084;
pub const MSR_FS_BASE: u32 = 0xc000_0100;
pub const MSR_GS_BASE: u32 = 0xc000_0101;
pub const MSR_KERNEL_GS_BASE: u32 = 0xc000_0102;

pub const CPUID_MAX_ENTRIES: usize = 256;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct kvm_regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct kvm_segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct kvm_dtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct kvm_sregs {
    pub cs: kvm_segment,
    pub ds: kvm_segment,
    pub es: kvm_segment,
    pub fs: kvm_segment,
    pub gs: kvm_segment,
    pub ss: kvm_segment,
    pub tr: kvm_segment,
    pub ldt: kvm_segment,
    pub gdt: kvm_dtable,
    pub idt: kvm_dtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
    pub interrupt_bitmap: [u64; 4],
}

/// Shared page between KVM and the vCPU thread. Only the header is decoded,
/// the exit payload stays opaque.
#[repr(C)]
pub struct kvm_run {
    pub request_interrupt_window: u8,
    pub immediate_exit: u8,
    pub padding1: [u8; 6],
    pub exit_reason: u32,
    pub ready_for_interrupt_injection: u8,
    pub if_flag: u8,
    pub flags: u16,
    pub cr8: u64,
    pub apic_base: u64,
    pub data: [u64; 32],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_userspace_memory_region {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_interrupt {
    pub irq: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_cpuid_entry2 {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub padding: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct kvm_cpuid2 {
    pub nent: u32,
    pub padding: u32,
    pub entries: [kvm_cpuid_entry2; CPUID_MAX_ENTRIES],
}

impl Default for kvm_cpuid2 {
    fn default() -> Self {
        Self {
            nent: CPUID_MAX_ENTRIES as u32,
            padding: 0,
            entries: [kvm_cpuid_entry2::default(); CPUID_MAX_ENTRIES],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_msr_entry {
    pub index: u32,
    pub reserved: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct kvm_msrs<const N: usize> {
    pub nmsrs: u32,
    pub pad: u32,
    pub entries: [kvm_msr_entry; N],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_signal_mask {
    pub len: u32,
    pub sigset: [u8; 8],
}

/// Standard-format XSAVE image.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct kvm_xsave {
    pub region: [u32; 1024],
}

impl Default for kvm_xsave {
    fn default() -> Self {
        Self { region: [0; 1024] }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_xcr {
    pub xcr: u32,
    pub reserved: u32,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kvm_xcrs {
    pub nr_xcrs: u32,
    pub flags: u32,
    pub xcrs: [kvm_xcr; 16],
    pub padding: [u64; 16],
}

/// Issue an ioctl, returning the raw `errno` on failure.
///
/// Reads `errno` directly so it stays usable from a signal handler.
///
/// # Safety
///
/// `arg` must be what `request` expects: a value or a pointer to a live
/// structure of the right layout.
pub unsafe fn ioctl(fd: RawFd, request: u64, arg: u64) -> std::result::Result<i32, i32> {
    let ret = libc::ioctl(fd, request as _, arg);
    if ret < 0 {
        Err(errno())
    } else {
        Ok(ret)
    }
}

/// `errno` of the calling thread.
pub fn errno() -> i32 {
    // SAFETY: errno is thread local and always valid to read.
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        // Values from <linux/kvm.h> on x86_64.
        assert_eq!(KVM_CREATE_VM, 0xae01);
        assert_eq!(KVM_RUN, 0xae80);
        assert_eq!(KVM_SET_USER_MEMORY_REGION, 0x4020_ae46);
        assert_eq!(KVM_GET_REGS, 0x8090_ae81);
        assert_eq!(KVM_SET_SREGS, 0x4138_ae84);
        assert_eq!(KVM_GET_SUPPORTED_CPUID, 0xc008_ae05);
    }

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<kvm_regs>(), 144);
        assert_eq!(std::mem::size_of::<kvm_segment>(), 24);
        assert_eq!(std::mem::size_of::<kvm_sregs>(), 312);
        assert_eq!(std::mem::size_of::<kvm_userspace_memory_region>(), 32);
        assert_eq!(std::mem::size_of::<kvm_cpuid_entry2>(), 40);
        assert_eq!(std::mem::size_of::<kvm_xcrs>(), 392);
        assert_eq!(std::mem::size_of::<kvm_xsave>(), 4096);
    }
}
