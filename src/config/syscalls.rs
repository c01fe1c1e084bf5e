//! Syscall classes and the per-sandbox syscall bitmask.
//!
//! A sandbox declares a comma-separated list of classes (`mem`, `file`, `net`,
//! `io`); `default` is always added. The empty string allows every syscall.

use std::fmt;

use crate::config::view::unquote;
use crate::error::ConfigError;

/// Number of 64-bit words needed to cover every syscall up to `prlimit64`.
pub const MASK_WORDS: usize = (libc::SYS_prlimit64 as usize) / 64 + 1;

const DELIMITER_SYSCLASS: char = ',';

/// Class that is implicitly part of every mask.
pub const DEFAULT_CLASS: &str = "default";

const DEFAULT: &[libc::c_long] = &[libc::SYS_exit_group];

const MEM: &[libc::c_long] = &[libc::SYS_mmap, libc::SYS_mprotect, libc::SYS_brk];

const IO: &[libc::c_long] = &[libc::SYS_write, libc::SYS_read];

const NET: &[libc::c_long] = &[
    libc::SYS_socket,
    libc::SYS_socketpair,
    libc::SYS_setsockopt,
    libc::SYS_getsockopt,
    libc::SYS_getsockname,
    libc::SYS_getpeername,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_accept,
    libc::SYS_accept4,
    libc::SYS_connect,
    libc::SYS_shutdown,
    libc::SYS_recvfrom,
    libc::SYS_recvmsg,
    libc::SYS_sendto,
    libc::SYS_sendmsg,
    libc::SYS_sethostname,
    libc::SYS_setdomainname,
];

const FILE: &[libc::c_long] = &[
    libc::SYS_close,
    libc::SYS_creat,
    libc::SYS_open,
    libc::SYS_openat,
    libc::SYS_mknod,
    libc::SYS_mknodat,
    libc::SYS_rename,
    libc::SYS_renameat,
    libc::SYS_truncate,
    libc::SYS_ftruncate,
    libc::SYS_fallocate,
    libc::SYS_mkdir,
    libc::SYS_mkdirat,
    libc::SYS_rmdir,
    libc::SYS_getcwd,
    libc::SYS_chdir,
    libc::SYS_fchdir,
    libc::SYS_chroot,
    libc::SYS_getdents,
    libc::SYS_getdents64,
    libc::SYS_lookup_dcookie,
    libc::SYS_link,
    libc::SYS_linkat,
    libc::SYS_symlink,
    libc::SYS_symlinkat,
    libc::SYS_unlink,
    libc::SYS_unlinkat,
    libc::SYS_readlink,
    libc::SYS_readlinkat,
    libc::SYS_umask,
    libc::SYS_stat,
    libc::SYS_lstat,
    libc::SYS_fstat,
    libc::SYS_chmod,
    libc::SYS_fchmod,
    libc::SYS_fchmodat,
    libc::SYS_chown,
    libc::SYS_lchown,
    libc::SYS_fchownat,
    libc::SYS_utime,
    libc::SYS_utimes,
    libc::SYS_futimesat,
    libc::SYS_utimensat,
    libc::SYS_access,
    libc::SYS_faccessat,
    libc::SYS_ioctl,
    libc::SYS_fcntl,
    libc::SYS_dup,
    libc::SYS_dup2,
    libc::SYS_dup3,
    libc::SYS_flock,
    libc::SYS_read,
    libc::SYS_readv,
    libc::SYS_preadv,
    libc::SYS_write,
    libc::SYS_writev,
    libc::SYS_pwritev,
    libc::SYS_lseek,
    libc::SYS_sendfile,
    libc::SYS_fdatasync,
    libc::SYS_fsync,
    libc::SYS_msync,
    libc::SYS_sync_file_range,
    libc::SYS_sync,
    libc::SYS_io_setup,
    libc::SYS_io_destroy,
    libc::SYS_io_submit,
    libc::SYS_io_cancel,
    libc::SYS_io_getevents,
    libc::SYS_select,
    libc::SYS_pselect6,
    libc::SYS_poll,
    libc::SYS_ppoll,
    libc::SYS_epoll_create,
    libc::SYS_epoll_create1,
    libc::SYS_epoll_ctl,
    libc::SYS_epoll_wait,
    libc::SYS_epoll_pwait,
    libc::SYS_inotify_init,
    libc::SYS_inotify_init1,
    libc::SYS_inotify_add_watch,
    libc::SYS_inotify_rm_watch,
    libc::SYS_fanotify_init,
    libc::SYS_fanotify_mark,
    libc::SYS_fadvise64,
    libc::SYS_readahead,
];

/// Syscall numbers of a named class.
pub fn class(name: &str) -> Option<&'static [libc::c_long]> {
    match name {
        DEFAULT_CLASS => Some(DEFAULT),
        "mem" => Some(MEM),
        "io" => Some(IO),
        "net" => Some(NET),
        "file" => Some(FILE),
        _ => None,
    }
}

/// Names of every class a sandbox may request.
pub const CLASSES: &[&str] = &["mem", "file", "net", "io", DEFAULT_CLASS];

/// One bit per syscall number: `mask[n / 64] & (1 << (n % 64))`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyscallMask([u64; MASK_WORDS]);

impl SyscallMask {
    pub const ALL: SyscallMask = SyscallMask([!0; MASK_WORDS]);
    pub const NONE: SyscallMask = SyscallMask([0; MASK_WORDS]);

    /// Parse a comma-separated class list. Unknown classes are rejected.
    pub fn parse(config: &str) -> Result<Self, ConfigError> {
        let config = unquote(config);
        if config.is_empty() {
            return Ok(Self::ALL);
        }
        let mut mask = Self::from_numbers(DEFAULT);
        for name in config.split(DELIMITER_SYSCLASS).map(str::trim) {
            let numbers =
                class(name).ok_or_else(|| ConfigError::UnknownSyscallClass(name.to_string()))?;
            mask.add(&Self::from_numbers(numbers));
        }
        Ok(mask)
    }

    pub fn from_numbers(numbers: &[libc::c_long]) -> Self {
        let mut mask = Self::NONE;
        for &nr in numbers {
            mask.set(nr as u64);
        }
        mask
    }

    fn coords(nr: u64) -> (usize, u64) {
        ((nr / 64) as usize, nr % 64)
    }

    pub fn set(&mut self, nr: u64) {
        let (word, bit) = Self::coords(nr);
        if let Some(w) = self.0.get_mut(word) {
            *w |= 1 << bit;
        }
    }

    /// Union with another mask.
    pub fn add(&mut self, other: &SyscallMask) {
        for (w, o) in self.0.iter_mut().zip(other.0.iter()) {
            *w |= *o;
        }
    }

    /// Whether syscall `nr` may be forwarded. Numbers past the mask width are
    /// only allowed by the all-allowed mask.
    pub fn allows(&self, nr: u64) -> bool {
        let (word, bit) = Self::coords(nr);
        match self.0.get(word) {
            Some(w) => w & (1 << bit) != 0,
            None => self.is_all(),
        }
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    /// Number of syscalls allowed within the mask width.
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    pub fn words(&self) -> &[u64; MASK_WORDS] {
        &self.0
    }
}

impl Default for SyscallMask {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Debug for SyscallMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            return write!(f, "SyscallMask(ALL)");
        }
        write!(f, "SyscallMask(")?;
        for (i, w) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:016x}", w)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_is_all() {
        assert_eq!(SyscallMask::parse("").unwrap(), SyscallMask::ALL);
        assert!(SyscallMask::ALL.allows(libc::SYS_execve as u64));
        assert!(SyscallMask::ALL.allows(10_000));
    }

    #[test]
    fn test_net_is_socket_family_plus_default() {
        let mask = SyscallMask::parse("net").unwrap();
        assert_eq!(mask.count() as usize, NET.len() + DEFAULT.len());
        for &nr in NET.iter().chain(DEFAULT) {
            assert!(mask.allows(nr as u64));
        }
        assert!(!mask.allows(libc::SYS_open as u64));
        assert!(!mask.allows(libc::SYS_mmap as u64));
        assert!(!mask.allows(10_000));
    }

    #[test]
    fn test_union_of_classes() {
        let mask = SyscallMask::parse("mem, io").unwrap();
        assert!(mask.allows(libc::SYS_brk as u64));
        assert!(mask.allows(libc::SYS_write as u64));
        assert!(mask.allows(libc::SYS_exit_group as u64));
        assert!(!mask.allows(libc::SYS_socket as u64));
        assert_eq!(mask.count(), 6);
    }

    #[test]
    fn test_file_class_overlaps_io() {
        let mask = SyscallMask::parse("file,io").unwrap();
        assert_eq!(mask, SyscallMask::parse("file").unwrap());
    }

    #[test]
    fn test_unknown_class() {
        assert_eq!(
            SyscallMask::parse("mem,gpu"),
            Err(ConfigError::UnknownSyscallClass("gpu".into()))
        );
    }

    #[test]
    fn test_every_class_fits() {
        for name in CLASSES {
            for &nr in class(name).unwrap() {
                assert!((nr as usize) / 64 < MASK_WORDS, "{} in {}", nr, name);
            }
        }
    }
}
