//! Protection keys and the PKRU register.

use std::fmt;

use crate::config::Prot;

/// Keys usable by sandboxes. Key 0 tags every untagged page.
pub const MAX_KEYS: usize = 15;

/// A protection key handed out by `pkey_alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pkey(pub u32);

impl Pkey {
    /// The key of every page nobody tagged.
    pub const DEFAULT: Pkey = Pkey(0);
}

/// Rights a PKRU value grants over one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyRights {
    Rwx,
    /// Write disabled.
    Rx,
    /// Access disabled, only instruction fetches remain.
    X,
}

impl KeyRights {
    /// Coarsen a package view entry to what keys can express.
    pub fn from_prot(prot: Prot) -> Self {
        if prot.contains(Prot::W) {
            KeyRights::Rwx
        } else if prot.contains(Prot::R) {
            KeyRights::Rx
        } else {
            KeyRights::X
        }
    }

    fn bits(self) -> u32 {
        match self {
            KeyRights::Rwx => 0b00,
            KeyRights::Rx => 0b10,
            KeyRights::X => 0b01,
        }
    }
}

/// Value of the PKRU register: two bits per key, access-disable then
/// write-disable.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pkru(pub u32);

impl Pkru {
    /// Everything allowed.
    pub const ALL_RIGHTS: Pkru = Pkru(0);
    /// Only key 0 is accessible.
    pub const NO_RIGHTS: Pkru = Pkru(0x5555_5554);

    /// Same value with `rights` for `key`.
    pub fn update(self, key: Pkey, rights: KeyRights) -> Pkru {
        let shift = key.0 * 2;
        Pkru((self.0 & !(0b11 << shift)) | (rights.bits() << shift))
    }

    /// Rights this value grants over `key`.
    pub fn rights(self, key: Pkey) -> KeyRights {
        match (self.0 >> (key.0 * 2)) & 0b11 {
            0b00 => KeyRights::Rwx,
            0b10 => KeyRights::Rx,
            _ => KeyRights::X,
        }
    }
}

impl fmt::Debug for Pkru {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pkru(0x{:08x})", self.0)
    }
}

/// Write PKRU on the current thread.
#[cfg(target_arch = "x86_64")]
pub fn write_pkru(pkru: Pkru) {
    // SAFETY: WRPKRU only changes the access rights of the current thread;
    // ECX and EDX must be zero.
    unsafe {
        std::arch::asm!(
            "wrpkru",
            in("eax") pkru.0,
            in("ecx") 0u32,
            in("edx") 0u32,
            options(nostack, preserves_flags),
        );
    }
}

/// Read PKRU on the current thread.
#[cfg(target_arch = "x86_64")]
pub fn read_pkru() -> Pkru {
    let value: u32;
    // SAFETY: RDPKRU reads a per-thread register; ECX must be zero.
    unsafe {
        std::arch::asm!(
            "rdpkru",
            out("eax") value,
            in("ecx") 0u32,
            out("edx") _,
            options(nostack, preserves_flags),
        );
    }
    Pkru(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_read_back() {
        let pkru = Pkru::NO_RIGHTS.update(Pkey(1), KeyRights::Rx);
        assert_eq!(pkru, Pkru(0x5555_5558));
        let pkru = pkru.update(Pkey(2), KeyRights::Rwx);
        assert_eq!(pkru, Pkru(0x5555_5548));
        assert_eq!(pkru.rights(Pkey(1)), KeyRights::Rx);
        assert_eq!(pkru.rights(Pkey(2)), KeyRights::Rwx);
        assert_eq!(pkru.rights(Pkey(3)), KeyRights::X);
        assert_eq!(Pkru::NO_RIGHTS.rights(Pkey::DEFAULT), KeyRights::Rwx);
    }

    #[test]
    fn test_rights_from_prot() {
        assert_eq!(KeyRights::from_prot(Prot::DEFAULT), KeyRights::Rwx);
        assert_eq!(KeyRights::from_prot(Prot::R | Prot::USER), KeyRights::Rx);
        assert_eq!(KeyRights::from_prot(Prot::R | Prot::X), KeyRights::Rx);
        assert_eq!(KeyRights::from_prot(Prot::USER), KeyRights::X);
    }
}
