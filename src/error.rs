//! Error types for litterbox.

use thiserror::Error;

/// Result type alias using litterbox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed sandbox configuration strings.
///
/// These are always reported to the caller and never terminate the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed view entry '{0}' (expected name:perm)")]
    MalformedEntry(String),

    #[error("empty package name in entry '{0}'")]
    EmptyName(String),

    #[error("empty permission for '{0}'")]
    EmptyPermission(String),

    #[error("invalid permission '{perm}' for '{name}'")]
    InvalidPermission { name: String, perm: String },

    #[error("pristine permission is only valid for 'self', got '{0}'")]
    PristineNotSelf(String),

    #[error("'self' can only be declared pristine (P), got '{0}'")]
    SelfNotPristine(String),

    #[error("duplicate entry for '{0}'")]
    DuplicateName(String),

    #[error("unknown syscall class '{0}'")]
    UnknownSyscallClass(String),
}

/// Errors that can occur while configuring or enforcing sandboxes.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("invalid backend '{0}' (expected SIM, VTX or MPK)")]
    InvalidBackend(String),

    // Registry errors
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    #[error("unknown sandbox: {0}")]
    UnknownSandbox(String),

    #[error("duplicate package {name} ({id})")]
    DuplicatePackage { name: String, id: i64 },

    #[error("duplicate sandbox: {0}")]
    DuplicateSandbox(String),

    #[error("ambiguous package name '{name}': {candidates:?}")]
    AmbiguousName { name: String, candidates: Vec<String> },

    // Memory errors
    #[error("no free guest-physical range for 0x{0:x} bytes")]
    OutOfGuestPhysical(u64),

    #[error("page-table arenas are sealed")]
    ArenasSealed,

    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("invalid address: 0x{0:x}")]
    InvalidAddress(u64),

    #[error("invariant violated: {0}")]
    Invariant(String),

    // Runtime errors
    #[error("not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vCPU error: {0}")]
    VcpuError(String),

    // Hypervisor errors
    #[error("hypervisor not available on this platform")]
    HypervisorNotAvailable,

    #[error("KVM error: {0}")]
    KvmError(String),

    // Protection-key errors
    #[error("protection keys exhausted ({0} domains requested)")]
    KeysExhausted(usize),

    #[error("protection keys not supported: {0}")]
    PkeyUnavailable(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("feature not supported: {0}")]
    NotSupported(String),
}

impl Error {
    pub fn from_kvm(msg: impl Into<String>) -> Self {
        Error::KvmError(msg.into())
    }

    /// Wrap `errno` of the last failed libc call with some context.
    pub fn last_os(context: &str) -> Self {
        let err = std::io::Error::last_os_error();
        Error::Io(std::io::Error::new(err.kind(), format!("{}: {}", context, err)))
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    /// Whether this error means the isolation guarantee is already broken.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Invariant(_) | Error::KvmError(_) | Error::VcpuError(_) | Error::ArenasSealed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::from(ConfigError::DuplicateName("foo".into()));
        assert_eq!(err.to_string(), "configuration error: duplicate entry for 'foo'");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_invariant_is_fatal() {
        assert!(Error::invariant("overlap").is_fatal());
        assert!(!Error::UnknownSandbox("sb".into()).is_fatal());
    }
}
