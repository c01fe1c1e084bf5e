//! Debug logging utilities for litterbox.
//!
//! Set the `LITTERBOX_DEBUG` environment variable to enable verbose logging:
//! - `LITTERBOX_DEBUG=1` - Enable all debug output
//! - `LITTERBOX_DEBUG=kvm` - Enable only hypervisor-related logs
//! - `LITTERBOX_DEBUG=mpk` - Enable only protection-key logs
//! - `LITTERBOX_DEBUG=kvm,domains,memory` - Enable multiple categories
//!
//! Output goes through `tracing`, so a subscriber must be installed for it
//! to show up (the `litterbox` binary and `litterbox_initialize` do this).

use std::sync::OnceLock;

/// Debug categories that can be enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Kvm,
    Mpk,
    Domains,
    Memory,
    All,
}

/// Cached debug configuration
static DEBUG_CONFIG: OnceLock<DebugConfig> = OnceLock::new();

#[derive(Debug, Default, PartialEq, Eq)]
struct DebugConfig {
    enabled: bool,
    kvm: bool,
    mpk: bool,
    domains: bool,
    memory: bool,
}

impl DebugConfig {
    fn from_env() -> Self {
        Self::parse(std::env::var("LITTERBOX_DEBUG").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(val) if val == "1" || val.eq_ignore_ascii_case("all") => Self {
                enabled: true,
                kvm: true,
                mpk: true,
                domains: true,
                memory: true,
            },
            Some(val) => {
                let val_lower = val.to_lowercase();
                let has = |name: &str| val_lower.split(',').any(|c| c.trim() == name);
                Self {
                    enabled: true,
                    kvm: has("kvm"),
                    mpk: has("mpk"),
                    domains: has("domains"),
                    memory: has("memory"),
                }
            }
            None => Self::default(),
        }
    }

    fn allows(&self, category: DebugCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match category {
            DebugCategory::All => self.kvm || self.mpk || self.domains || self.memory,
            DebugCategory::Kvm => self.kvm,
            DebugCategory::Mpk => self.mpk,
            DebugCategory::Domains => self.domains,
            DebugCategory::Memory => self.memory,
        }
    }
}

fn get_config() -> &'static DebugConfig {
    DEBUG_CONFIG.get_or_init(DebugConfig::from_env)
}

/// Check if debug logging is enabled for a category
pub fn is_debug_enabled(category: DebugCategory) -> bool {
    get_config().allows(category)
}

/// Debug print macro for hypervisor-related logs
#[macro_export]
macro_rules! debug_kvm {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Kvm) {
            tracing::debug!(target: "litterbox::kvm", $($arg)*);
        }
    };
}

/// Debug print macro for protection-key logs
#[macro_export]
macro_rules! debug_mpk {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Mpk) {
            tracing::debug!(target: "litterbox::mpk", $($arg)*);
        }
    };
}

/// Debug print macro for domain assignment logs
#[macro_export]
macro_rules! debug_domains {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Domains) {
            tracing::debug!(target: "litterbox::domains", $($arg)*);
        }
    };
}

/// Debug print macro for address-space logs
#[macro_export]
macro_rules! debug_memory {
    ($($arg:tt)*) => {
        if $crate::debug::is_debug_enabled($crate::debug::DebugCategory::Memory) {
            tracing::debug!(target: "litterbox::memory", $($arg)*);
        }
    };
}
