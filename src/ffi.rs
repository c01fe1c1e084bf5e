//! C hooks for the language runtime.
//!
//! Every function returns `0` on success and `-1` on a recoverable error,
//! which is logged. Errors meaning isolation is already broken abort the
//! process. Strings are NUL-terminated UTF-8.

use std::ffi::{c_char, CStr};
use std::sync::OnceLock;

use crate::config::PackageId;
use crate::error::{Error, Result};
use crate::sandbox::Litterbox;

static CONTEXT: OnceLock<Litterbox> = OnceLock::new();

/// Filter directives for the subscriber installed by [`litterbox_initialize`].
pub const LOG_ENV: &str = "LITTERBOX_LOG";

fn context() -> Result<&'static Litterbox> {
    CONTEXT.get().ok_or_else(|| Error::InvalidState {
        expected: "Ready".to_string(),
        actual: "Uninitialized".to_string(),
    })
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(Error::InvalidArgument(format!("{} is null", what)));
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Error::InvalidArgument(format!("{} is not UTF-8", what)))
}

fn status(op: &str, result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_fatal() => {
            tracing::error!(op, error = %e, "fatal litterbox error");
            std::process::abort();
        }
        Err(e) => {
            tracing::warn!(op, error = %e, "litterbox call failed");
            -1
        }
    }
}

fn install_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("litterbox=warn"));
    // An embedding process may already have its own subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn initialize(manifest: Option<&str>) -> Result<()> {
    let mut builder = Litterbox::builder();
    if let Some(path) = manifest.filter(|p| !p.is_empty()) {
        builder = builder.manifest_path(path);
    }
    let lb = builder.build()?;
    CONTEXT
        .set(lb)
        .map_err(|_| Error::invariant("litterbox initialized twice"))
}

/// Create the process-wide context. `manifest` is the path of a JSON
/// manifest, or null for a runtime that registers everything dynamically.
/// The backend comes from `LITTERBOX_BACKEND`.
///
/// # Safety
///
/// `manifest` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_initialize(manifest: *const c_char) -> i32 {
    install_subscriber();
    let manifest = if manifest.is_null() {
        None
    } else {
        match str_arg(manifest, "manifest") {
            Ok(path) => Some(path),
            Err(e) => return status("initialize", Err(e)),
        }
    };
    status("initialize", initialize(manifest))
}

/// # Safety
///
/// `id` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_prolog(id: *const c_char) -> i32 {
    let result = str_arg(id, "id").and_then(|id| context()?.prolog(id));
    status("prolog", result)
}

/// # Safety
///
/// `id` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_epilog(id: *const c_char) -> i32 {
    let result = str_arg(id, "id").and_then(|id| context()?.epilog(id));
    status("epilog", result)
}

/// # Safety
///
/// `id` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_execute(id: *const c_char) -> i32 {
    let result = str_arg(id, "id").and_then(|id| context()?.execute(id));
    status("execute", result)
}

#[no_mangle]
pub extern "C" fn litterbox_register(id: PackageId, start: u64, size: u64) -> i32 {
    status("register", context().and_then(|lb| lb.register(id, start, size)))
}

#[no_mangle]
pub extern "C" fn litterbox_transfer(old: PackageId, new: PackageId, start: u64, size: u64) -> i32 {
    status(
        "transfer",
        context().and_then(|lb| lb.transfer(old, new, start, size)),
    )
}

/// `heap` is non-zero for managed-heap growth, zero for runtime metadata.
#[no_mangle]
pub extern "C" fn litterbox_runtime_growth(heap: i32, id: PackageId, start: u64, size: u64) -> i32 {
    status(
        "runtime_growth",
        context().and_then(|lb| lb.runtime_growth(heap != 0, id, start, size)),
    )
}

/// # Safety
///
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_register_package(name: *const c_char, id: PackageId) -> i32 {
    let result = str_arg(name, "name").and_then(|name| context()?.register_package(name, id));
    status("register_package", result)
}

/// # Safety
///
/// Both arguments must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn litterbox_register_dependency(
    current: *const c_char,
    dependency: *const c_char,
) -> i32 {
    let result = str_arg(current, "current").and_then(|current| {
        let dependency = str_arg(dependency, "dependency")?;
        context()?.register_dependency(current, dependency)
    });
    status("register_dependency", result)
}

/// # Safety
///
/// `id`, `memory` and `syscalls` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn litterbox_register_sandbox(
    pid: i32,
    id: *const c_char,
    memory: *const c_char,
    syscalls: *const c_char,
) -> i32 {
    let result = (|| {
        let id = str_arg(id, "id")?;
        let memory = str_arg(memory, "memory")?;
        let syscalls = str_arg(syscalls, "syscalls")?;
        context()?.register_sandbox(pid, id, memory, syscalls)
    })();
    status("register_sandbox", result)
}

/// # Safety
///
/// Both arguments must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn litterbox_register_sandbox_dependency(
    id: *const c_char,
    package: *const c_char,
) -> i32 {
    let result = str_arg(id, "id").and_then(|id| {
        let package = str_arg(package, "package")?;
        context()?.register_sandbox_dependency(id, package)
    });
    status("register_sandbox_dependency", result)
}

#[no_mangle]
pub extern "C" fn litterbox_add_section(id: PackageId, start: u64, size: u64) -> i32 {
    status(
        "add_section",
        context().and_then(|lb| lb.add_section(id, start, size)),
    )
}

/// Process id registered with sandbox `id`, `-1` when unknown.
///
/// # Safety
///
/// `id` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn litterbox_sandbox_pid(id: *const c_char) -> i32 {
    match str_arg(id, "id") {
        Ok(id) => context()
            .ok()
            .and_then(|lb| lb.sandbox_pid(id))
            .unwrap_or(-1),
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_str_arg() {
        let id = CString::new("sb").unwrap();
        assert_eq!(unsafe { str_arg(id.as_ptr(), "id") }.unwrap(), "sb");
        assert!(matches!(
            unsafe { str_arg(std::ptr::null(), "id") },
            Err(Error::InvalidArgument(_))
        ));
        let bad = [0xffu8, 0xfe, 0];
        assert!(unsafe { str_arg(bad.as_ptr().cast(), "id") }.is_err());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status("op", Ok(())), 0);
        assert_eq!(status("op", Err(Error::UnknownSandbox("sb".into()))), -1);
    }

    #[test]
    fn test_hooks_before_initialize() {
        if CONTEXT.get().is_some() {
            return;
        }
        let id = CString::new("sb").unwrap();
        assert_eq!(unsafe { litterbox_prolog(id.as_ptr()) }, -1);
        assert_eq!(litterbox_register(1, 0x1000, 0x1000), -1);
        assert_eq!(unsafe { litterbox_sandbox_pid(id.as_ptr()) }, -1);
    }
}
