//! Process-wide dynamic library loading and symbol lookup.
//!
//! Libraries are loaded permanently through LLVM's `DynamicLibrary`, the same
//! symbol namespace MCJIT resolves imports against. Loads, including the
//! one-time load of the program's own symbols, are serialized by one lock,
//! which also guards the list of loaded paths.

use crate::core::JitError;
use llvm_sys::support::{LLVMLoadLibraryPermanently, LLVMSearchForAddressOfSymbol};
use parking_lot::{const_mutex, Mutex};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static LINKED: Mutex<Vec<PathBuf>> = const_mutex(Vec::new());
static PROCESS_SYMBOLS: OnceLock<bool> = OnceLock::new();

/// Load the shared library at `path` into the process namespace.
pub fn link(path: &Path) -> Result<(), JitError> {
    let display = path.display().to_string();
    let fail = |reason: &str| JitError::Link {
        path: display.clone(),
        reason: reason.to_string(),
    };

    let c_path = CString::new(display.as_bytes()).map_err(|_| fail("path contains NUL"))?;
    let mut linked = LINKED.lock();
    if linked.iter().any(|p| p == path) {
        log::debug!("`{}` already linked", display);
        return Ok(());
    }

    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let failed = unsafe { LLVMLoadLibraryPermanently(c_path.as_ptr()) } != 0;
    if failed {
        log::error!("failed to load `{}`", display);
        return Err(fail("library could not be loaded"));
    }

    log::info!("linked `{}`", display);
    linked.push(path.to_path_buf());
    Ok(())
}

/// Paths loaded by [`link`], in load order.
pub fn linked_libraries() -> Vec<PathBuf> {
    LINKED.lock().clone()
}

/// Whether `symbol` resolves in the process or a linked library.
pub fn resolve(symbol: &str) -> bool {
    let process = *PROCESS_SYMBOLS.get_or_init(|| {
        // Every DynamicLibrary load goes through LINKED.
        let _linked = LINKED.lock();
        // SAFETY: a null path loads the symbols of the running program.
        unsafe { LLVMLoadLibraryPermanently(std::ptr::null()) == 0 }
    });
    if !process {
        log::warn!("process symbols are not searchable");
    }

    let Ok(name) = CString::new(symbol) else {
        return false;
    };
    // SAFETY: name is a valid NUL-terminated string.
    !unsafe { LLVMSearchForAddressOfSymbol(name.as_ptr()) }.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_libm_symbols() {
        assert!(resolve("sqrt"));
        assert!(!resolve("hetrt_symbol_that_does_not_exist"));
    }

    #[test]
    fn test_link_missing_library_fails() {
        let err = link(Path::new("/nonexistent/libhetrt_missing.so")).unwrap_err();
        assert!(matches!(err, JitError::Link { .. }));
        assert!(!linked_libraries()
            .iter()
            .any(|p| p.ends_with("libhetrt_missing.so")));
    }

    #[test]
    fn test_concurrent_link_and_resolve() {
        let _ = env_logger::builder().is_test(true).try_init();
        std::thread::scope(|scope| {
            for i in 0..8 {
                scope.spawn(move || {
                    if i % 2 == 0 {
                        let path = format!("/nonexistent/libhetrt_missing_{i}.so");
                        assert!(link(Path::new(&path)).is_err());
                    } else {
                        assert!(resolve("sqrt"));
                    }
                });
            }
        });
        assert!(resolve("cos"));
    }
}
