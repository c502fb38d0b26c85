//! Tests for loading shared libraries into the process symbol table.

use std::path::Path;

use hetrt::jit::{CompilationRequest, Jit, JitConfig};
use hetrt::JitError;

fn jit() -> Jit {
    let _ = env_logger::builder().is_test(true).try_init();
    Jit::new(JitConfig::default())
}

#[test]
fn test_missing_library() {
    let jit = jit();
    let path = Path::new("/definitely/not/here/libhetrt_absent.so");
    match jit.link(path) {
        Err(JitError::Link { path: reported, .. }) => {
            assert!(reported.contains("libhetrt_absent.so"))
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(!jit.linked_libraries().iter().any(|p| p == path));
}

#[test]
fn test_interior_nul_is_rejected() {
    let err = jit().link("lib\0m.so").unwrap_err();
    assert!(matches!(err, JitError::Link { .. }));
}

#[cfg(target_os = "linux")]
#[test]
fn test_link_libm_twice() {
    let candidates = [
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib64/libm.so.6",
        "/lib64/libm.so.6",
    ];
    let Some(path) = candidates.iter().map(Path::new).find(|p| p.exists()) else {
        return;
    };

    let jit = jit();
    jit.link(path).unwrap();
    jit.link(path).unwrap();
    let count = jit.linked_libraries().iter().filter(|p| *p == path).count();
    assert_eq!(count, 1);

    let request = CompilationRequest::new(
        "extern fn cbrt(x: f64) -> f64;\npub fn f(x: f64) -> f64 { cbrt(x) }",
        "f",
    );
    let artifact = jit.compile(&request).unwrap();
    let f = unsafe { artifact.function::<unsafe extern "C" fn(f64) -> f64>() }.unwrap();
    assert_eq!(unsafe { f.call(27.0) }, 3.0);
}
