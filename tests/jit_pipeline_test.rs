//! End-to-end tests of the JIT pipeline: source in, native callable out.
//!
//! Covers successful compiles at every optimization level, the prelude,
//! diagnostics gating, entry and extern resolution failures, and isolation
//! between compiles.

use hetrt::jit::{CompilationRequest, Jit, JitConfig, OptLevel, PreludeSource};
use hetrt::JitError;

fn jit() -> Jit {
    let _ = env_logger::builder().is_test(true).try_init();
    Jit::new(JitConfig::default())
}

const FIB: &str = "
pub fn fib(n: i64) -> i64 {
    let mut a = 0;
    let mut b = 1;
    let mut i = 0;
    while i < n {
        let next = a + b;
        a = b;
        b = next;
        i += 1;
    }
    a
}
";

#[test]
fn test_loop_at_every_opt_level() {
    let jit = jit();
    for level in 0..=3 {
        let request = CompilationRequest::new(FIB, "fib").opt(OptLevel::new(level));
        let artifact = jit.compile(&request).unwrap();
        let fib = unsafe { artifact.function::<unsafe extern "C" fn(i64) -> i64>() }.unwrap();
        assert_eq!(unsafe { fib.call(10) }, 55, "at O{}", level);
        assert_eq!(unsafe { fib.call(0) }, 0);
    }
}

#[test]
fn test_prelude_math() {
    let request = CompilationRequest::new(
        "pub fn hyp(a: f64, b: f64) -> f64 { sqrt(a * a + b * b) }\n\
         pub fn clamp(x: i64) -> i64 { max(min(x, 10), -10) + abs(-1) }",
        "hyp",
    );
    let artifact = jit().compile(&request).unwrap();
    let hyp = unsafe { artifact.function::<unsafe extern "C" fn(f64, f64) -> f64>() }.unwrap();
    assert_eq!(unsafe { hyp.call(3.0, 4.0) }, 5.0);
    assert_eq!(artifact.stats().externs_resolved, 1);

    let clamp = artifact.symbol_address("clamp").unwrap();
    // SAFETY: `clamp` is `pub fn(i64) -> i64`.
    let clamp: unsafe extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(clamp) };
    assert_eq!(unsafe { clamp(42) }, 11);
    assert_eq!(unsafe { clamp(-42) }, -9);
}

#[test]
fn test_mixed_types_and_branches() {
    let request = CompilationRequest::new(
        "fn sign(x: i32) -> i32 {\n\
             if x < 0 { -1 } else if x == 0 { 0 } else { 1 }\n\
         }\n\
         pub fn score(x: i32, scale: f64) -> f64 {\n\
             let s = sign(x);\n\
             let even = x % 2 == 0 && x != 0;\n\
             let bonus = if even { 0.5 } else { 0.0 };\n\
             (s as f64) * scale + bonus\n\
         }",
        "score",
    );
    let artifact = jit().compile(&request).unwrap();
    let score = unsafe { artifact.function::<unsafe extern "C" fn(i32, f64) -> f64>() }.unwrap();
    assert_eq!(unsafe { score.call(4, 2.0) }, 2.5);
    assert_eq!(unsafe { score.call(-3, 2.0) }, -2.0);
    assert_eq!(unsafe { score.call(0, 2.0) }, 0.0);
}

#[test]
fn test_early_return() {
    let request = CompilationRequest::new(
        "pub fn first_multiple(k: i64, limit: i64) -> i64 {\n\
             let mut i = 1;\n\
             while i <= limit {\n\
                 if i % k == 0 { return i; }\n\
                 i += 1;\n\
             }\n\
             -1\n\
         }",
        "first_multiple",
    );
    let artifact = jit().compile(&request).unwrap();
    let f = unsafe { artifact.function::<unsafe extern "C" fn(i64, i64) -> i64>() }.unwrap();
    assert_eq!(unsafe { f.call(7, 100) }, 7);
    assert_eq!(unsafe { f.call(7, 5) }, -1);
}

#[test]
fn test_semantic_errors_are_counted() {
    let request = CompilationRequest::new(
        "pub fn f(a: i64) -> i64 {\n\
             let x = 1;\n\
             x = 2;\n\
             a + undefined\n\
         }",
        "f",
    );
    let failure = jit().compile(&request).unwrap_err();
    assert!(matches!(failure.error, JitError::Diagnostics { .. }));
    assert!(failure.errors() >= 2);
}

#[test]
fn test_missing_entry_reports_no_errors() {
    let request = CompilationRequest::new("pub fn present() -> i64 { 1 }", "absent");
    let failure = jit().compile(&request).unwrap_err();
    assert_eq!(
        failure.error,
        JitError::EntryNotFound {
            symbol: "absent".to_string()
        }
    );
    assert_eq!(failure.errors(), 0);
}

#[test]
fn test_private_entry_is_not_found() {
    let request = CompilationRequest::new(
        "fn helper() -> i64 { 1 }\npub fn f() -> i64 { helper() }",
        "helper",
    );
    let failure = jit().compile(&request).unwrap_err();
    assert!(matches!(failure.error, JitError::EntryNotFound { .. }));
}

#[test]
fn test_unresolved_extern() {
    let request = CompilationRequest::new(
        "extern fn hetrt_no_such_function(x: i64) -> i64;\n\
         pub fn f(x: i64) -> i64 { hetrt_no_such_function(x) }",
        "f",
    );
    let failure = jit().compile(&request).unwrap_err();
    assert_eq!(
        failure.error,
        JitError::UnresolvedSymbol {
            symbol: "hetrt_no_such_function".to_string()
        }
    );
}

#[test]
fn test_warnings_do_not_fail() {
    let request = CompilationRequest::new("pub fn f() -> i64 { let unused = 3; 1 }", "f");
    let artifact = jit().compile(&request).unwrap();
    assert_eq!(artifact.diagnostics().warnings(), 1);
    assert_eq!(artifact.diagnostics().errors(), 0);
}

#[test]
fn test_failure_does_not_affect_next_compile() {
    let jit = jit();
    let bad = CompilationRequest::new("pub fn f() -> i64 { true }", "f");
    assert_eq!(jit.compile(&bad).unwrap_err().errors(), 1);

    let good = CompilationRequest::new("pub fn f() -> i64 { let _w = 1; 7 }", "f");
    let artifact = jit.compile(&good).unwrap();
    assert_eq!(artifact.diagnostics().errors(), 0);
    assert_eq!(artifact.diagnostics().warnings(), 0);
}

#[test]
fn test_disabled_prelude() {
    let jit = Jit::new(JitConfig {
        prelude: PreludeSource::Disabled,
        ..JitConfig::default()
    });
    let request = CompilationRequest::new("pub fn f(x: f64) -> f64 { sqrt(x) }", "f");
    assert!(matches!(
        jit.compile(&request).unwrap_err().error,
        JitError::Diagnostics { errors: 1, .. }
    ));

    let custom = Jit::new(JitConfig {
        prelude: PreludeSource::Custom("fn seven() -> i64 { 7 }".to_string()),
        ..JitConfig::default()
    });
    let request = CompilationRequest::new("pub fn f() -> i64 { seven() * 6 }", "f");
    let artifact = custom.compile(&request).unwrap();
    let f = unsafe { artifact.function::<unsafe extern "C" fn() -> i64>() }.unwrap();
    assert_eq!(unsafe { f.call() }, 42);
}

#[test]
fn test_concurrent_compiles() {
    let jit = jit();
    std::thread::scope(|scope| {
        for k in 1..=4i64 {
            let jit = &jit;
            scope.spawn(move || {
                let source = format!("pub fn f(x: i64) -> i64 {{ x * {} }}", k);
                let artifact = jit.compile(&CompilationRequest::new(source, "f")).unwrap();
                let f = unsafe { artifact.function::<unsafe extern "C" fn(i64) -> i64>() }
                    .unwrap();
                assert_eq!(unsafe { f.call(10) }, 10 * k);
            });
        }
    });
}

#[test]
fn test_emit_ir_is_optimized() {
    let ir = jit()
        .emit_ir(&CompilationRequest::new(
            "pub fn f() -> i64 { let a = 2; let b = 3; a * b + 1 }",
            "f",
        ))
        .unwrap();
    assert!(ir.contains("export fn @f() -> i64"));
    assert!(ir.contains("ret"));
    // Folded to a single constant.
    assert!(!ir.contains("mul"));
    // Unused prelude functions are gone.
    assert!(!ir.contains("@sqrt"));
}
