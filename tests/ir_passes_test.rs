//! Tests for the IR passes on worlds lowered from real source.

use bumpalo::Bump;
use hetrt::core::CompileSession;
use hetrt::frontend::{check_module, parse_module};
use hetrt::ir::{self, InstKind, Linkage, World};
use hetrt::jit::PRELUDE;

fn lower(prelude: &str, source: &str) -> World {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let mut session = CompileSession::new(&arena, prelude, source);
    let module = parse_module(&mut session, "test");
    let types = check_module(&mut session, &module);
    assert_eq!(session.error_count(), 0, "{}", session.diagnostics());

    let mut world = World::new("test");
    ir::emit_module(&module, &types, &mut world);
    world
}

const SOURCE: &str = "
fn unused_helper(x: i64) -> i64 { x * 3 }
fn square(x: i64) -> i64 { x * x }
pub fn f(a: i64) -> i64 {
    let mut acc = 0;
    let never_read = a + 1;
    acc += square(a);
    if false { acc = 100; }
    acc + 2 * 3 - 0
}
";

#[test]
fn test_cleanup_is_idempotent() {
    let mut world = lower(PRELUDE, SOURCE);
    ir::cleanup(&mut world);
    let exports = world.exports().into_iter().map(String::from).collect::<Vec<_>>();
    let count = world.inst_count();
    let text = world.to_string();

    ir::cleanup(&mut world);
    assert_eq!(world.exports(), exports);
    assert_eq!(world.inst_count(), count);
    assert_eq!(world.to_string(), text);
}

#[test]
fn test_cleanup_removes_unreachable_functions() {
    let mut world = lower(PRELUDE, SOURCE);
    assert!(world.find("unused_helper").is_some());
    assert!(world.find("sqrt").is_some());

    ir::cleanup(&mut world);
    assert!(world.find("unused_helper").is_none());
    assert!(world.find("sqrt").is_none());
    assert!(world.find("min").is_none());
    assert!(world.find("square").is_some());
    assert_eq!(world.exports(), vec!["f"]);
    assert_eq!(world.imports().count(), 0);
}

#[test]
fn test_opt_reduces_instruction_count() {
    let mut world = lower("", SOURCE);
    ir::cleanup(&mut world);
    let before = world.inst_count();

    ir::opt(&mut world);
    ir::cleanup(&mut world);
    assert!(world.inst_count() < before, "{} -> {}", before, world.inst_count());

    let f = world.function(world.find("f").unwrap());
    // `if false` folds to a jump and the dead branch disappears.
    assert!(f
        .blocks
        .iter()
        .all(|b| !matches!(b.term, ir::Terminator::Branch { .. })));
}

#[test]
fn test_codegen_prepare_removes_unary_ops() {
    let mut world = lower(
        "",
        "pub fn f(x: i64, b: bool, y: f64) -> f64 { if !b { (-x) as f64 } else { -y } }",
    );
    ir::cleanup(&mut world);
    ir::codegen_prepare(&mut world);

    for func in &world.functions {
        for block in &func.blocks {
            assert!(block
                .insts
                .iter()
                .all(|i| !matches!(i.kind, InstKind::Unary(..))));
        }
    }
}

#[test]
fn test_linkage_follows_visibility() {
    let world = lower("", "extern fn ext(x: i64) -> i64;\nfn g() -> i64 { 1 }\npub fn f() -> i64 { g() + ext(1) }");
    let linkage = |name: &str| world.function(world.find(name).unwrap()).linkage;
    assert_eq!(linkage("ext"), Linkage::Import);
    assert_eq!(linkage("g"), Linkage::Internal);
    assert_eq!(linkage("f"), Linkage::Export);
    assert!(world.function(world.find("ext").unwrap()).is_declaration());
}
