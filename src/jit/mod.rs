// This module is the JIT front door. A Jit turns kernel-language source into native code in one
// call: the prelude and user source are assembled in a fresh CompileSession, parsed and
// checked, and any reported error stops the compile before IR exists. The checked module is
// emitted into an IR World, cleaned up, optimized, cleaned up again and prepared for codegen;
// CpuCodeGen then lowers it to LLVM, the entry symbol is looked up among the exports, every
// external symbol is resolved in the process namespace, and an MCJIT engine produces the entry
// address. Each compile owns its session, World, LLVM context and engine, so compiles share no
// state and a failing compile cannot affect the next one. Shared libraries are linked into the
// process namespace through a single process-wide lock.

//! Source-to-native JIT pipeline.

pub mod artifact;
pub mod linker;
pub mod prelude;

pub use crate::codegen::OptLevel;
pub use artifact::CompiledArtifact;
pub use prelude::{PreludeSource, PRELUDE};

use crate::codegen::{CpuCodeGen, ObjectCode};
use crate::core::{CompileFailure, CompileSession, Diagnostics, JitError, SessionStats};
use crate::frontend::{check_module, parse_module};
use crate::ir::{self, World};
use artifact::ContextBox;
use bumpalo::Bump;
use inkwell::context::Context;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Environment variable enabling [`JitConfig::debug`].
pub const JIT_DEBUG_ENV: &str = "HETRT_JIT_DEBUG";
/// Environment variable disabling the prelude.
pub const JIT_NO_PRELUDE_ENV: &str = "HETRT_JIT_NO_PRELUDE";

/// JIT-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JitConfig {
    /// Log IR and LLVM IR of every compile at debug level.
    pub debug: bool,
    pub prelude: PreludeSource,
}

impl JitConfig {
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            std::env::var(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false)
        };

        Self {
            debug: flag(JIT_DEBUG_ENV),
            prelude: match flag(JIT_NO_PRELUDE_ENV) {
                true => PreludeSource::Disabled,
                false => PreludeSource::Builtin,
            },
        }
    }
}

/// What to compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRequest {
    pub source: String,
    pub module_name: String,
    /// Exported function the artifact is called through.
    pub entry: String,
    pub opt: OptLevel,
}

impl CompilationRequest {
    pub fn new(source: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            module_name: "jit".to_string(),
            entry: entry.into(),
            opt: OptLevel::default(),
        }
    }

    pub fn module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = name.into();
        self
    }

    pub fn opt(mut self, opt: OptLevel) -> Self {
        self.opt = opt;
        self
    }
}

/// IR of a compile that passed the frontend.
struct Lowered {
    world: World,
    diagnostics: Diagnostics,
    stats: SessionStats,
}

impl Lowered {
    fn fail(&self, error: JitError) -> CompileFailure {
        log::debug!("compile failed: {}", error);
        CompileFailure {
            error,
            diagnostics: self.diagnostics.clone(),
        }
    }

    fn timed<T>(&mut self, stage: &'static str, f: impl FnOnce(&mut Self) -> T) -> T {
        let start = Instant::now();
        let result = f(self);
        let elapsed = start.elapsed();
        log::debug!("{}: {:?}", stage, elapsed);
        self.stats.stage_times.push((stage, elapsed));
        result
    }
}

fn timed<'a, T>(
    session: &mut CompileSession<'a>,
    stage: &'static str,
    f: impl FnOnce(&mut CompileSession<'a>) -> T,
) -> T {
    let start = Instant::now();
    let result = f(session);
    let elapsed = start.elapsed();
    log::debug!("{}: {:?}", stage, elapsed);
    session.record_stage(stage, elapsed);
    result
}

/// The JIT compiler. Cheap to share: compiles hold no state in it.
#[derive(Debug, Clone, Default)]
pub struct Jit {
    config: JitConfig,
}

impl Jit {
    pub fn new(config: JitConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(JitConfig::from_env())
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    fn dump(&self, what: &str, world: &World) {
        if self.config.debug {
            log::debug!("{}:\n{}", what, world);
        } else {
            log::trace!("{}:\n{}", what, world);
        }
    }

    /// Frontend and IR passes: everything before LLVM.
    fn lower(&self, request: &CompilationRequest) -> Result<Lowered, CompileFailure> {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, self.config.prelude.text(), &request.source);

        let module = timed(&mut session, "parse", |s| parse_module(s, &request.module_name));
        let types = timed(&mut session, "check", |s| check_module(s, &module));

        if session.error_count() > 0 {
            let (errors, warnings) = (session.error_count(), session.warning_count());
            let (diagnostics, _) = session.finish();
            log::debug!("`{}` rejected by the frontend:\n{}", request.module_name, diagnostics);
            return Err(CompileFailure {
                error: JitError::Diagnostics { errors, warnings },
                diagnostics,
            });
        }

        let mut world = World::new(request.module_name.as_str());
        timed(&mut session, "emit", |_| ir::emit_module(&module, &types, &mut world));
        self.dump("emitted IR", &world);

        let stats = session.stats_mut();
        stats.functions_emitted = world.functions.iter().filter(|f| !f.is_declaration()).count();
        stats.instructions_emitted = world.inst_count();

        timed(&mut session, "cleanup", |_| ir::cleanup(&mut world));
        timed(&mut session, "opt", |_| ir::opt(&mut world));
        timed(&mut session, "cleanup", |_| ir::cleanup(&mut world));
        timed(&mut session, "codegen_prepare", |_| ir::codegen_prepare(&mut world));
        self.dump("optimized IR", &world);

        session.stats_mut().instructions_optimized = world.inst_count();
        let (diagnostics, stats) = session.finish();
        Ok(Lowered {
            world,
            diagnostics,
            stats,
        })
    }

    /// Optimized IR of `request` in textual form.
    pub fn emit_ir(&self, request: &CompilationRequest) -> Result<String, CompileFailure> {
        Ok(self.lower(request)?.world.to_string())
    }

    /// Compile `request` and resolve its entry.
    pub fn compile(&self, request: &CompilationRequest) -> Result<CompiledArtifact, CompileFailure> {
        let start = Instant::now();
        let mut lowered = self.lower(request)?;

        // Declared first so it is dropped after everything created from it.
        let context = ContextBox::new();
        // SAFETY: the codegen, module and engine end up in the artifact next
        // to the context, or are dropped before it on failure.
        let ctx = unsafe { context.get() };

        let mut gen = CpuCodeGen::new(ctx, &request.module_name, request.opt, self.config.debug)
            .map_err(|e| lowered.fail(e))?;
        let world = std::mem::replace(&mut lowered.world, World::new(""));
        lowered
            .timed("codegen", |_| gen.compile(&world))
            .map_err(|e| lowered.fail(e))?;

        if gen.lookup(&request.entry).is_none() {
            return Err(lowered.fail(JitError::EntryNotFound {
                symbol: request.entry.clone(),
            }));
        }

        let externs = gen.external_symbols();
        if let Some(missing) = externs.iter().find(|s| !linker::resolve(s)) {
            return Err(lowered.fail(JitError::UnresolvedSymbol {
                symbol: missing.clone(),
            }));
        }
        lowered.stats.externs_resolved = externs.len();

        let module = gen.into_module();
        let engine = lowered
            .timed("engine", |_| module.create_jit_execution_engine(request.opt.to_llvm()))
            .map_err(|e| {
                lowered.fail(JitError::EngineConstruction {
                    reason: e.to_string(),
                })
            })?;
        engine.run_static_constructors();

        let address = engine.get_function_address(&request.entry).map_err(|e| {
            lowered.fail(JitError::SymbolResolution {
                symbol: request.entry.clone(),
                reason: e.to_string(),
            })
        })?;

        log::info!(
            "compiled `{}` from module `{}` at {} in {:?} ({} -> {} instructions)",
            request.entry,
            request.module_name,
            request.opt,
            start.elapsed(),
            lowered.stats.instructions_emitted,
            lowered.stats.instructions_optimized
        );
        Ok(CompiledArtifact::new(
            request.entry.clone(),
            address,
            lowered.diagnostics,
            lowered.stats,
            engine,
            module,
            context,
        ))
    }

    /// Compile `request` to a relocatable object instead of loading it.
    pub fn emit_object(&self, request: &CompilationRequest) -> Result<ObjectCode, CompileFailure> {
        let mut lowered = self.lower(request)?;
        let context = Context::create();
        let mut gen = CpuCodeGen::new(&context, &request.module_name, request.opt, self.config.debug)
            .map_err(|e| lowered.fail(e))?;
        let world = std::mem::replace(&mut lowered.world, World::new(""));
        lowered
            .timed("codegen", |_| gen.compile(&world))
            .map_err(|e| lowered.fail(e))?;

        let buffer = gen.emit_object().map_err(|e| lowered.fail(e))?;
        Ok(ObjectCode::new(buffer.as_slice().to_vec()))
    }

    /// Load a shared library so later compiles can call into it.
    pub fn link(&self, path: impl AsRef<Path>) -> Result<(), JitError> {
        linker::link(path.as_ref())
    }

    /// Libraries linked so far, process-wide.
    pub fn linked_libraries(&self) -> Vec<PathBuf> {
        linker::linked_libraries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jit() -> Jit {
        let _ = env_logger::builder().is_test(true).try_init();
        Jit::new(JitConfig::default())
    }

    #[test]
    fn test_compile_and_call() {
        let request = CompilationRequest::new(
            "pub fn add_mul(a: i64, b: i64) -> i64 { (a + b) * 2 }",
            "add_mul",
        );
        let artifact = jit().compile(&request).unwrap();
        let f = unsafe { artifact.function::<unsafe extern "C" fn(i64, i64) -> i64>() }.unwrap();
        assert_eq!(unsafe { f.call(3, 4) }, 14);
        assert!(artifact.stats().instructions_optimized <= artifact.stats().instructions_emitted);
    }

    #[test]
    fn test_frontend_errors_stop_the_compile() {
        let request = CompilationRequest::new("pub fn f() -> i64 { true }", "f");
        let failure = jit().compile(&request).unwrap_err();
        assert!(matches!(failure.error, JitError::Diagnostics { errors: 1, .. }));
        assert_eq!(failure.errors(), 1);
    }

    #[test]
    fn test_missing_entry() {
        let request = CompilationRequest::new("pub fn f() -> i64 { 1 }", "g");
        let failure = jit().compile(&request).unwrap_err();
        assert_eq!(
            failure.error,
            JitError::EntryNotFound {
                symbol: "g".to_string()
            }
        );
        assert_eq!(failure.errors(), 0);
    }

    #[test]
    fn test_config_from_env_defaults() {
        std::env::remove_var(JIT_DEBUG_ENV);
        std::env::remove_var(JIT_NO_PRELUDE_ENV);
        assert_eq!(JitConfig::from_env(), JitConfig::default());
    }
}
