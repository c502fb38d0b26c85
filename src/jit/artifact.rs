//! Executable result of a successful compile.

use crate::core::{Diagnostics, JitError, SessionStats};
use inkwell::context::Context;
use inkwell::execution_engine::{ExecutionEngine, JitFunction, UnsafeFunctionPointer};
use inkwell::module::Module;
use std::ptr::NonNull;

/// Heap-pinned LLVM context owned by one artifact.
pub(crate) struct ContextBox(NonNull<Context>);

impl ContextBox {
    pub(crate) fn new() -> Self {
        ContextBox(NonNull::from(Box::leak(Box::new(Context::create()))))
    }

    /// # Safety
    ///
    /// Nothing created from the returned reference may outlive `self`.
    pub(crate) unsafe fn get(&self) -> &'static Context {
        // SAFETY: the box stays allocated until `self` is dropped.
        unsafe { self.0.as_ref() }
    }
}

impl Drop for ContextBox {
    fn drop(&mut self) {
        // SAFETY: created by Box::leak in `new` and released only here.
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

/// Native code for one compile, callable through its entry symbol.
///
/// Owns the execution engine, module and LLVM context; dropping the artifact
/// frees the code. Not `Send`: the engine is bound to the creating thread.
pub struct CompiledArtifact {
    entry: String,
    address: usize,
    diagnostics: Diagnostics,
    stats: SessionStats,
    // Field order is drop order: engine and module go before their context.
    engine: ExecutionEngine<'static>,
    module: Module<'static>,
    _context: ContextBox,
}

impl CompiledArtifact {
    pub(crate) fn new(
        entry: String,
        address: usize,
        diagnostics: Diagnostics,
        stats: SessionStats,
        engine: ExecutionEngine<'static>,
        module: Module<'static>,
        context: ContextBox,
    ) -> Self {
        Self {
            entry,
            address,
            diagnostics,
            stats,
            engine,
            module,
            _context: context,
        }
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Address of the entry function.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Warnings reported by the compile.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Optimized LLVM IR of the module.
    pub fn llvm_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// The entry function as a typed callable.
    ///
    /// # Safety
    ///
    /// `F` must match the entry's signature, e.g.
    /// `unsafe extern "C" fn(i64) -> i64` for `pub fn f(x: i64) -> i64`.
    pub unsafe fn function<F: UnsafeFunctionPointer>(
        &self,
    ) -> Result<JitFunction<'_, F>, JitError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.engine.get_function::<F>(&self.entry) }.map_err(|e| {
            JitError::SymbolResolution {
                symbol: self.entry.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Address of another exported function of the module.
    pub fn symbol_address(&self, name: &str) -> Result<usize, JitError> {
        self.engine
            .get_function_address(name)
            .map_err(|e| JitError::SymbolResolution {
                symbol: name.to_string(),
                reason: e.to_string(),
            })
    }
}
