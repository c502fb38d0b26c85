//! hetrt - execution core of a heterogeneous-computing runtime.
//!
//! Two halves share this crate. The JIT turns source in a small kernel
//! language into native host code through LLVM and hands back a callable
//! artifact. The platform layer exposes CPU and accelerator backends behind
//! one [`Platform`](platform::Platform) trait, and the [`Runtime`] registry
//! maps every registered device onto one flat [`DeviceId`](platform::DeviceId)
//! space.
//!
//! # Primary Usage
//!
//! ```ignore
//! use hetrt::jit::{CompilationRequest, Jit, JitConfig};
//!
//! let jit = Jit::new(JitConfig::default());
//! let request = CompilationRequest::new("pub fn twice(x: i64) -> i64 { x * 2 }", "twice");
//! let artifact = jit.compile(&request)?;
//! let twice = unsafe { artifact.function::<unsafe extern "C" fn(i64) -> i64>()? };
//! assert_eq!(unsafe { twice.call(21) }, 42);
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Errors, diagnostics and the per-compile session
//! - [`frontend`] - Lexer, parser and type checker
//! - [`ir`] - Block-parameter SSA IR and its passes
//! - [`codegen`] - LLVM lowering and object inspection
//! - [`jit`] - The compile pipeline and library linking
//! - [`platform`] - Device platforms and the driver boundary
//! - [`runtime`] - The device registry

pub mod codegen;
pub mod core;
pub mod frontend;
pub mod ir;
pub mod jit;
pub mod platform;
pub mod runtime;

pub use crate::core::{
    CompileFailure, Diagnostic, Diagnostics, DriverError, JitError, PlatformError,
    PlatformResult, SessionStats, Severity,
};
pub use jit::{CompilationRequest, CompiledArtifact, Jit, JitConfig, OptLevel, PreludeSource};
pub use platform::{
    BackendKind, CpuPlatform, DeviceId, DevicePtr, DriverPlatform, KernelArgs, KernelRef,
    LaunchParams, Platform, ReferenceDriver, Residency,
};
pub use runtime::{DeviceRange, MemoryBlock, Runtime};
