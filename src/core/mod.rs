// This module is the shared infrastructure of hetrt: the error taxonomy used by both the JIT
// pipeline and the device platforms, the per-compile diagnostic accumulator, and the
// arena-backed compile session that threads source text, interned names, diagnostics and
// statistics through the frontend without any process-wide mutable state.

//! Core infrastructure shared by the JIT pipeline and the platform layer.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based source assembly and identifier interning using `bumpalo`
//! - Per-compile warning/error accounting
//! - Compilation statistics and stage timings
//!
//! ## Diagnostics (`diagnostics`)
//! - Severity, span and resolved location of every report
//!
//! ## Errors (`error`)
//! - `JitError` / `CompileFailure` for the pipeline
//! - `PlatformError` / `DriverError` for devices

pub mod diagnostics;
pub mod error;
pub mod session;

pub use diagnostics::{Diagnostic, Diagnostics, Location, Severity, Span};
pub use error::{CompileFailure, DriverError, JitError, PlatformError, PlatformResult};
pub use session::{CompileSession, SessionStats};
