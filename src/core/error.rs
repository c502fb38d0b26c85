// This module defines the error types for hetrt using the thiserror crate. JitError covers
// every way a compile can fail after the frontend has run: the diagnostics gate, a missing
// entry symbol, externs that do not resolve in the process symbol table, LLVM codegen and
// target initialization failures, execution engine construction, library linking and the
// object-code inspection helpers. CompileFailure pairs a JitError with the diagnostics the
// failing compile accumulated, so callers can report counts without a second channel.
// PlatformError is the device-side taxonomy: unsupported capabilities, invalid device ids,
// allocation contract violations (unknown pointer, double release, residency mismatch,
// out-of-range copies) and failures bubbled up from the vendor driver boundary (DriverError).

//! Error types for the JIT pipeline and the device platforms.

use crate::core::diagnostics::Diagnostics;
use crate::platform::{DeviceId, DevicePtr, Residency};
use thiserror::Error;

/// Failure of one JIT pipeline stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("compilation produced {errors} error(s) and {warnings} warning(s)")]
    Diagnostics { errors: usize, warnings: usize },

    #[error("entry symbol `{symbol}` not found in generated module")]
    EntryNotFound { symbol: String },

    #[error("external symbol `{symbol}` could not be resolved")]
    UnresolvedSymbol { symbol: String },

    #[error("code generation failed: {reason}")]
    Codegen { reason: String },

    #[error("native target initialization failed: {reason}")]
    TargetInit { reason: String },

    #[error("execution engine construction failed: {reason}")]
    EngineConstruction { reason: String },

    #[error("could not resolve `{symbol}`: {reason}")]
    SymbolResolution { symbol: String, reason: String },

    #[error("failed to load library `{path}`: {reason}")]
    Link { path: String, reason: String },

    #[error("object emission failed: {reason}")]
    ObjectEmission { reason: String },

    #[error("disassembly failed: {reason}")]
    Disassembly { reason: String },
}

impl JitError {
    pub(crate) fn codegen(reason: impl std::fmt::Display) -> Self {
        JitError::Codegen {
            reason: reason.to_string(),
        }
    }
}

impl From<inkwell::builder::BuilderError> for JitError {
    fn from(err: inkwell::builder::BuilderError) -> Self {
        JitError::codegen(err)
    }
}

/// A failed compile together with everything it reported.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct CompileFailure {
    pub error: JitError,
    pub diagnostics: Diagnostics,
}

impl CompileFailure {
    /// Number of errors the failing compile reported.
    pub fn errors(&self) -> usize {
        self.diagnostics.errors()
    }

    /// Number of warnings the failing compile reported.
    pub fn warnings(&self) -> usize {
        self.diagnostics.warnings()
    }
}

/// Errors reported by a vendor driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("out of device memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("invalid driver handle {handle:#x}")]
    InvalidHandle { handle: u64 },

    #[error("invalid device address {address:#x}")]
    InvalidAddress { address: u64 },

    #[error("module `{module}` not found")]
    ModuleNotFound { module: String },

    #[error("kernel `{kernel}` not found")]
    KernelNotFound { kernel: String },

    #[error("{0}")]
    Backend(String),
}

/// Errors returned by device platforms and the runtime registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{platform}: operation `{operation}` is not supported")]
    Unsupported {
        platform: &'static str,
        operation: &'static str,
    },

    #[error("device id {0} is not registered")]
    InvalidDevice(DeviceId),

    #[error("{platform}: local device index {index} out of range ({count} devices)")]
    InvalidLocalDevice {
        platform: &'static str,
        index: usize,
        count: usize,
    },

    #[error("device {device}: pointer {ptr} was not allocated on this device")]
    UnknownAllocation { device: usize, ptr: DevicePtr },

    #[error("device {device}: pointer {ptr} was already released")]
    DoubleRelease { device: usize, ptr: DevicePtr },

    #[error("device {device}: pointer {ptr} used after release")]
    UseAfterRelease { device: usize, ptr: DevicePtr },

    #[error("device {device}: pointer {ptr} has {actual:?} residency, expected {expected}")]
    ResidencyMismatch {
        device: usize,
        ptr: DevicePtr,
        expected: &'static str,
        actual: Residency,
    },

    #[error("range {offset}+{size} exceeds {capacity} byte buffer")]
    OutOfBounds {
        offset: usize,
        size: usize,
        capacity: usize,
    },

    #[error("{platform}: invalid kernel reference: {reason}")]
    InvalidKernel {
        platform: &'static str,
        reason: String,
    },

    #[error("launch of grid {grid:?} x block {block:?} exceeds the u32 work-item range")]
    LaunchExtent { grid: [u32; 3], block: [u32; 3] },

    #[error("device queue for device {device} is disconnected")]
    QueueDisconnected { device: usize },

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;
