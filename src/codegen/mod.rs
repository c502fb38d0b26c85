// This module turns an optimized IR World into native code through LLVM. Target initialization
// happens once per process and is shared by every compile; everything else (context, module,
// target machine) is created per compile and owned by whoever requested it. CpuCodeGen lowers
// the World into an inkwell module and runs the LLVM pass pipeline selected by OptLevel;
// ObjectCode wraps the relocatable object written by the target machine for inspection.

//! LLVM code generation for the host CPU.

pub mod cpu;
pub mod object_code;

pub use cpu::CpuCodeGen;
pub use object_code::{ObjectCode, ObjectSymbol};

use crate::core::JitError;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetMachine,
};
use inkwell::OptimizationLevel;
use std::fmt;
use std::sync::OnceLock;

/// Optimization level of a compile, `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid optimization level {0}, expected 0..=3")]
pub struct InvalidOptLevel(pub u32);

impl OptLevel {
    /// # Panics
    ///
    /// Panics if `level > 3`. Use `OptLevel::try_from` for untrusted input.
    pub fn new(level: u32) -> Self {
        assert!(level <= 3, "optimization level {} out of range", level);
        match level {
            0 => OptLevel::None,
            1 => OptLevel::Less,
            2 => OptLevel::Default,
            _ => OptLevel::Aggressive,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// New pass manager pipeline, `None` at level 0.
    pub fn pipeline(self) -> Option<&'static str> {
        match self {
            OptLevel::None => None,
            OptLevel::Less => Some("default<O1>"),
            OptLevel::Default => Some("default<O2>"),
            OptLevel::Aggressive => Some("default<O3>"),
        }
    }

    pub fn to_llvm(self) -> OptimizationLevel {
        match self {
            OptLevel::None => OptimizationLevel::None,
            OptLevel::Less => OptimizationLevel::Less,
            OptLevel::Default => OptimizationLevel::Default,
            OptLevel::Aggressive => OptimizationLevel::Aggressive,
        }
    }
}

impl TryFrom<u32> for OptLevel {
    type Error = InvalidOptLevel;

    fn try_from(level: u32) -> Result<Self, Self::Error> {
        if level > 3 {
            return Err(InvalidOptLevel(level));
        }
        Ok(OptLevel::new(level))
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.as_u32())
    }
}

static NATIVE_TARGET: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize the host target and link in MCJIT. Idempotent.
pub fn initialize_native_target() -> Result<(), JitError> {
    NATIVE_TARGET
        .get_or_init(|| {
            Target::initialize_native(&InitializationConfig::default())?;
            ExecutionEngine::link_in_mc_jit();
            log::debug!("native target initialized: {:?}", TargetMachine::get_default_triple());
            Ok(())
        })
        .clone()
        .map_err(|reason| JitError::TargetInit { reason })
}

/// Target machine for the host, producing position-independent code.
pub fn host_target_machine(opt: OptLevel) -> Result<TargetMachine, JitError> {
    initialize_native_target()?;

    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple).map_err(|e| JitError::TargetInit {
        reason: e.to_string(),
    })?;
    let cpu = TargetMachine::get_host_cpu_name();
    let features = TargetMachine::get_host_cpu_features();

    target
        .create_target_machine(
            &triple,
            &cpu.to_string(),
            &features.to_string(),
            opt.to_llvm(),
            RelocMode::PIC,
            CodeModel::Default,
        )
        .ok_or_else(|| JitError::TargetInit {
            reason: format!("no target machine for {:?}", triple),
        })
}
