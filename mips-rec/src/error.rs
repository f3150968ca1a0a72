//! Error types shared by the recompiler.
//!
//! Guest-visible faults (a load from an unmapped address, a syscall) are never
//! reported through these types: they are recorded as exit flags on the engine
//! and execution unwinds to the host. `Error` covers configuration, resource
//! and code generation failures.

use thiserror::Error;

/// Top-level error returned by engine construction and host-facing helpers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Out of memory")]
    OutOfMemory,
    #[error("No memory mapping for address: {addr:#010x}")]
    NoMapping { addr: u32 },
    #[error("Code generation failed: {0}")]
    Codegen(String),
    #[error("Invalid memory map: {0}")]
    InvalidMemoryMap(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Register snapshot: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error("Invalid image: {0}")]
    Image(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A memory access that could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("No memory mapping for address: {0:#010x}")]
    NoMapping(u32),
    #[error("Access outside of region bounds: {0:#010x}")]
    OutOfBounds(u32),
}

/// Failure reported by a code generator for a single block.
///
/// Either variant aborts the current compile attempt only; the block keeps
/// running through the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("Out of code memory")]
    OutOfMemory,
    #[error("Code generation failure: {0}")]
    Failure(String),
}

impl From<CodegenError> for Error {
    fn from(err: CodegenError) -> Self {
        match err {
            CodegenError::OutOfMemory => Error::OutOfMemory,
            CodegenError::Failure(msg) => Error::Codegen(msg),
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NoMapping(addr) | Fault::OutOfBounds(addr) => Error::NoMapping { addr },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
