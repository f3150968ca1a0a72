//! Dynamic recompiler core for MIPS R3000A (PlayStation) guests.
//!
//! Guest code is decoded into blocks, profiled by the interpreter, handed to
//! a [`backend::CodeGenerator`] and dispatched through a PC-indexed Code
//! Address Table. Compilation can run on a background thread while the
//! interpreter keeps the guest going.

pub mod backend;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod loader;
pub mod memory;

pub use error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// Engine Exports
// ═══════════════════════════════════════════════════════════════════════════

pub use config::EngineConfig;
pub use engine::trace::{TraceBuffer, TraceEvent};
pub use engine::{Engine, EngineDiagnostics, EngineStats};

pub use cpu::{CopOps, Coprocessor, ExitFlags, NUM_REGS, NullCoprocessor, SimpleCoprocessor};
pub use memory::{DeviceContext, MemMap, MemoryMap, MemoryOps};

pub use backend::{CodeGenerator, HostCode, ThreadedGenerator};
