//! Code generator contract.
//!
//! The engine does not emit host instructions itself. It hands each block's
//! annotated opcode list to a [`CodeGenerator`], publishes the resulting
//! [`HostCode`] in the Code Address Table and calls it from the dispatcher.
//!
//! ```text
//!   Block ops ──▶ CodeGenerator::compile ──▶ Emitted { function, targets, code_size }
//!                        │                          │
//!                   RegCache                        ▼
//!                                         Code Address Table: start + targets
//!                                                   │
//!   dispatcher ──▶ HostCode::call(entry, state) ◀───┘  → next guest PC
//! ```
//!
//! The crate ships [`threaded::ThreadedGenerator`], which lowers opcodes to a
//! pre-decoded host-op program. Native backends plug in through the same
//! traits.

pub mod threaded;

use std::sync::Arc;

use crate::cpu::{CpuState, Opcode};
use crate::engine::block::Block;
use crate::engine::regcache::RegCache;
use crate::error::CodegenError;

pub use threaded::ThreadedGenerator;

/// Executable code for one block.
pub trait HostCode: Send + Sync {
    /// Run the block from opcode offset `entry` (0 or one of the emitted
    /// targets) and return the next guest PC.
    ///
    /// `block` is the block the code was generated for; runtime tagging of
    /// memory accesses goes through it.
    fn call(&self, entry: u16, state: &mut CpuState, block: &Block) -> u32;
}

/// What the generator sees of a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockSource<'a> {
    pub pc: u32,
    pub ops: &'a [Opcode],
}

/// Result of a successful compile.
pub struct Emitted {
    pub function: Arc<dyn HostCode>,
    /// Opcode offsets (other than 0) the function can be entered at.
    pub targets: Vec<u16>,
    /// Host code size in bytes, for accounting.
    pub code_size: usize,
}

/// Host code generator.
pub trait CodeGenerator: Send {
    fn name(&self) -> &'static str;

    /// Generate code for `src`. The register cache has been reset.
    fn compile(
        &mut self,
        src: &BlockSource<'_>,
        regcache: &mut RegCache,
    ) -> Result<Emitted, CodegenError>;

    /// Code retired by the reaper; nothing calls it any more.
    fn release(&mut self, function: Arc<dyn HostCode>) {
        drop(function);
    }
}

/// The built-in generator.
pub fn default_generator() -> Box<dyn CodeGenerator> {
    Box::new(ThreadedGenerator::new())
}
