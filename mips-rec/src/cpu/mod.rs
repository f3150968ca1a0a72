//! Guest CPU state: register file, exit flags and the cycle clock.
//!
//! The register file holds the 32 general purpose registers followed by LO and
//! HI, which is also the layout used by register dumps (34 words).

pub mod alu;
pub mod cop;
pub mod opcode;
pub mod state;

pub use cop::{CopOps, Coprocessor, NullCoprocessor, SimpleCoprocessor};
pub use opcode::{OpFlags, Opcode};
pub use state::CpuState;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Number of words in a register dump (GPR 0-31, LO, HI).
pub const NUM_REGS: usize = 34;

/// Register numbers with a fixed role in the ABI or the engine.
pub mod reg {
    pub const ZERO: u8 = 0;
    pub const AT: u8 = 1;
    pub const V0: u8 = 2;
    pub const A0: u8 = 4;
    pub const A1: u8 = 5;
    pub const GP: u8 = 28;
    pub const SP: u8 = 29;
    pub const RA: u8 = 31;
    pub const LO: u8 = 32;
    pub const HI: u8 = 33;
}

/// MIPS register names for disassembly and dumps.
pub const REG_NAMES: [&str; NUM_REGS] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra", "lo", "hi",
];

/// Guest register file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub gpr: [u32; 32],
    pub lo: u32,
    pub hi: u32,
}

impl Registers {
    /// Read register `r` (0-31 GPR, 32 LO, 33 HI).
    #[inline]
    pub fn get(&self, r: u8) -> u32 {
        match r {
            reg::LO => self.lo,
            reg::HI => self.hi,
            _ => self.gpr[(r & 31) as usize],
        }
    }

    /// Write register `r`. Writes to `$zero` are discarded.
    #[inline]
    pub fn set(&mut self, r: u8, value: u32) {
        match r {
            0 => {}
            reg::LO => self.lo = value,
            reg::HI => self.hi = value,
            _ => self.gpr[(r & 31) as usize] = value,
        }
    }

    pub fn to_array(&self) -> [u32; NUM_REGS] {
        let mut out = [0u32; NUM_REGS];
        out[..32].copy_from_slice(&self.gpr);
        out[32] = self.lo;
        out[33] = self.hi;
        out
    }

    pub fn from_array(words: &[u32; NUM_REGS]) -> Self {
        let mut gpr = [0u32; 32];
        gpr.copy_from_slice(&words[..32]);
        gpr[0] = 0;
        Self {
            gpr,
            lo: words[32],
            hi: words[33],
        }
    }

    /// Encode the register file for a save state.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a register file produced by [`Registers::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let mut regs: Registers = bincode::deserialize(bytes)?;
        regs.gpr[0] = 0;
        Ok(regs)
    }
}

bitflags! {
    /// Reasons for leaving the dispatch loop early. Empty means a normal exit
    /// (cycle budget exhausted).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExitFlags: u32 {
        const SYSCALL = 1 << 0;
        const BREAK = 1 << 1;
        const CHECK_INTERRUPT = 1 << 2;
        const SEGFAULT = 1 << 3;
        const NO_MEMORY = 1 << 4;
        const UNKNOWN_OP = 1 << 5;
    }
}

impl ExitFlags {
    pub fn is_normal(self) -> bool {
        self.is_empty()
    }
}

/// Cycle counter, cycle budget and pending exit flags.
///
/// Counters wrap; a target below the current count at the start of a run is
/// treated as "run until something else stops us".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clock {
    pub current: u32,
    pub target: u32,
    pub exit: ExitFlags,
}

impl Clock {
    /// Record an exit condition and end the current budget.
    pub fn set_exit(&mut self, flags: ExitFlags) {
        if !flags.is_empty() {
            self.exit |= flags;
            self.target = self.current;
        }
    }

    #[inline]
    pub fn add(&mut self, cycles: u32) {
        self.current = self.current.wrapping_add(cycles);
    }

    #[inline]
    pub fn exhausted(&self) -> bool {
        self.current >= self.target
    }

    /// Should the dispatcher stop after the current block?
    #[inline]
    pub fn should_stop(&self) -> bool {
        !self.exit.is_normal() || self.exhausted()
    }

    pub fn reset(&mut self, cycles: u32) {
        self.current = cycles;
        if self.target < cycles {
            self.target = cycles;
        }
    }

    pub fn set_target(&mut self, cycles: u32) {
        if self.exit.is_normal() {
            self.target = cycles.max(self.current);
        }
    }
}
