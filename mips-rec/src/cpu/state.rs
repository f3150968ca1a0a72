//! Execution state owned by the dispatching thread.

use std::sync::Arc;

use super::cop::return_from_exception;
use super::opcode::{Opcode, cop, op};
use super::{Clock, Coprocessor, ExitFlags, Registers};
use crate::engine::lut::CodeLut;
use crate::memory::{DeviceContext, MemoryMap};

/// Everything guest code can observe or modify while it runs.
///
/// The interpreter and compiled code both operate on a `CpuState`; memory
/// access semantics live in [`crate::memory::access`].
pub struct CpuState {
    pub regs: Registers,
    pub clock: Clock,
    pub memory: MemoryMap,
    pub cop0: Box<dyn Coprocessor>,
    pub cop2: Box<dyn Coprocessor>,
    pub(crate) lut: Arc<CodeLut>,
    /// Only explicit invalidation (DMA) clears compiled code; guest stores
    /// to direct memory do not.
    pub(crate) invalidate_from_dma_only: bool,
}

impl CpuState {
    pub(crate) fn new(
        memory: MemoryMap,
        cop0: Box<dyn Coprocessor>,
        cop2: Box<dyn Coprocessor>,
        lut: Arc<CodeLut>,
    ) -> Self {
        Self {
            regs: Registers::default(),
            clock: Clock::default(),
            memory,
            cop0,
            cop2,
            lut,
            invalidate_from_dma_only: false,
        }
    }

    fn cop_and_context(&mut self, opcode: &Opcode) -> (&mut dyn Coprocessor, DeviceContext<'_>) {
        let cop = match opcode.op() {
            op::CP0 => self.cop0.as_mut(),
            _ => self.cop2.as_mut(),
        };
        (cop, DeviceContext::new(&mut self.clock))
    }

    /// Read a register of the coprocessor addressed by a COPz / LWCz / SWCz
    /// instruction (`mfc`, or `cfc` when `control` is set).
    pub fn cop_read(&mut self, opcode: &Opcode, reg: u8, control: bool) -> u32 {
        let (cop, mut ctx) = self.cop_and_context(opcode);
        if control {
            cop.move_from_control(&mut ctx, opcode.c, reg)
        } else {
            cop.move_from(&mut ctx, opcode.c, reg)
        }
    }

    /// Write a coprocessor register (`mtc`, or `ctc` when `control` is set).
    pub fn cop_write(&mut self, opcode: &Opcode, reg: u8, value: u32, control: bool) {
        let (cop, mut ctx) = self.cop_and_context(opcode);
        if control {
            cop.move_to_control(&mut ctx, opcode.c, reg, value);
        } else {
            cop.move_to(&mut ctx, opcode.c, reg, value);
        }
    }

    /// Coprocessor operation, including `rfe` on COP0.
    pub fn cop_execute(&mut self, opcode: &Opcode) {
        let is_rfe = opcode.op() == op::CP0 && opcode.funct() == cop::RFE;
        let (cp, mut ctx) = self.cop_and_context(opcode);
        if is_rfe {
            return_from_exception(cp, &mut ctx, opcode.c);
        } else {
            cp.execute(&mut ctx, opcode.c);
        }
    }

    #[inline]
    pub fn set_exit(&mut self, flags: ExitFlags) {
        self.clock.set_exit(flags);
    }

    pub fn code_lut(&self) -> &CodeLut {
        &self.lut
    }
}
