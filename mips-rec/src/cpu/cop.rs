//! Coprocessor callbacks (COP0 system control, COP2 geometry engine).
//!
//! The engine never interprets coprocessor state itself; every access goes
//! through a [`Coprocessor`] supplied by the host. The raw opcode is passed
//! along so the host can decode anything beyond the register number, and a
//! [`DeviceContext`] lets it look at the cycle counter or request an exit
//! (an interrupt becoming pending after a Status/Cause write).

use crate::memory::DeviceContext;

/// Host-provided coprocessor.
pub trait Coprocessor: Send {
    /// `mfc`: read data register `reg`.
    fn move_from(&mut self, ctx: &mut DeviceContext<'_>, op: u32, reg: u8) -> u32;
    /// `cfc`: read control register `reg`.
    fn move_from_control(&mut self, ctx: &mut DeviceContext<'_>, op: u32, reg: u8) -> u32;
    /// `mtc`: write data register `reg`.
    fn move_to(&mut self, ctx: &mut DeviceContext<'_>, op: u32, reg: u8, value: u32);
    /// `ctc`: write control register `reg`.
    fn move_to_control(&mut self, ctx: &mut DeviceContext<'_>, op: u32, reg: u8, value: u32);
    /// Coprocessor operation (COP2 commands).
    fn execute(&mut self, ctx: &mut DeviceContext<'_>, op: u32);
}

/// The coprocessor callbacks handed to the engine.
pub struct CopOps {
    pub cop0: Box<dyn Coprocessor>,
    pub cop2: Box<dyn Coprocessor>,
}

impl Default for CopOps {
    /// Register-file COP0, inert COP2.
    fn default() -> Self {
        Self {
            cop0: Box::new(SimpleCoprocessor::default()),
            cop2: Box::new(NullCoprocessor),
        }
    }
}

/// Coprocessor that reads as zero and ignores writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCoprocessor;

impl Coprocessor for NullCoprocessor {
    fn move_from(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, _reg: u8) -> u32 {
        0
    }
    fn move_from_control(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, _reg: u8) -> u32 {
        0
    }
    fn move_to(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, _reg: u8, _value: u32) {}
    fn move_to_control(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, _reg: u8, _value: u32) {}
    fn execute(&mut self, _ctx: &mut DeviceContext<'_>, op: u32) {
        log::trace!("[REC] Ignoring coprocessor operation {op:#010x}");
    }
}

/// Plain register-file coprocessor: 32 data and 32 control registers, no
/// side effects. Enough for a COP0 that only needs Status/Cause storage.
#[derive(Debug, Clone)]
pub struct SimpleCoprocessor {
    pub data: [u32; 32],
    pub control: [u32; 32],
    /// Number of `execute` calls seen.
    pub executed: u64,
}

impl Default for SimpleCoprocessor {
    fn default() -> Self {
        Self {
            data: [0; 32],
            control: [0; 32],
            executed: 0,
        }
    }
}

impl Coprocessor for SimpleCoprocessor {
    fn move_from(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, reg: u8) -> u32 {
        self.data[(reg & 31) as usize]
    }
    fn move_from_control(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, reg: u8) -> u32 {
        self.control[(reg & 31) as usize]
    }
    fn move_to(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, reg: u8, value: u32) {
        self.data[(reg & 31) as usize] = value;
    }
    fn move_to_control(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32, reg: u8, value: u32) {
        self.control[(reg & 31) as usize] = value;
    }
    fn execute(&mut self, _ctx: &mut DeviceContext<'_>, _op: u32) {
        self.executed += 1;
    }
}

/// `rfe`: pop the interrupt-enable/kernel-mode stack in the Status register.
pub fn return_from_exception(cop0: &mut dyn Coprocessor, ctx: &mut DeviceContext<'_>, op: u32) {
    let status = cop0.move_from(ctx, op, super::opcode::cop::STATUS);
    cop0.move_to(
        ctx,
        op,
        super::opcode::cop::STATUS,
        (status & !0xf) | ((status >> 2) & 0xf),
    );
}
