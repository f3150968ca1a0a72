//! Load/store semantics shared by the interpreter and compiled code.
//!
//! [`CpuState::access`] performs one resolved access and reports faults;
//! [`CpuState::rw`] is what guest instructions call: it applies the immediate
//! offset, routes `lwc2`/`swc2` through COP2, tags the instruction with the
//! kind of region it touched, and turns a fault into a `SEGFAULT` exit.
//!
//! ## Unaligned word accesses
//!
//! `lwl`/`lwr`/`swl`/`swr` operate on the aligned word containing the address
//! and merge it with the register. With `s = addr & 3` (little endian):
//!
//! ```text
//! lwl  rt = (rt  & ((1 << (24 - 8s)) - 1)) | (mem << (24 - 8s))
//! lwr  rt = (rt  & high_mask(8s))          | (mem >> 8s)
//! swl  mem = (rt >> (24 - 8s))             | (mem & high_mask(24 - 8s))
//! swr  mem = (rt << 8s)                    | (mem & ((1 << 8s) - 1))
//! ```

use super::{DeviceContext, RegionKind, Resolved};
use crate::cpu::opcode::{OpFlags, Opcode, op};
use crate::cpu::{CpuState, ExitFlags, reg};
use crate::error::Fault;

/// Memory access performed by a guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwl,
    Lwr,
    Lwc2,
    Sb,
    Sh,
    Sw,
    Swl,
    Swr,
    Swc2,
}

impl MemAccess {
    pub fn from_opcode(opcode: &Opcode) -> Option<Self> {
        Some(match opcode.op() {
            op::LB => MemAccess::Lb,
            op::LBU => MemAccess::Lbu,
            op::LH => MemAccess::Lh,
            op::LHU => MemAccess::Lhu,
            op::LW => MemAccess::Lw,
            op::LWL => MemAccess::Lwl,
            op::LWR => MemAccess::Lwr,
            op::LWC2 => MemAccess::Lwc2,
            op::SB => MemAccess::Sb,
            op::SH => MemAccess::Sh,
            op::SW => MemAccess::Sw,
            op::SWL => MemAccess::Swl,
            op::SWR => MemAccess::Swr,
            op::SWC2 => MemAccess::Swc2,
            _ => return None,
        })
    }

    pub fn is_store(self) -> bool {
        matches!(
            self,
            MemAccess::Sb
                | MemAccess::Sh
                | MemAccess::Sw
                | MemAccess::Swl
                | MemAccess::Swr
                | MemAccess::Swc2
        )
    }
}

/// Mask with the top `bits` bits set.
#[inline]
fn high_mask(bits: u32) -> u32 {
    if bits == 0 { 0 } else { u32::MAX << (32 - bits) }
}

#[inline]
pub fn merge_lwl(reg: u32, mem: u32, shift: u32) -> u32 {
    let mask = (1u32 << (24 - shift * 8)) - 1;
    (reg & mask) | (mem << (24 - shift * 8))
}

#[inline]
pub fn merge_lwr(reg: u32, mem: u32, shift: u32) -> u32 {
    (reg & high_mask(shift * 8)) | (mem >> (shift * 8))
}

#[inline]
pub fn merge_swl(reg: u32, mem: u32, shift: u32) -> u32 {
    (reg >> ((3 - shift) * 8)) | (mem & high_mask(24 - shift * 8))
}

#[inline]
pub fn merge_swr(reg: u32, mem: u32, shift: u32) -> u32 {
    let mask = (1u32 << (shift * 8)) - 1;
    (reg << (shift * 8)) | (mem & mask)
}

fn read_le(data: &[u8], offset: u32, size: u32) -> Option<u32> {
    let start = offset as usize;
    let bytes = data.get(start..start + size as usize)?;
    Some(
        bytes
            .iter()
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)),
    )
}

fn write_le(data: &mut [u8], offset: u32, size: u32, value: u32) -> Option<()> {
    let start = offset as usize;
    let bytes = data.get_mut(start..start + size as usize)?;
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> (i * 8)) as u8;
    }
    Some(())
}

impl CpuState {
    fn load_sized(&mut self, r: &Resolved, opcode: u32, addr: u32, size: u32) -> Result<u32, Fault> {
        match r.kind {
            RegionKind::Direct => {
                let data = self.memory.direct(r.index).ok_or(Fault::NoMapping(addr))?;
                read_le(data, r.offset, size).ok_or(Fault::OutOfBounds(addr))
            }
            RegionKind::Device => {
                let CpuState { memory, clock, .. } = self;
                let dev = memory.device_mut(r.index).ok_or(Fault::NoMapping(addr))?;
                let mut ctx = DeviceContext::new(clock);
                Ok(match size {
                    1 => u32::from(dev.load8(&mut ctx, opcode, r.paddr)),
                    2 => u32::from(dev.load16(&mut ctx, opcode, r.paddr)),
                    _ => dev.load32(&mut ctx, opcode, r.paddr),
                })
            }
        }
    }

    fn store_sized(
        &mut self,
        r: &Resolved,
        opcode: u32,
        addr: u32,
        size: u32,
        value: u32,
    ) -> Result<(), Fault> {
        match r.kind {
            RegionKind::Direct => {
                if self.memory.is_read_only(r.index) {
                    log::debug!("[MEM] Ignoring store to read-only memory at {addr:#010x}");
                    return Ok(());
                }
                let data = self
                    .memory
                    .direct_mut(r.index)
                    .ok_or(Fault::NoMapping(addr))?;
                write_le(data, r.offset, size, value).ok_or(Fault::OutOfBounds(addr))?;
                if !self.invalidate_from_dma_only {
                    self.lut.invalidate(r.paddr, size);
                }
                Ok(())
            }
            RegionKind::Device => {
                let CpuState { memory, clock, .. } = self;
                let dev = memory.device_mut(r.index).ok_or(Fault::NoMapping(addr))?;
                let mut ctx = DeviceContext::new(clock);
                match size {
                    1 => dev.store8(&mut ctx, opcode, r.paddr, value as u8),
                    2 => dev.store16(&mut ctx, opcode, r.paddr, value as u16),
                    _ => dev.store32(&mut ctx, opcode, r.paddr, value),
                }
                Ok(())
            }
        }
    }

    /// Perform one access at the final address `addr`.
    ///
    /// For loads `value` is the current content of the destination register
    /// (merged by `lwl`/`lwr`); for stores it is the data to store. Returns
    /// the loaded value (0 for stores) and the kind of region touched.
    pub fn access(
        &mut self,
        kind: MemAccess,
        opcode: u32,
        addr: u32,
        value: u32,
    ) -> Result<(u32, RegionKind), Fault> {
        let r = self.memory.resolve(addr)?;
        let loaded = match kind {
            MemAccess::Lb => self.load_sized(&r, opcode, addr, 1)? as u8 as i8 as i32 as u32,
            MemAccess::Lbu => self.load_sized(&r, opcode, addr, 1)?,
            MemAccess::Lh => self.load_sized(&r, opcode, addr, 2)? as u16 as i16 as i32 as u32,
            MemAccess::Lhu => self.load_sized(&r, opcode, addr, 2)?,
            MemAccess::Lw | MemAccess::Lwc2 => self.load_sized(&r, opcode, addr, 4)?,
            MemAccess::Lwl | MemAccess::Lwr => {
                let aligned = self.memory.resolve(addr & !3)?;
                let mem = self.load_sized(&aligned, opcode, addr & !3, 4)?;
                if kind == MemAccess::Lwl {
                    merge_lwl(value, mem, addr & 3)
                } else {
                    merge_lwr(value, mem, addr & 3)
                }
            }
            MemAccess::Sb => {
                self.store_sized(&r, opcode, addr, 1, value)?;
                0
            }
            MemAccess::Sh => {
                self.store_sized(&r, opcode, addr, 2, value)?;
                0
            }
            MemAccess::Sw | MemAccess::Swc2 => {
                self.store_sized(&r, opcode, addr, 4, value)?;
                0
            }
            MemAccess::Swl | MemAccess::Swr => {
                let aligned = self.memory.resolve(addr & !3)?;
                let mem = self.load_sized(&aligned, opcode, addr & !3, 4)?;
                let merged = if kind == MemAccess::Swl {
                    merge_swl(value, mem, addr & 3)
                } else {
                    merge_swr(value, mem, addr & 3)
                };
                self.store_sized(&aligned, opcode, addr & !3, 4, merged)?;
                0
            }
        };
        Ok((loaded, r.kind))
    }

    /// Execute the memory instruction `opcode` with base register value
    /// `base` and `rt` value `data`.
    ///
    /// An untagged instruction gets tagged `DIRECT_IO` or `HW_IO` through
    /// `flags`. A fault records `SEGFAULT` and yields 0.
    pub fn rw(&mut self, opcode: Opcode, base: u32, data: u32, flags: Option<&mut OpFlags>) -> u32 {
        let addr = base.wrapping_add(i32::from(opcode.simm()) as u32);
        let Some(kind) = MemAccess::from_opcode(&opcode) else {
            log::error!("[MEM] Not a memory instruction: {:#010x}", opcode.c);
            self.set_exit(ExitFlags::UNKNOWN_OP);
            return 0;
        };

        let value = if kind == MemAccess::Swc2 {
            self.cop_read(&opcode, opcode.rt(), false)
        } else {
            data
        };

        match self.access(kind, opcode.c, addr, value) {
            Ok((loaded, region)) => {
                if let Some(flags) = flags {
                    if !flags.intersects(OpFlags::TAGGED) {
                        flags.insert(match region {
                            RegionKind::Direct => OpFlags::DIRECT_IO,
                            RegionKind::Device => OpFlags::HW_IO,
                        });
                    }
                }
                if kind == MemAccess::Lwc2 {
                    self.cop_write(&opcode, opcode.rt(), loaded, false);
                    0
                } else {
                    loaded
                }
            }
            Err(fault) => {
                log::error!(
                    "[MEM] Segmentation fault in recompiled code: invalid {} ({fault})",
                    if kind.is_store() { "store" } else { "load" }
                );
                self.set_exit(ExitFlags::SEGFAULT);
                0
            }
        }
    }

    /// Host replacement for the BIOS memset loop: zero `$a1` words at `$a0`
    /// and leave `$a0`/`$a1` as the loop would.
    ///
    /// Returns the cycles charged, or `None` when the loop has to run for real
    /// (count of zero, or a destination that is not writable direct memory).
    pub fn memset(&mut self) -> Option<u32> {
        let addr = self.regs.get(reg::A0);
        let words = self.regs.get(reg::A1);
        if words == 0 {
            return None;
        }
        let length = words.checked_mul(4)?;
        let r = self.memory.resolve(addr).ok()?;
        if r.kind != RegionKind::Direct {
            return None;
        }
        let start = r.offset as usize;
        let end = start.checked_add(length as usize)?;
        self.memory.direct_mut(r.index)?.get_mut(start..end)?.fill(0);
        if !self.invalidate_from_dma_only {
            self.lut.invalidate(r.paddr, length);
        }

        log::debug!("[REC] Host memset of {length} bytes at {addr:#010x}");
        self.regs.set(reg::A0, addr.wrapping_add(length));
        self.regs.set(reg::A1, 0);
        // Rough estimate of the loop's cost.
        Some(8u32.wrapping_add(5u32.wrapping_mul(length)))
    }
}
