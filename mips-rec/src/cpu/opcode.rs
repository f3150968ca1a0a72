//! R3000A instruction decoding.
//!
//! An [`Opcode`] is the raw 32-bit instruction word plus the flags the
//! optimizer and the runtime attach to it. Field accessors follow the usual
//! MIPS naming:
//!
//! ```text
//!  31    26 25  21 20  16 15  11 10   6 5     0
//! ┌────────┬──────┬──────┬──────┬──────┬───────┐
//! │   op   │  rs  │  rt  │  rd  │ shamt│ funct │  R-type
//! ├────────┼──────┼──────┼──────┴──────┴───────┤
//! │   op   │  rs  │  rt  │      immediate      │  I-type
//! ├────────┼──────┴──────┴─────────────────────┤
//! │   op   │            target                 │  J-type
//! └────────┴───────────────────────────────────┘
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Primary opcode field values.
pub mod op {
    pub const SPECIAL: u8 = 0x00;
    pub const REGIMM: u8 = 0x01;
    pub const J: u8 = 0x02;
    pub const JAL: u8 = 0x03;
    pub const BEQ: u8 = 0x04;
    pub const BNE: u8 = 0x05;
    pub const BLEZ: u8 = 0x06;
    pub const BGTZ: u8 = 0x07;
    pub const ADDI: u8 = 0x08;
    pub const ADDIU: u8 = 0x09;
    pub const SLTI: u8 = 0x0a;
    pub const SLTIU: u8 = 0x0b;
    pub const ANDI: u8 = 0x0c;
    pub const ORI: u8 = 0x0d;
    pub const XORI: u8 = 0x0e;
    pub const LUI: u8 = 0x0f;
    pub const CP0: u8 = 0x10;
    pub const CP2: u8 = 0x12;
    pub const LB: u8 = 0x20;
    pub const LH: u8 = 0x21;
    pub const LWL: u8 = 0x22;
    pub const LW: u8 = 0x23;
    pub const LBU: u8 = 0x24;
    pub const LHU: u8 = 0x25;
    pub const LWR: u8 = 0x26;
    pub const SB: u8 = 0x28;
    pub const SH: u8 = 0x29;
    pub const SWL: u8 = 0x2a;
    pub const SW: u8 = 0x2b;
    pub const SWR: u8 = 0x2e;
    pub const LWC2: u8 = 0x32;
    pub const SWC2: u8 = 0x3a;
}

/// `funct` values of the SPECIAL group.
pub mod special {
    pub const SLL: u8 = 0x00;
    pub const SRL: u8 = 0x02;
    pub const SRA: u8 = 0x03;
    pub const SLLV: u8 = 0x04;
    pub const SRLV: u8 = 0x06;
    pub const SRAV: u8 = 0x07;
    pub const JR: u8 = 0x08;
    pub const JALR: u8 = 0x09;
    pub const SYSCALL: u8 = 0x0c;
    pub const BREAK: u8 = 0x0d;
    pub const MFHI: u8 = 0x10;
    pub const MTHI: u8 = 0x11;
    pub const MFLO: u8 = 0x12;
    pub const MTLO: u8 = 0x13;
    pub const MULT: u8 = 0x18;
    pub const MULTU: u8 = 0x19;
    pub const DIV: u8 = 0x1a;
    pub const DIVU: u8 = 0x1b;
    pub const ADD: u8 = 0x20;
    pub const ADDU: u8 = 0x21;
    pub const SUB: u8 = 0x22;
    pub const SUBU: u8 = 0x23;
    pub const AND: u8 = 0x24;
    pub const OR: u8 = 0x25;
    pub const XOR: u8 = 0x26;
    pub const NOR: u8 = 0x27;
    pub const SLT: u8 = 0x2a;
    pub const SLTU: u8 = 0x2b;
}

/// `rt` values of the REGIMM group.
pub mod regimm {
    pub const BLTZ: u8 = 0x00;
    pub const BGEZ: u8 = 0x01;
    pub const BLTZAL: u8 = 0x10;
    pub const BGEZAL: u8 = 0x11;
}

/// `rs` values of the coprocessor groups.
pub mod cop {
    pub const MFC: u8 = 0x00;
    pub const CFC: u8 = 0x02;
    pub const MTC: u8 = 0x04;
    pub const CTC: u8 = 0x06;
    pub const RFE: u8 = 0x10;
    /// COP0 Status register.
    pub const STATUS: u8 = 12;
    /// COP0 Cause register.
    pub const CAUSE: u8 = 13;
}

bitflags! {
    /// Per-instruction annotations.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OpFlags: u16 {
        /// Memory access resolved to a direct (RAM-like) region.
        const DIRECT_IO = 1 << 0;
        /// Memory access resolved to a device region.
        const HW_IO = 1 << 1;
        /// Delay slot is a nop and is not emitted.
        const NO_DS = 1 << 2;
        /// Branch can only be run by the interpreter.
        const EMULATE_BRANCH = 1 << 3;
        /// Branch target lies inside the same block.
        const LOCAL_BRANCH = 1 << 4;
        /// Instruction is the target of a local branch.
        const SYNC = 1 << 5;

        const TAGGED = Self::DIRECT_IO.bits() | Self::HW_IO.bits();
    }
}

/// One decoded guest instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opcode {
    pub c: u32,
    pub flags: OpFlags,
}

impl Opcode {
    pub const NOP: Opcode = Opcode {
        c: 0,
        flags: OpFlags::empty(),
    };

    pub fn new(c: u32) -> Self {
        Self {
            c,
            flags: OpFlags::empty(),
        }
    }

    #[inline]
    pub fn op(&self) -> u8 {
        (self.c >> 26) as u8
    }
    #[inline]
    pub fn rs(&self) -> u8 {
        ((self.c >> 21) & 0x1f) as u8
    }
    #[inline]
    pub fn rt(&self) -> u8 {
        ((self.c >> 16) & 0x1f) as u8
    }
    #[inline]
    pub fn rd(&self) -> u8 {
        ((self.c >> 11) & 0x1f) as u8
    }
    #[inline]
    pub fn shamt(&self) -> u8 {
        ((self.c >> 6) & 0x1f) as u8
    }
    #[inline]
    pub fn funct(&self) -> u8 {
        (self.c & 0x3f) as u8
    }
    #[inline]
    pub fn imm(&self) -> u16 {
        self.c as u16
    }
    #[inline]
    pub fn simm(&self) -> i16 {
        self.c as u16 as i16
    }
    #[inline]
    pub fn target(&self) -> u32 {
        self.c & 0x03ff_ffff
    }

    pub fn is_nop(&self) -> bool {
        if self.c == 0 {
            return true;
        }
        // ALU results written to $zero have no effect.
        match self.op() {
            op::SPECIAL => matches!(
                self.funct(),
                special::SLL
                    | special::SRL
                    | special::SRA
                    | special::SLLV
                    | special::SRLV
                    | special::SRAV
                    | special::ADDU
                    | special::SUBU
                    | special::AND
                    | special::OR
                    | special::XOR
                    | special::NOR
                    | special::SLT
                    | special::SLTU
                    | special::MFHI
                    | special::MFLO
            ) && self.rd() == 0,
            op::ADDIU | op::SLTI | op::SLTIU | op::ANDI | op::ORI | op::XORI | op::LUI => {
                self.rt() == 0
            }
            _ => false,
        }
    }

    /// Instructions after which the block must end so the host can react:
    /// `syscall`, `break`, and writes to the COP0 Status or Cause registers.
    pub fn is_syscall(&self) -> bool {
        match self.op() {
            op::SPECIAL => matches!(self.funct(), special::SYSCALL | special::BREAK),
            op::CP0 => {
                matches!(self.rs(), cop::MTC | cop::CTC)
                    && matches!(self.rd(), cop::STATUS | cop::CAUSE)
            }
            _ => false,
        }
    }

    pub fn is_unconditional_jump(&self) -> bool {
        match self.op() {
            op::SPECIAL => matches!(self.funct(), special::JR | special::JALR),
            op::J | op::JAL => true,
            op::BEQ | op::BLEZ => self.rs() == self.rt(),
            op::REGIMM => {
                matches!(self.rt(), regimm::BGEZ | regimm::BGEZAL) && self.rs() == 0
            }
            _ => false,
        }
    }

    /// Branches and jumps; all of them have a delay slot.
    pub fn has_delay_slot(&self) -> bool {
        match self.op() {
            op::SPECIAL => matches!(self.funct(), special::JR | special::JALR),
            op::J | op::JAL | op::BEQ | op::BNE | op::BLEZ | op::BGTZ => true,
            op::REGIMM => matches!(
                self.rt(),
                regimm::BLTZ | regimm::BGEZ | regimm::BLTZAL | regimm::BGEZAL
            ),
            _ => false,
        }
    }

    /// PC-relative conditional branches (not `j`/`jal`/`jr`/`jalr`).
    pub fn is_branch(&self) -> bool {
        matches!(
            self.op(),
            op::BEQ | op::BNE | op::BLEZ | op::BGTZ | op::REGIMM
        ) && self.has_delay_slot()
    }

    /// Static target of a branch or direct jump placed at `pc`.
    pub fn branch_target(&self, pc: u32) -> Option<u32> {
        if self.is_branch() {
            let offset = (i32::from(self.simm()) << 2) as u32;
            Some(pc.wrapping_add(4).wrapping_add(offset))
        } else if matches!(self.op(), op::J | op::JAL) {
            Some((pc.wrapping_add(4) & 0xf000_0000) | (self.target() << 2))
        } else {
            None
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(
            self.op(),
            op::LB | op::LH | op::LWL | op::LW | op::LBU | op::LHU | op::LWR | op::LWC2
        )
    }

    pub fn is_store(&self) -> bool {
        matches!(
            self.op(),
            op::SB | op::SH | op::SWL | op::SW | op::SWR | op::SWC2
        )
    }

    pub fn is_memory(&self) -> bool {
        self.is_load() || self.is_store()
    }

    pub fn is_tagged(&self) -> bool {
        self.flags.intersects(OpFlags::TAGGED)
    }

    /// Guest register written by this instruction, if any (LO/HI as 32/33;
    /// multiply and divide report LO).
    pub fn dest_reg(&self) -> Option<u8> {
        let r = match self.op() {
            op::SPECIAL => match self.funct() {
                special::JR
                | special::SYSCALL
                | special::BREAK
                | special::MTHI
                | special::MTLO => return None,
                special::MULT | special::MULTU | special::DIV | special::DIVU => {
                    return Some(super::reg::LO);
                }
                _ => self.rd(),
            },
            op::REGIMM => match self.rt() {
                regimm::BLTZAL | regimm::BGEZAL => super::reg::RA,
                _ => return None,
            },
            op::JAL => super::reg::RA,
            op::J | op::BEQ | op::BNE | op::BLEZ | op::BGTZ => return None,
            op::CP0 | op::CP2 => match self.rs() {
                cop::MFC | cop::CFC => self.rt(),
                _ => return None,
            },
            op::LWC2 | op::SB | op::SH | op::SWL | op::SW | op::SWR | op::SWC2 => return None,
            _ => self.rt(),
        };
        Some(r)
    }
}

impl From<u32> for Opcode {
    fn from(c: u32) -> Self {
        Opcode::new(c)
    }
}
