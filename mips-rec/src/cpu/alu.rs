//! Integer semantics shared by the interpreter and generated code.

use super::opcode::{Opcode, op, regimm, special};

/// Two-operand integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    /// Shift left by `b & 31`.
    Sll,
    Srl,
    Sra,
}

impl AluOp {
    /// Register-register form of a SPECIAL instruction. Shifts by a
    /// register (`sllv`...) shift the `rt` operand by `rs`.
    pub fn from_special(funct: u8) -> Option<Self> {
        Some(match funct {
            // Overflow traps are not modelled.
            special::ADD | special::ADDU => AluOp::Add,
            special::SUB | special::SUBU => AluOp::Sub,
            special::AND => AluOp::And,
            special::OR => AluOp::Or,
            special::XOR => AluOp::Xor,
            special::NOR => AluOp::Nor,
            special::SLT => AluOp::Slt,
            special::SLTU => AluOp::Sltu,
            special::SLL | special::SLLV => AluOp::Sll,
            special::SRL | special::SRLV => AluOp::Srl,
            special::SRA | special::SRAV => AluOp::Sra,
            _ => return None,
        })
    }

    /// Immediate form, with the immediate already extended the way the
    /// instruction wants it.
    pub fn from_immediate(c: &Opcode) -> Option<(Self, u32)> {
        let simm = i32::from(c.simm()) as u32;
        let zimm = u32::from(c.imm());
        Some(match c.op() {
            op::ADDI | op::ADDIU => (AluOp::Add, simm),
            op::SLTI => (AluOp::Slt, simm),
            op::SLTIU => (AluOp::Sltu, simm),
            op::ANDI => (AluOp::And, zimm),
            op::ORI => (AluOp::Or, zimm),
            op::XORI => (AluOp::Xor, zimm),
            _ => return None,
        })
    }

    #[inline]
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Slt => u32::from((a as i32) < (b as i32)),
            AluOp::Sltu => u32::from(a < b),
            AluOp::Sll => a << (b & 31),
            AluOp::Srl => a >> (b & 31),
            AluOp::Sra => ((a as i32) >> (b & 31)) as u32,
        }
    }
}

/// Multiply or divide; returns `(lo, hi)`.
///
/// Division by zero and `i32::MIN / -1` produce the R3000A's results
/// instead of trapping.
pub fn mul_div(funct: u8, rs: u32, rt: u32) -> (u32, u32) {
    match funct {
        special::MULT => {
            let r = i64::from(rs as i32) * i64::from(rt as i32);
            (r as u32, (r >> 32) as u32)
        }
        special::MULTU => {
            let r = u64::from(rs) * u64::from(rt);
            (r as u32, (r >> 32) as u32)
        }
        special::DIV => {
            let (n, d) = (rs as i32, rt as i32);
            if d == 0 {
                (if n >= 0 { u32::MAX } else { 1 }, rs)
            } else if n == i32::MIN && d == -1 {
                (i32::MIN as u32, 0)
            } else {
                ((n / d) as u32, (n % d) as u32)
            }
        }
        special::DIVU => {
            if rt == 0 {
                (u32::MAX, rs)
            } else {
                (rs / rt, rs % rt)
            }
        }
        _ => (0, 0),
    }
}

/// Condition of a PC-relative branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lez,
    Gtz,
    Ltz,
    Gez,
}

impl Cond {
    pub fn of(c: &Opcode) -> Option<Self> {
        Some(match c.op() {
            op::BEQ => Cond::Eq,
            op::BNE => Cond::Ne,
            op::BLEZ => Cond::Lez,
            op::BGTZ => Cond::Gtz,
            op::REGIMM => match c.rt() {
                regimm::BLTZ | regimm::BLTZAL => Cond::Ltz,
                regimm::BGEZ | regimm::BGEZAL => Cond::Gez,
                _ => return None,
            },
            _ => return None,
        })
    }

    /// Evaluate with `a` = rs and `b` = rt.
    #[inline]
    pub fn eval(self, a: u32, b: u32) -> bool {
        let s = a as i32;
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lez => s <= 0,
            Cond::Gtz => s > 0,
            Cond::Ltz => s < 0,
            Cond::Gez => s >= 0,
        }
    }
}

/// `bltzal` / `bgezal`: link unconditionally.
pub fn is_branch_and_link(c: &Opcode) -> bool {
    c.op() == op::REGIMM && matches!(c.rt(), regimm::BLTZAL | regimm::BGEZAL)
}
