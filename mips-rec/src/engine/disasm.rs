//! MIPS disassembler for debugging precompiled blocks.
//!
//! Produces one line per opcode in the usual assembler syntax, optionally
//! prefixed with the guest address and followed by the optimizer's
//! annotations.

use crate::cpu::REG_NAMES;
use crate::cpu::opcode::{OpFlags, Opcode, cop, op, regimm, special};

/// Configuration for block listings.
#[derive(Debug, Clone)]
pub struct DisasmConfig {
    /// Include instruction addresses
    pub include_addresses: bool,
    /// Include optimizer annotations (`DIRECT_IO`, `NO_DS`, ...)
    pub include_flags: bool,
}

impl Default for DisasmConfig {
    fn default() -> Self {
        Self {
            include_addresses: true,
            include_flags: true,
        }
    }
}

/// Listing of the opcodes of a block starting at `pc`.
pub fn disassemble_block(pc: u32, ops: &[Opcode], config: &DisasmConfig) -> String {
    let mut output = format!(";; Block @ 0x{:08x}, {} opcodes\n", pc, ops.len());
    for (i, opcode) in ops.iter().enumerate() {
        let addr = pc.wrapping_add(i as u32 * 4);
        if config.include_addresses {
            output.push_str(&format!("{addr:08x}:  "));
        }
        output.push_str(&format_instruction(opcode, addr));
        if config.include_flags && !opcode.flags.is_empty() {
            output.push_str(&format!("    ;; {}", format_flags(opcode.flags)));
        }
        output.push('\n');
    }
    output
}

/// Log a block listing at debug level.
pub fn log_block_disassembly(pc: u32, ops: &[Opcode]) {
    if log::log_enabled!(log::Level::Debug) {
        let listing = disassemble_block(pc, ops, &DisasmConfig::default());
        log::debug!("═══ [REC] Block @ 0x{pc:08x} ═══\n{listing}");
    }
}

fn format_flags(flags: OpFlags) -> String {
    let mut names = Vec::new();
    for (name, flag) in flags.iter_names() {
        if flag != OpFlags::TAGGED {
            names.push(name.to_ascii_lowercase());
        }
    }
    names.join(",")
}

#[inline]
fn r(reg: u8) -> &'static str {
    REG_NAMES[reg as usize & 31]
}

/// One instruction in assembler syntax. `pc` resolves branch targets.
pub fn format_instruction(opcode: &Opcode, pc: u32) -> String {
    let c = opcode;
    if c.c == 0 {
        return "nop".to_string();
    }
    let (rs, rt, rd) = (r(c.rs()), r(c.rt()), r(c.rd()));
    let target = c.branch_target(pc).unwrap_or(0);

    match c.op() {
        op::SPECIAL => match c.funct() {
            special::SLL => format!("sll {rd}, {rt}, {}", c.shamt()),
            special::SRL => format!("srl {rd}, {rt}, {}", c.shamt()),
            special::SRA => format!("sra {rd}, {rt}, {}", c.shamt()),
            special::SLLV => format!("sllv {rd}, {rt}, {rs}"),
            special::SRLV => format!("srlv {rd}, {rt}, {rs}"),
            special::SRAV => format!("srav {rd}, {rt}, {rs}"),
            special::JR => format!("jr {rs}"),
            special::JALR => format!("jalr {rd}, {rs}"),
            special::SYSCALL => "syscall".to_string(),
            special::BREAK => "break".to_string(),
            special::MFHI => format!("mfhi {rd}"),
            special::MTHI => format!("mthi {rs}"),
            special::MFLO => format!("mflo {rd}"),
            special::MTLO => format!("mtlo {rs}"),
            special::MULT => format!("mult {rs}, {rt}"),
            special::MULTU => format!("multu {rs}, {rt}"),
            special::DIV => format!("div {rs}, {rt}"),
            special::DIVU => format!("divu {rs}, {rt}"),
            special::ADD => format!("add {rd}, {rs}, {rt}"),
            special::ADDU => format!("addu {rd}, {rs}, {rt}"),
            special::SUB => format!("sub {rd}, {rs}, {rt}"),
            special::SUBU => format!("subu {rd}, {rs}, {rt}"),
            special::AND => format!("and {rd}, {rs}, {rt}"),
            special::OR => format!("or {rd}, {rs}, {rt}"),
            special::XOR => format!("xor {rd}, {rs}, {rt}"),
            special::NOR => format!("nor {rd}, {rs}, {rt}"),
            special::SLT => format!("slt {rd}, {rs}, {rt}"),
            special::SLTU => format!("sltu {rd}, {rs}, {rt}"),
            _ => unknown(c),
        },
        op::REGIMM => match c.rt() {
            regimm::BLTZ => format!("bltz {rs}, 0x{target:08x}"),
            regimm::BGEZ => format!("bgez {rs}, 0x{target:08x}"),
            regimm::BLTZAL => format!("bltzal {rs}, 0x{target:08x}"),
            regimm::BGEZAL => format!("bgezal {rs}, 0x{target:08x}"),
            _ => unknown(c),
        },
        op::J => format!("j 0x{target:08x}"),
        op::JAL => format!("jal 0x{target:08x}"),
        op::BEQ => format!("beq {rs}, {rt}, 0x{target:08x}"),
        op::BNE => format!("bne {rs}, {rt}, 0x{target:08x}"),
        op::BLEZ => format!("blez {rs}, 0x{target:08x}"),
        op::BGTZ => format!("bgtz {rs}, 0x{target:08x}"),
        op::ADDI => format!("addi {rt}, {rs}, {}", c.simm()),
        op::ADDIU => format!("addiu {rt}, {rs}, {}", c.simm()),
        op::SLTI => format!("slti {rt}, {rs}, {}", c.simm()),
        op::SLTIU => format!("sltiu {rt}, {rs}, {}", c.simm()),
        op::ANDI => format!("andi {rt}, {rs}, 0x{:04x}", c.imm()),
        op::ORI => format!("ori {rt}, {rs}, 0x{:04x}", c.imm()),
        op::XORI => format!("xori {rt}, {rs}, 0x{:04x}", c.imm()),
        op::LUI => format!("lui {rt}, 0x{:04x}", c.imm()),
        op::CP0 | op::CP2 => format_cop(c),
        op::LB => mem("lb", rt, c, rs),
        op::LH => mem("lh", rt, c, rs),
        op::LWL => mem("lwl", rt, c, rs),
        op::LW => mem("lw", rt, c, rs),
        op::LBU => mem("lbu", rt, c, rs),
        op::LHU => mem("lhu", rt, c, rs),
        op::LWR => mem("lwr", rt, c, rs),
        op::SB => mem("sb", rt, c, rs),
        op::SH => mem("sh", rt, c, rs),
        op::SWL => mem("swl", rt, c, rs),
        op::SW => mem("sw", rt, c, rs),
        op::SWR => mem("swr", rt, c, rs),
        op::LWC2 => format!("lwc2 {}, {}({rs})", c.rt(), c.simm()),
        op::SWC2 => format!("swc2 {}, {}({rs})", c.rt(), c.simm()),
        _ => unknown(c),
    }
}

fn mem(name: &str, rt: &str, c: &Opcode, rs: &str) -> String {
    format!("{name} {rt}, {}({rs})", c.simm())
}

fn format_cop(c: &Opcode) -> String {
    let z = if c.op() == op::CP0 { 0 } else { 2 };
    if c.rs() & 0x10 != 0 {
        if z == 0 && c.funct() == cop::RFE {
            return "rfe".to_string();
        }
        return format!("cop{z} 0x{:07x}", c.c & 0x01ff_ffff);
    }
    let rt = r(c.rt());
    match c.rs() {
        cop::MFC => format!("mfc{z} {rt}, ${}", c.rd()),
        cop::CFC => format!("cfc{z} {rt}, ${}", c.rd()),
        cop::MTC => format!("mtc{z} {rt}, ${}", c.rd()),
        cop::CTC => format!("ctc{z} {rt}, ${}", c.rd()),
        _ => unknown(c),
    }
}

fn unknown(c: &Opcode) -> String {
    format!(".word 0x{:08x}", c.c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::opcode::asm;

    fn fmt(word: u32, pc: u32) -> String {
        format_instruction(&Opcode::new(word), pc)
    }

    #[test]
    fn test_format_instruction() {
        assert_eq!(fmt(asm::NOP, 0), "nop");
        assert_eq!(fmt(asm::addiu(4, 4, -4), 0), "addiu a0, a0, -4");
        assert_eq!(fmt(asm::sw(0, 0, 4), 0), "sw zero, 0(a0)");
        assert_eq!(fmt(asm::jr(31), 0), "jr ra");
        assert_eq!(fmt(asm::bne(5, 0, -4), 0x8000_0010), "bne a1, zero, 0x80000004");
        assert_eq!(fmt(asm::mtc0(2, 12), 0), "mtc0 v0, $12");
        assert_eq!(fmt(asm::rfe(), 0), "rfe");
        assert_eq!(fmt(0xfc00_0000, 0), ".word 0xfc000000");
    }

    #[test]
    fn test_block_listing_includes_flags() {
        let mut store = Opcode::new(asm::sw(0, 0, 4));
        store.flags.insert(OpFlags::DIRECT_IO);
        let listing = disassemble_block(0x8000_1000, &[store, Opcode::NOP], &DisasmConfig::default());
        assert!(listing.contains("80001000:  sw zero, 0(a0)    ;; direct_io"));
        assert!(listing.contains("80001004:  nop"));
    }
}
