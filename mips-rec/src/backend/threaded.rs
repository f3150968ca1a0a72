//! Threaded-code backend: blocks to pre-decoded host-op programs.
//!
//! Each guest opcode is lowered to a short sequence of [`HostOp`]s working on
//! a small bank of host registers managed by the [`RegCache`]. Spills become
//! explicit `Load`/`Store` ops, so the program shows exactly where guest
//! registers are read and written back.
//!
//! ## Lowering rules
//!
//! | situation | emitted |
//! |-----------|---------|
//! | memory access, coprocessor call | pending cycles, flush dirty registers, call |
//! | block exit, local branch target | pending cycles, unload all registers |
//! | conditional branch | condition latched before the delay slot |
//! | `jal`/`jalr`/`b*al` | link written before the delay slot |
//! | `EMULATE_BRANCH` | exit to the branch itself (the interpreter runs it) |
//! | `syscall`/`break` | exit flag, exit to the instruction |
//! | `mtc0` Status/Cause | exit to the next instruction |
//! | local branch | in-block jump while the cycle budget lasts |
//!
//! Every opcode costs 2 cycles, the same as in the interpreter. Cycles are
//! accumulated at compile time and charged at the next flush point.

use std::sync::Arc;

use super::{BlockSource, CodeGenerator, Emitted, HostCode};
use crate::cpu::alu::{AluOp, Cond, is_branch_and_link, mul_div};
use crate::cpu::opcode::{OpFlags, Opcode, cop, op, special};
use crate::cpu::{CpuState, ExitFlags, reg};
use crate::engine::block::Block;
use crate::engine::regcache::{HostReg, NUM_HOST_REGS, RegCache, SpillEmitter};
use crate::error::CodegenError;

/// Cycles charged per guest opcode.
pub const CYCLES_PER_OP: u32 = 2;

/// Longest program the generator agrees to produce.
const MAX_PROGRAM_LEN: usize = 1 << 20;

// ═══════════════════════════════════════════════════════════════════════════
// Host ops
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum HostOp {
    Load { host: HostReg, guest: u8 },
    Store { host: HostReg, guest: u8 },
    Tick(u32),
    Const { dst: HostReg, value: u32 },
    Mov { dst: HostReg, src: HostReg },
    Alu { kind: AluOp, dst: HostReg, a: HostReg, b: HostReg },
    AluImm { kind: AluOp, dst: HostReg, a: HostReg, imm: u32 },
    MulDiv { funct: u8, a: HostReg, b: HostReg, lo: HostReg, hi: HostReg },
    Mem {
        index: u16,
        opcode: Opcode,
        base: HostReg,
        data: Option<HostReg>,
        dst: Option<HostReg>,
    },
    CopRead { opcode: Opcode, reg: u8, control: bool, dst: HostReg },
    CopWrite { opcode: Opcode, reg: u8, control: bool, src: HostReg },
    CopExec { opcode: Opcode },
    /// Latch a branch condition.
    SetCond { cond: Cond, a: HostReg, b: HostReg },
    /// Latch a register jump target.
    SetTarget { src: HostReg },
    Raise { flags: ExitFlags },
    Exit { pc: u32 },
    ExitToTarget,
    ExitIf { pc: u32 },
    /// In-block jump to program index `label`; exits to `pc` when the run
    /// has to stop.
    Jump { label: usize, pc: u32 },
    JumpIf { label: usize, pc: u32 },
}

impl SpillEmitter for Vec<HostOp> {
    fn load(&mut self, host: HostReg, guest: u8) {
        self.push(HostOp::Load { host, guest });
    }

    fn store(&mut self, host: HostReg, guest: u8) {
        self.push(HostOp::Store { host, guest });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Generated code
// ═══════════════════════════════════════════════════════════════════════════

/// A compiled block.
pub struct ThreadedCode {
    pc: u32,
    program: Vec<HostOp>,
    /// (opcode offset, program index), sorted by offset.
    entries: Vec<(u16, usize)>,
}

impl ThreadedCode {
    fn entry_point(&self, entry: u16) -> Option<usize> {
        self.entries
            .binary_search_by_key(&entry, |&(offset, _)| offset)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }
}

impl HostCode for ThreadedCode {
    fn call(&self, entry: u16, state: &mut CpuState, block: &Block) -> u32 {
        let Some(mut ip) = self.entry_point(entry) else {
            log::error!(
                "[REC] No entry point at offset {} of block {:#010x}",
                entry,
                self.pc
            );
            state.set_exit(ExitFlags::UNKNOWN_OP);
            return self.pc.wrapping_add(u32::from(entry) * 4);
        };

        let mut h = [0u32; NUM_HOST_REGS];
        let mut cond = false;
        let mut target = 0u32;

        loop {
            let Some(&hop) = self.program.get(ip) else {
                // Lowering always terminates the program with an exit.
                state.set_exit(ExitFlags::UNKNOWN_OP);
                return self.pc;
            };
            ip += 1;

            match hop {
                HostOp::Load { host, guest } => h[host as usize] = state.regs.get(guest),
                HostOp::Store { host, guest } => state.regs.set(guest, h[host as usize]),
                HostOp::Tick(cycles) => state.clock.add(cycles),
                HostOp::Const { dst, value } => h[dst as usize] = value,
                HostOp::Mov { dst, src } => h[dst as usize] = h[src as usize],
                HostOp::Alu { kind, dst, a, b } => {
                    h[dst as usize] = kind.apply(h[a as usize], h[b as usize]);
                }
                HostOp::AluImm { kind, dst, a, imm } => {
                    h[dst as usize] = kind.apply(h[a as usize], imm);
                }
                HostOp::MulDiv { funct, a, b, lo, hi } => {
                    let (l, u) = mul_div(funct, h[a as usize], h[b as usize]);
                    h[lo as usize] = l;
                    h[hi as usize] = u;
                }
                HostOp::Mem {
                    index,
                    opcode,
                    base,
                    data,
                    dst,
                } => {
                    let data = data.map_or(0, |r| h[r as usize]);
                    let value = if opcode.is_tagged() {
                        state.rw(opcode, h[base as usize], data, None)
                    } else {
                        let mut tag = OpFlags::empty();
                        let value = state.rw(opcode, h[base as usize], data, Some(&mut tag));
                        if !tag.is_empty() && block.tag_op(usize::from(index), tag) {
                            block.flag_recompile(state.code_lut());
                        }
                        value
                    };
                    // Guest registers were flushed before the access.
                    if state.clock.exit.contains(ExitFlags::SEGFAULT) {
                        return self.pc.wrapping_add(u32::from(index) * 4);
                    }
                    if let Some(dst) = dst {
                        h[dst as usize] = value;
                    }
                }
                HostOp::CopRead {
                    opcode,
                    reg,
                    control,
                    dst,
                } => h[dst as usize] = state.cop_read(&opcode, reg, control),
                HostOp::CopWrite {
                    opcode,
                    reg,
                    control,
                    src,
                } => state.cop_write(&opcode, reg, h[src as usize], control),
                HostOp::CopExec { opcode } => state.cop_execute(&opcode),
                HostOp::SetCond { cond: c, a, b } => cond = c.eval(h[a as usize], h[b as usize]),
                HostOp::SetTarget { src } => target = h[src as usize],
                HostOp::Raise { flags } => state.set_exit(flags),
                HostOp::Exit { pc } => return pc,
                HostOp::ExitToTarget => return target,
                HostOp::ExitIf { pc } => {
                    if cond {
                        return pc;
                    }
                }
                HostOp::Jump { label, pc } => {
                    if state.clock.should_stop() {
                        return pc;
                    }
                    ip = label;
                }
                HostOp::JumpIf { label, pc } => {
                    if cond {
                        if state.clock.should_stop() {
                            return pc;
                        }
                        ip = label;
                    }
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lowering
// ═══════════════════════════════════════════════════════════════════════════

struct Lowering<'a> {
    pc: u32,
    ops: &'a [Opcode],
    program: Vec<HostOp>,
    /// Program index of each opcode that starts with an empty register cache.
    labels: Vec<Option<usize>>,
    /// (program index, opcode index) of in-block jumps to patch.
    fixups: Vec<(usize, usize)>,
    cycles: u32,
}

impl<'a> Lowering<'a> {
    fn new(src: &BlockSource<'a>) -> Self {
        Self {
            pc: src.pc,
            ops: src.ops,
            program: Vec::with_capacity(src.ops.len() * 3),
            labels: vec![None; src.ops.len()],
            fixups: Vec::new(),
            cycles: 0,
        }
    }

    fn pc_of(&self, index: usize) -> u32 {
        self.pc.wrapping_add(index as u32 * 4)
    }

    fn emit(&mut self, hop: HostOp) {
        self.program.push(hop);
    }

    fn flush_cycles(&mut self) {
        if self.cycles != 0 {
            let cycles = std::mem::take(&mut self.cycles);
            self.emit(HostOp::Tick(cycles));
        }
    }

    /// Prepare for a call into the host: everything it may look at must be
    /// up to date.
    fn before_call(&mut self, rc: &mut RegCache) {
        self.flush_cycles();
        rc.flush_all(&mut self.program);
    }

    fn exit(&mut self, rc: &mut RegCache, hop: HostOp) {
        self.flush_cycles();
        rc.unload_all(&mut self.program);
        self.emit(hop);
    }

    fn label(&mut self, index: usize, rc: &mut RegCache) {
        self.flush_cycles();
        rc.unload_all(&mut self.program);
        self.labels[index] = Some(self.program.len());
    }

    fn run(mut self, rc: &mut RegCache) -> Result<ThreadedCode, CodegenError> {
        let n = self.ops.len();
        let mut i = 0;
        while i < n {
            if i == 0 || self.ops[i].flags.contains(OpFlags::SYNC) {
                self.label(i, rc);
            }
            i = self.lower(i, rc)?;
            rc.release_locks();
            if self.program.len() > MAX_PROGRAM_LEN {
                return Err(CodegenError::OutOfMemory);
            }
        }
        let end = self.pc_of(n);
        self.exit(rc, HostOp::Exit { pc: end });
        self.patch();

        let entries = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.map(|l| (i as u16, l)))
            .collect();
        Ok(ThreadedCode {
            pc: self.pc,
            program: self.program,
            entries,
        })
    }

    /// Resolve in-block jumps. A target that did not get a label (a delay
    /// slot lowered with its branch) leaves the block instead.
    fn patch(&mut self) {
        for &(at, target) in &self.fixups {
            let label = self.labels.get(target).copied().flatten();
            self.program[at] = match (self.program[at], label) {
                (HostOp::Jump { pc, .. }, Some(label)) => HostOp::Jump { label, pc },
                (HostOp::JumpIf { pc, .. }, Some(label)) => HostOp::JumpIf { label, pc },
                (HostOp::Jump { pc, .. }, None) => HostOp::Exit { pc },
                (HostOp::JumpIf { pc, .. }, None) => HostOp::ExitIf { pc },
                (other, _) => other,
            };
        }
    }

    /// Lower opcode `i`; returns the index of the next opcode to lower.
    fn lower(&mut self, i: usize, rc: &mut RegCache) -> Result<usize, CodegenError> {
        let c = self.ops[i];
        let pc = self.pc_of(i);

        if c.flags.contains(OpFlags::EMULATE_BRANCH) {
            self.exit(rc, HostOp::Exit { pc });
            return Ok(i + 2);
        }

        self.cycles += CYCLES_PER_OP;
        if c.has_delay_slot() {
            return self.lower_branch(i, rc);
        }
        self.lower_simple(i, c, rc);
        Ok(i + 1)
    }

    fn lower_simple(&mut self, i: usize, c: Opcode, rc: &mut RegCache) {
        let pc = self.pc_of(i);
        let p = &mut self.program;
        match c.op() {
            op::SPECIAL => match c.funct() {
                special::SLL | special::SRL | special::SRA => {
                    if let (Some(kind), true) = (AluOp::from_special(c.funct()), c.rd() != 0) {
                        let a = rc.alloc_in(p, c.rt());
                        let dst = rc.alloc_out(p, c.rd());
                        p.push(HostOp::AluImm {
                            kind,
                            dst,
                            a,
                            imm: u32::from(c.shamt()),
                        });
                    }
                }
                special::SLLV | special::SRLV | special::SRAV => {
                    if let (Some(kind), true) = (AluOp::from_special(c.funct()), c.rd() != 0) {
                        let a = rc.alloc_in(p, c.rt());
                        let b = rc.alloc_in(p, c.rs());
                        let dst = rc.alloc_out(p, c.rd());
                        p.push(HostOp::Alu { kind, dst, a, b });
                    }
                }
                special::SYSCALL => {
                    self.emit(HostOp::Raise {
                        flags: ExitFlags::SYSCALL,
                    });
                    self.exit(rc, HostOp::Exit { pc });
                }
                special::BREAK => {
                    self.emit(HostOp::Raise {
                        flags: ExitFlags::BREAK,
                    });
                    self.exit(rc, HostOp::Exit { pc });
                }
                special::MFHI | special::MFLO => {
                    if c.rd() != 0 {
                        let from = if c.funct() == special::MFHI { reg::HI } else { reg::LO };
                        let src = rc.alloc_in(p, from);
                        let dst = rc.alloc_out(p, c.rd());
                        p.push(HostOp::Mov { dst, src });
                    }
                }
                special::MTHI | special::MTLO => {
                    let to = if c.funct() == special::MTHI { reg::HI } else { reg::LO };
                    let src = rc.alloc_in(p, c.rs());
                    let dst = rc.alloc_out(p, to);
                    p.push(HostOp::Mov { dst, src });
                }
                special::MULT | special::MULTU | special::DIV | special::DIVU => {
                    let a = rc.alloc_in(p, c.rs());
                    let b = rc.alloc_in(p, c.rt());
                    let lo = rc.alloc_out(p, reg::LO);
                    let hi = rc.alloc_out(p, reg::HI);
                    p.push(HostOp::MulDiv {
                        funct: c.funct(),
                        a,
                        b,
                        lo,
                        hi,
                    });
                }
                funct => match AluOp::from_special(funct) {
                    Some(kind) => {
                        if c.rd() != 0 {
                            let a = rc.alloc_in(p, c.rs());
                            let b = rc.alloc_in(p, c.rt());
                            let dst = rc.alloc_out(p, c.rd());
                            p.push(HostOp::Alu { kind, dst, a, b });
                        }
                    }
                    None => self.unknown(rc, c, pc),
                },
            },
            op::LUI => {
                if c.rt() != 0 {
                    let dst = rc.alloc_out(p, c.rt());
                    p.push(HostOp::Const {
                        dst,
                        value: u32::from(c.imm()) << 16,
                    });
                }
            }
            op::CP0 | op::CP2 => self.lower_cop(c, pc, rc),
            _ if c.is_memory() => self.lower_mem(i, c, rc),
            _ => match AluOp::from_immediate(&c) {
                Some((kind, imm)) => {
                    if c.rt() != 0 {
                        let a = rc.alloc_in(p, c.rs());
                        let dst = rc.alloc_out(p, c.rt());
                        p.push(HostOp::AluImm { kind, dst, a, imm });
                    }
                }
                None => self.unknown(rc, c, pc),
            },
        }
    }

    fn unknown(&mut self, rc: &mut RegCache, c: Opcode, pc: u32) {
        log::warn!("[REC] Unknown opcode {:#010x} at {:#010x}", c.c, pc);
        self.emit(HostOp::Raise {
            flags: ExitFlags::UNKNOWN_OP,
        });
        self.exit(rc, HostOp::Exit { pc });
    }

    fn lower_mem(&mut self, i: usize, c: Opcode, rc: &mut RegCache) {
        self.before_call(rc);
        let p = &mut self.program;
        let base = rc.alloc_in(p, c.rs());
        let merges = matches!(c.op(), op::LWL | op::LWR);
        let data = if (c.is_store() && c.op() != op::SWC2) || merges {
            Some(rc.alloc_in(p, c.rt()))
        } else {
            None
        };
        let dst = if c.is_load() && c.op() != op::LWC2 && c.rt() != 0 {
            Some(rc.alloc_out(p, c.rt()))
        } else {
            None
        };
        p.push(HostOp::Mem {
            index: i as u16,
            opcode: c,
            base,
            data,
            dst,
        });
    }

    fn lower_cop(&mut self, c: Opcode, pc: u32, rc: &mut RegCache) {
        self.before_call(rc);
        if c.rs() & 0x10 != 0 {
            self.emit(HostOp::CopExec { opcode: c });
            return;
        }
        let p = &mut self.program;
        match c.rs() {
            cop::MFC | cop::CFC => {
                let dst = if c.rt() != 0 {
                    rc.alloc_out(p, c.rt())
                } else {
                    rc.alloc_temp(p)
                };
                p.push(HostOp::CopRead {
                    opcode: c,
                    reg: c.rd(),
                    control: c.rs() == cop::CFC,
                    dst,
                });
            }
            cop::MTC | cop::CTC => {
                let src = rc.alloc_in(p, c.rt());
                p.push(HostOp::CopWrite {
                    opcode: c,
                    reg: c.rd(),
                    control: c.rs() == cop::CTC,
                    src,
                });
                if c.is_syscall() {
                    self.exit(
                        rc,
                        HostOp::Exit {
                            pc: pc.wrapping_add(4),
                        },
                    );
                }
            }
            _ => self.unknown(rc, c, pc),
        }
    }

    fn lower_branch(&mut self, i: usize, rc: &mut RegCache) -> Result<usize, CodegenError> {
        let c = self.ops[i];
        let pc = self.pc_of(i);
        let ds = self.ops.get(i + 1).copied();

        if ds.is_some_and(|d| d.has_delay_slot()) {
            // Branch in the delay slot: only the interpreter gets this right.
            self.cycles -= CYCLES_PER_OP;
            self.exit(rc, HostOp::Exit { pc });
            return Ok(i + 2);
        }

        let p = &mut self.program;
        let register_jump = c.op() == op::SPECIAL;
        let cond = if register_jump || c.is_unconditional_jump() {
            None
        } else {
            Cond::of(&c)
        };

        if register_jump {
            let src = rc.alloc_in(p, c.rs());
            p.push(HostOp::SetTarget { src });
        } else if let Some(cond) = cond {
            let a = rc.alloc_in(p, c.rs());
            let b = rc.alloc_in(p, c.rt());
            p.push(HostOp::SetCond { cond, a, b });
        }

        let link = match c.op() {
            op::JAL => Some(reg::RA),
            op::SPECIAL if c.funct() == special::JALR => Some(c.rd()),
            _ if is_branch_and_link(&c) => Some(reg::RA),
            _ => None,
        };
        if let Some(link) = link.filter(|&r| r != 0) {
            let dst = rc.alloc_out(p, link);
            p.push(HostOp::Const {
                dst,
                value: pc.wrapping_add(8),
            });
        }
        rc.release_locks();

        if let Some(ds) = ds {
            self.cycles += CYCLES_PER_OP;
            if !c.flags.contains(OpFlags::NO_DS) {
                self.lower_simple(i + 1, ds, rc);
                rc.release_locks();
            }
        }

        let next = i + 1 + usize::from(ds.is_some());
        let local = c.flags.contains(OpFlags::LOCAL_BRANCH);
        let hop = if register_jump {
            HostOp::ExitToTarget
        } else {
            let Some(target) = c.branch_target(pc) else {
                return Err(CodegenError::Failure(format!(
                    "branch without target at {pc:#010x}"
                )));
            };
            match (cond.is_some(), local) {
                (false, true) => HostOp::Jump { label: 0, pc: target },
                (false, false) => HostOp::Exit { pc: target },
                (true, true) => HostOp::JumpIf { label: 0, pc: target },
                (true, false) => HostOp::ExitIf { pc: target },
            }
        };

        self.flush_cycles();
        rc.unload_all(&mut self.program);
        if let HostOp::Jump { pc: target, .. } | HostOp::JumpIf { pc: target, .. } = hop {
            let index = (target.wrapping_sub(self.pc) >> 2) as usize;
            self.fixups.push((self.program.len(), index));
        }
        self.emit(hop);
        Ok(next)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Generator
// ═══════════════════════════════════════════════════════════════════════════

/// The built-in code generator.
#[derive(Debug, Default)]
pub struct ThreadedGenerator {
    blocks: u64,
    host_ops: u64,
}

impl ThreadedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_compiled(&self) -> u64 {
        self.blocks
    }

    /// Average host ops per compiled block.
    pub fn avg_program_len(&self) -> f64 {
        if self.blocks == 0 {
            0.0
        } else {
            self.host_ops as f64 / self.blocks as f64
        }
    }
}

impl CodeGenerator for ThreadedGenerator {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn compile(
        &mut self,
        src: &BlockSource<'_>,
        regcache: &mut RegCache,
    ) -> Result<Emitted, CodegenError> {
        if src.ops.is_empty() {
            return Err(CodegenError::Failure(format!(
                "empty block at {:#010x}",
                src.pc
            )));
        }
        let code = Lowering::new(src).run(regcache)?;
        let targets = code
            .entries
            .iter()
            .map(|&(offset, _)| offset)
            .filter(|&offset| offset != 0)
            .collect();
        let code_size = code.len() * std::mem::size_of::<HostOp>();

        self.blocks += 1;
        self.host_ops += code.len() as u64;
        log::trace!(
            "[REC] Lowered block {:#010x}: {} opcodes → {} host ops, {} spills so far",
            src.pc,
            src.ops.len(),
            code.len(),
            regcache.spill_count()
        );

        Ok(Emitted {
            function: Arc::new(code),
            targets,
            code_size,
        })
    }
}
