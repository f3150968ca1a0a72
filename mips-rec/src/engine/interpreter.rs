//! Block interpreter.
//!
//! Runs the opcodes of a block with the same observable semantics as
//! compiled code: 2 cycles per instruction, memory through
//! [`CpuState::rw`], runtime tagging of loads and stores. It is the only
//! engine that handles every corner of the pipeline, so compiled code leaves
//! branches it cannot express (`EMULATE_BRANCH`) to it.
//!
//! ## Pipeline model
//!
//! ```text
//!   pc ──exec──▶ branch taken?  ──yes──▶ pending = target
//!    │                                         │
//!    └── next pc = previous pending, or pc + 4 ◀┘
//! ```
//!
//! A branch sitting in the delay slot of a taken branch therefore runs one
//! instruction at the first target before jumping to its own target, which is
//! what the R3000A does. That instruction may lie outside the block, in which
//! case it is fetched straight from memory.
//!
//! The load delay slot is not modelled.

use super::block::Block;
use super::optimizer::decode_block;
use crate::cpu::alu::{AluOp, Cond, is_branch_and_link, mul_div};
use crate::cpu::opcode::{OpFlags, Opcode, cop, op, special};
use crate::cpu::{CpuState, ExitFlags, reg};

/// Cycles charged per interpreted opcode.
pub const CYCLES_PER_OP: u32 = 2;

/// Effect of one instruction on control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Next,
    /// Branch or jump taken; the delay slot runs first.
    Branch(u32),
    /// Leave the block now with this PC.
    Exit(u32),
}

/// Interpret `block` starting at `pc` (which must lie inside it) until
/// control leaves the block. Returns the next PC.
pub fn emulate_block(state: &mut CpuState, block: &Block, pc: u32) -> u32 {
    let base = block.pc();
    let start = (pc.wrapping_sub(base) >> 2) as usize;

    let outcome = block.with_ops(|ops| {
        let mut tagged = false;
        let next = run(state, base, ops, start, &mut tagged);
        (next, tagged)
    });

    match outcome {
        Some((next, tagged)) => {
            if tagged {
                block.flag_recompile(state.code_lut());
            }
            next
        }
        None => {
            // The opcode list went away with full tagging; decode it again.
            match decode_block(&state.memory, base, block.nb_ops()) {
                Ok(mut ops) => {
                    ops.truncate(block.nb_ops());
                    let mut tagged = false;
                    run(state, base, &mut ops, start, &mut tagged)
                }
                Err(fault) => {
                    log::error!("[REC] Cannot re-decode block at {base:#010x}: {fault}");
                    state.set_exit(ExitFlags::SEGFAULT);
                    pc
                }
            }
        }
    }
}

fn run(state: &mut CpuState, base: u32, ops: &mut [Opcode], start: usize, tagged: &mut bool) -> u32 {
    let len = ops.len();
    let in_block = |pc: u32| -> Option<usize> {
        let off = pc.wrapping_sub(base);
        let index = (off >> 2) as usize;
        (off & 3 == 0 && index < len).then_some(index)
    };

    let mut pc = base.wrapping_add(start as u32 * 4);
    let mut pending: Option<u32> = None;

    loop {
        let Some(index) = in_block(pc) else {
            return match pending {
                Some(target) => run_outside(state, pc, target),
                None => pc,
            };
        };

        let delayed = pending.take();
        state.clock.add(CYCLES_PER_OP);
        let opcode = ops[index];
        let step = if opcode.is_memory() {
            let mut flags = opcode.flags;
            let step = execute(state, opcode, pc, Some(&mut flags));
            if flags != opcode.flags {
                ops[index].flags = flags;
                *tagged = true;
            }
            step
        } else {
            execute(state, opcode, pc, None)
        };

        let next = match (step, delayed) {
            (Step::Exit(next), _) => return next,
            (Step::Branch(target), Some(first)) => {
                pending = Some(target);
                first
            }
            (Step::Branch(target), None) => {
                pending = Some(target);
                pc.wrapping_add(4)
            }
            (Step::Next, Some(target)) => target,
            (Step::Next, None) => pc.wrapping_add(4),
        };

        if let Some(target) = delayed {
            // Backward jumps inside the block give the host a chance to stop.
            let looping = in_block(target).is_some_and(|t| t <= index);
            if looping && pending.is_none() && state.clock.should_stop() {
                return target;
            }
        }
        pc = next;
    }
}

/// Run the single instruction at `pc`, outside of any block, then continue
/// at `target`.
fn run_outside(state: &mut CpuState, pc: u32, target: u32) -> u32 {
    let word = match state.memory.read_u32(pc) {
        Ok(word) => word,
        Err(fault) => {
            log::error!("[REC] Cannot fetch delay slot at {pc:#010x}: {fault}");
            state.set_exit(ExitFlags::SEGFAULT);
            return pc;
        }
    };
    state.clock.add(CYCLES_PER_OP);
    match execute(state, Opcode::new(word), pc, None) {
        Step::Exit(next) => next,
        // A branch here would need a third level of pipelining.
        Step::Branch(_) | Step::Next => target,
    }
}

fn execute(state: &mut CpuState, c: Opcode, pc: u32, flags: Option<&mut OpFlags>) -> Step {
    let regs = &mut state.regs;
    let rs = regs.get(c.rs());
    let rt = regs.get(c.rt());

    match c.op() {
        op::SPECIAL => match c.funct() {
            special::SLL | special::SRL | special::SRA => {
                if let Some(kind) = AluOp::from_special(c.funct()) {
                    regs.set(c.rd(), kind.apply(rt, u32::from(c.shamt())));
                }
            }
            special::SLLV | special::SRLV | special::SRAV => {
                if let Some(kind) = AluOp::from_special(c.funct()) {
                    regs.set(c.rd(), kind.apply(rt, rs));
                }
            }
            special::JR => return Step::Branch(rs),
            special::JALR => {
                regs.set(c.rd(), pc.wrapping_add(8));
                return Step::Branch(rs);
            }
            special::SYSCALL => {
                state.set_exit(ExitFlags::SYSCALL);
                return Step::Exit(pc);
            }
            special::BREAK => {
                state.set_exit(ExitFlags::BREAK);
                return Step::Exit(pc);
            }
            special::MFHI => regs.set(c.rd(), regs.hi),
            special::MFLO => regs.set(c.rd(), regs.lo),
            special::MTHI => regs.hi = rs,
            special::MTLO => regs.lo = rs,
            special::MULT | special::MULTU | special::DIV | special::DIVU => {
                let (lo, hi) = mul_div(c.funct(), rs, rt);
                regs.lo = lo;
                regs.hi = hi;
            }
            funct => match AluOp::from_special(funct) {
                Some(kind) => regs.set(c.rd(), kind.apply(rs, rt)),
                None => return unknown(state, c, pc),
            },
        },
        op::J => return Step::Branch(c.branch_target(pc).unwrap_or(pc)),
        op::JAL => {
            regs.set(reg::RA, pc.wrapping_add(8));
            return Step::Branch(c.branch_target(pc).unwrap_or(pc));
        }
        op::BEQ | op::BNE | op::BLEZ | op::BGTZ | op::REGIMM => {
            let Some(cond) = Cond::of(&c) else {
                return unknown(state, c, pc);
            };
            if is_branch_and_link(&c) {
                regs.set(reg::RA, pc.wrapping_add(8));
            }
            if cond.eval(rs, rt) {
                return Step::Branch(c.branch_target(pc).unwrap_or(pc));
            }
        }
        op::LUI => regs.set(c.rt(), u32::from(c.imm()) << 16),
        op::CP0 | op::CP2 => return execute_cop(state, c, pc, rt),
        _ if c.is_memory() => {
            let value = state.rw(c, rs, rt, flags);
            if state.clock.exit.contains(ExitFlags::SEGFAULT) {
                return Step::Exit(pc);
            }
            if c.is_load() && c.op() != op::LWC2 {
                state.regs.set(c.rt(), value);
            }
        }
        _ => match AluOp::from_immediate(&c) {
            Some((kind, imm)) => regs.set(c.rt(), kind.apply(rs, imm)),
            None => return unknown(state, c, pc),
        },
    }
    Step::Next
}

fn execute_cop(state: &mut CpuState, c: Opcode, pc: u32, rt: u32) -> Step {
    if c.rs() & 0x10 != 0 {
        state.cop_execute(&c);
        return Step::Next;
    }
    match c.rs() {
        cop::MFC | cop::CFC => {
            let value = state.cop_read(&c, c.rd(), c.rs() == cop::CFC);
            state.regs.set(c.rt(), value);
        }
        cop::MTC | cop::CTC => {
            state.cop_write(&c, c.rd(), rt, c.rs() == cop::CTC);
            if c.is_syscall() {
                // Status/Cause changed: let the host look for interrupts.
                return Step::Exit(pc.wrapping_add(4));
            }
        }
        _ => return unknown(state, c, pc),
    }
    Step::Next
}

fn unknown(state: &mut CpuState, c: Opcode, pc: u32) -> Step {
    log::warn!("[REC] Unknown opcode {:#010x} at {:#010x}", c.c, pc);
    state.set_exit(ExitFlags::UNKNOWN_OP);
    Step::Exit(pc)
}
