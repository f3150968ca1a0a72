//! Block decoding and the optimizer passes run on a freshly decoded block.
//!
//! ## Block boundaries
//!
//! A block starts at the requested PC and ends at the first syscall-class
//! instruction (inclusive) or at the first unconditional jump plus its delay
//! slot. It is also cut at the end of the containing region and at
//! `max_block_ops`; a cut that would separate a branch from its delay slot
//! keeps the delay slot.
//!
//! ## Passes
//!
//! | pass | effect |
//! |------|--------|
//! | impossible branches | branch in a delay slot → `EMULATE_BRANCH` |
//! | local branches | in-block targets → `LOCAL_BRANCH` / `SYNC` |
//! | nop delay slots | `NO_DS` on the branch |
//! | static I/O | constant base address → `DIRECT_IO` / `HW_IO` |
//! | memset | BIOS memset loop → `IS_MEMSET` |

use super::block::BlockFlags;
use crate::config::EngineConfig;
use crate::cpu::opcode::{OpFlags, Opcode, op, special};
use crate::cpu::reg;
use crate::error::Fault;
use crate::memory::{MemoryMap, RegionKind};

/// Decode the block starting at `pc`.
///
/// Fails when `pc` is not in a direct region.
pub fn decode_block(memory: &MemoryMap, pc: u32, max_ops: usize) -> Result<Vec<Opcode>, Fault> {
    let r = memory.resolve(pc)?;
    if r.kind != RegionKind::Direct {
        return Err(Fault::NoMapping(pc));
    }
    let bytes = memory.direct(r.index).ok_or(Fault::NoMapping(pc))?;
    let start = r.offset as usize & !3;
    let words = bytes.len().saturating_sub(start) / 4;
    if words == 0 {
        return Err(Fault::OutOfBounds(pc));
    }
    let limit = words.min(max_ops.max(2));

    let word_at = |i: usize| {
        let at = start + i * 4;
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };

    let mut ops = Vec::with_capacity(limit.min(64));
    for i in 0..words {
        let c = Opcode::new(word_at(i));
        ops.push(c);
        if c.is_syscall() {
            break;
        }
        let ends_here = i + 1 >= limit;
        if c.is_unconditional_jump() || (ends_here && c.has_delay_slot()) {
            if i + 1 < words {
                ops.push(Opcode::new(word_at(i + 1)));
            }
            break;
        }
        if ends_here {
            break;
        }
    }
    Ok(ops)
}

/// Run the optimizer passes enabled in `config` over a decoded block.
/// Returns the block flags they imply.
pub fn optimize(
    memory: &MemoryMap,
    pc: u32,
    ops: &mut [Opcode],
    config: &EngineConfig,
) -> BlockFlags {
    let mut flags = BlockFlags::empty();

    if config.detect_impossible_branches && detect_impossible_branches(ops) {
        flags |= BlockFlags::NEVER_COMPILE;
    }
    if config.local_branches {
        flag_local_branches(pc, ops);
    }
    flag_nop_delay_slots(ops);
    if config.flag_io {
        flag_static_io(memory, ops);
    }
    if config.replace_memset && is_memset_loop(pc, ops) {
        flags |= BlockFlags::IS_MEMSET;
    }
    flags
}

/// Tag branches whose delay slot holds another branch. Returns whether the
/// first opcode is one of them.
fn detect_impossible_branches(ops: &mut [Opcode]) -> bool {
    for i in 0..ops.len().saturating_sub(1) {
        if ops[i].has_delay_slot() && ops[i + 1].has_delay_slot() {
            log::debug!("[REC] Impossible branch at offset {:#x}", i << 2);
            ops[i].flags.insert(OpFlags::EMULATE_BRANCH);
        }
    }
    ops.first()
        .is_some_and(|o| o.flags.contains(OpFlags::EMULATE_BRANCH))
}

fn flag_local_branches(pc: u32, ops: &mut [Opcode]) {
    let len = ops.len();
    for i in 0..len {
        let c = ops[i];
        if !c.is_branch() || c.flags.contains(OpFlags::EMULATE_BRANCH) {
            continue;
        }
        let Some(target) = c.branch_target(pc.wrapping_add(i as u32 * 4)) else {
            continue;
        };
        let offset = target.wrapping_sub(pc) as usize / 4;
        if target.wrapping_sub(pc) % 4 == 0 && offset < len {
            ops[i].flags.insert(OpFlags::LOCAL_BRANCH);
            ops[offset].flags.insert(OpFlags::SYNC);
        }
    }
}

fn flag_nop_delay_slots(ops: &mut [Opcode]) {
    for i in 0..ops.len().saturating_sub(1) {
        if ops[i].has_delay_slot() && ops[i + 1].is_nop() {
            ops[i].flags.insert(OpFlags::NO_DS);
        }
    }
}

/// Constant tracking over `lui`/`ori`/`addiu` to resolve memory accesses
/// whose base address is known at decode time.
fn flag_static_io(memory: &MemoryMap, ops: &mut [Opcode]) {
    let mut known: [Option<u32>; 32] = [None; 32];
    known[0] = Some(0);

    for c in ops.iter_mut() {
        // Branch targets merge paths; forget everything.
        if c.flags.contains(OpFlags::SYNC) {
            known = [None; 32];
            known[0] = Some(0);
        }

        if c.is_memory() && !c.is_tagged() {
            if let Some(base) = known[c.rs() as usize] {
                let addr = base.wrapping_add(i32::from(c.simm()) as u32);
                match memory.resolve(addr) {
                    Ok(r) if r.kind == RegionKind::Direct => c.flags.insert(OpFlags::DIRECT_IO),
                    Ok(_) => c.flags.insert(OpFlags::HW_IO),
                    Err(_) => {}
                }
            }
        }

        let value = match c.op() {
            op::LUI => Some(u32::from(c.imm()) << 16),
            op::ORI => known[c.rs() as usize].map(|v| v | u32::from(c.imm())),
            op::ADDIU | op::ADDI => {
                known[c.rs() as usize].map(|v| v.wrapping_add(i32::from(c.simm()) as u32))
            }
            op::SPECIAL if matches!(c.funct(), special::ADDU | special::OR) => {
                match (known[c.rs() as usize], known[c.rt() as usize]) {
                    (Some(a), Some(b)) if c.funct() == special::ADDU => Some(a.wrapping_add(b)),
                    (Some(a), Some(b)) => Some(a | b),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(rd) = c.dest_reg() {
            if rd != 0 && (rd as usize) < known.len() {
                known[rd as usize] = value;
            }
        }
    }
}

/// The BIOS memset loop:
///
/// ```text
///   loop: sw    $zero, 0($a0)       ; these two in either order
///         addiu $a1, $a1, -1
///         bne   $a1, $zero, loop
///         addiu $a0, $a0, 4         ; delay slot
///         jr    $ra
///         <delay slot>
/// ```
fn is_memset_loop(pc: u32, ops: &[Opcode]) -> bool {
    if ops.len() != 6 {
        return false;
    }
    let is_store = |c: &Opcode| c.op() == op::SW && c.rs() == reg::A0 && c.rt() == 0 && c.imm() == 0;
    let is_count = |c: &Opcode| {
        c.op() == op::ADDIU && c.rs() == reg::A1 && c.rt() == reg::A1 && c.simm() == -1
    };
    let body = (is_store(&ops[0]) && is_count(&ops[1])) || (is_count(&ops[0]) && is_store(&ops[1]));
    let branch = ops[2].op() == op::BNE
        && ops[2].rs() == reg::A1
        && ops[2].rt() == 0
        && ops[2].branch_target(pc.wrapping_add(8)) == Some(pc);
    let advance = ops[3].op() == op::ADDIU
        && ops[3].rs() == reg::A0
        && ops[3].rt() == reg::A0
        && ops[3].simm() == 4;
    let ret = ops[4].op() == op::SPECIAL && ops[4].funct() == special::JR && ops[4].rs() == reg::RA;
    body && branch && advance && ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::opcode::asm;
    use crate::memory::tests::small_map;

    fn decode(words: &[u32], max_ops: usize) -> Vec<Opcode> {
        let mut memory = small_map();
        memory.write_words(0x1000, words).unwrap();
        decode_block(&memory, 0x8000_1000, max_ops).unwrap()
    }

    fn ops(words: &[u32]) -> Vec<Opcode> {
        words.iter().map(|&w| Opcode::new(w)).collect()
    }

    #[test]
    fn test_block_ends_after_jump_delay_slot() {
        let block = decode(
            &[asm::addiu(2, 0, 1), asm::jr(31), asm::addiu(3, 0, 2), asm::brk()],
            256,
        );
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_block_ends_at_syscall() {
        let block = decode(&[asm::addiu(2, 0, 1), asm::syscall(), asm::NOP], 256);
        assert_eq!(block.len(), 2);

        let block = decode(&[asm::mtc0(2, 12), asm::NOP], 256);
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn test_conditional_branch_does_not_end_block() {
        let block = decode(
            &[asm::bne(4, 0, 4), asm::NOP, asm::addiu(2, 0, 1), asm::jr(31), asm::NOP],
            256,
        );
        assert_eq!(block.len(), 5);
        // beq $x,$x is unconditional.
        assert_eq!(decode(&[asm::beq(3, 3, 8), asm::NOP, asm::NOP], 256).len(), 2);
    }

    #[test]
    fn test_max_ops_keeps_delay_slot() {
        let block = decode(&[asm::NOP, asm::bne(4, 0, 8), asm::NOP, asm::NOP], 2);
        assert_eq!(block.len(), 3);
        let block = decode(&[asm::NOP, asm::NOP, asm::NOP, asm::NOP], 2);
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_region_end_bounds_block() {
        let mut memory = small_map();
        memory.write_words(0xfff8, &[asm::NOP, asm::NOP]).unwrap();
        assert_eq!(decode_block(&memory, 0xfff8, 256).unwrap().len(), 2);
        assert!(decode_block(&memory, 0x1f80_1000, 256).is_err());
        assert!(decode_block(&memory, 0x3000_0000, 256).is_err());
    }

    #[test]
    fn test_impossible_branch() {
        let memory = small_map();
        let mut list = ops(&[asm::jr(31), asm::j(0x100), asm::NOP]);
        let flags = optimize(&memory, 0x1000, &mut list, &EngineConfig::default());
        assert!(flags.contains(BlockFlags::NEVER_COMPILE));
        assert!(list[0].flags.contains(OpFlags::EMULATE_BRANCH));
        assert!(!list[1].flags.contains(OpFlags::EMULATE_BRANCH));

        let mut list = ops(&[asm::NOP, asm::jr(31), asm::j(0x100), asm::NOP]);
        let flags = optimize(&memory, 0x1000, &mut list, &EngineConfig::default());
        assert!(!flags.contains(BlockFlags::NEVER_COMPILE));
        assert!(list[1].flags.contains(OpFlags::EMULATE_BRANCH));
    }

    #[test]
    fn test_local_branch_and_sync() {
        let memory = small_map();
        // 0: addiu; 1: bne -> 0; 2: nop; 3: jr; 4: nop
        let mut list = ops(&[
            asm::addiu(4, 4, -1),
            asm::bne(4, 0, -2),
            asm::NOP,
            asm::jr(31),
            asm::NOP,
        ]);
        optimize(&memory, 0x1000, &mut list, &EngineConfig::default());
        assert!(list[1].flags.contains(OpFlags::LOCAL_BRANCH | OpFlags::NO_DS));
        assert!(list[0].flags.contains(OpFlags::SYNC));
        assert!(list[3].flags.contains(OpFlags::NO_DS));
    }

    #[test]
    fn test_static_io_tagging() {
        let memory = small_map();
        let mut list = ops(&[
            asm::lui(8, 0x1f80),
            asm::ori(8, 8, 0x1000),
            asm::sw(0, 0, 8),      // device
            asm::sw(0, 0x40, 0),   // direct via $zero
            asm::lw(9, 0, 10),     // unknown base
            asm::addiu(8, 0, 0x100),
            asm::lb(9, 4, 8),      // direct
            asm::jr(31),
            asm::NOP,
        ]);
        optimize(&memory, 0x1000, &mut list, &EngineConfig::default());
        assert!(list[2].flags.contains(OpFlags::HW_IO));
        assert!(list[3].flags.contains(OpFlags::DIRECT_IO));
        assert!(!list[4].is_tagged());
        assert!(list[6].flags.contains(OpFlags::DIRECT_IO));

        let mut config = EngineConfig::default();
        config.flag_io = false;
        let mut list = ops(&[asm::sw(0, 0x40, 0), asm::jr(31), asm::NOP]);
        optimize(&memory, 0x1000, &mut list, &config);
        assert!(!list[0].is_tagged());
    }

    #[test]
    fn test_memset_detection() {
        let memory = small_map();
        let pc = 0x8000_2000;
        let body = [
            asm::sw(0, 0, 4),
            asm::addiu(5, 5, -1),
            asm::bne(5, 0, -3),
            asm::addiu(4, 4, 4),
            asm::jr(31),
            asm::NOP,
        ];
        let mut list = ops(&body);
        assert!(optimize(&memory, pc, &mut list, &EngineConfig::default()).contains(BlockFlags::IS_MEMSET));

        let mut swapped = body;
        swapped.swap(0, 1);
        assert!(is_memset_loop(pc, &ops(&swapped)));

        let mut wrong = body;
        wrong[3] = asm::addiu(4, 4, 8);
        assert!(!is_memset_loop(pc, &ops(&wrong)));

        let mut config = EngineConfig::default();
        config.replace_memset = false;
        let mut list = ops(&body);
        assert!(!optimize(&memory, pc, &mut list, &config).contains(BlockFlags::IS_MEMSET));
    }
}
