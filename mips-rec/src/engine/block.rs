//! Blocks: decoded guest instruction runs and their compiled code.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;

use super::lut::{CodeId, CodeLut, LutEntry};
use crate::backend::HostCode;
use crate::cpu::opcode::{OpFlags, Opcode};
use crate::memory::kunseg;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Tagging changed since the code was generated.
        const SHOULD_RECOMPILE = 1 << 0;
        /// Always interpreted.
        const NEVER_COMPILE = 1 << 1;
        /// Superseded or evicted; waiting for the reaper.
        const IS_DEAD = 1 << 2;
        /// Every memory access is tagged; the opcode list can go once compiled.
        const FULLY_TAGGED = 1 << 3;
        /// Recognized memset loop.
        const IS_MEMSET = 1 << 4;
    }
}

/// Compiled code published for a block.
pub struct CompiledCode {
    pub id: CodeId,
    pub function: Arc<dyn HostCode>,
    pub size: usize,
    /// Code Address Table slots this code was published to.
    pub slots: Vec<usize>,
    pub block: Weak<Block>,
}

impl std::fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledCode")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A run of guest instructions starting at `pc`.
///
/// Shared between the dispatcher, the block cache and the recompiler thread,
/// so everything mutable sits behind atomics or a lock.
pub struct Block {
    pc: u32,
    nb_ops: u16,
    hash: u32,
    flags: AtomicU32,
    ops: Mutex<Option<Vec<Opcode>>>,
    code: Mutex<Option<Arc<CompiledCode>>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("nb_ops", &self.nb_ops)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Block {
    pub fn new(pc: u32, ops: Vec<Opcode>, flags: BlockFlags) -> Self {
        let hash = hash_words(ops.iter().map(|o| o.c));
        Self {
            pc,
            nb_ops: ops.len() as u16,
            hash,
            flags: AtomicU32::new(flags.bits()),
            ops: Mutex::new(Some(ops)),
            code: Mutex::new(None),
        }
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Physical start address.
    #[inline]
    pub fn kpc(&self) -> u32 {
        kunseg(self.pc)
    }

    #[inline]
    pub fn nb_ops(&self) -> usize {
        self.nb_ops as usize
    }

    /// Address following the last opcode.
    pub fn end_pc(&self) -> u32 {
        self.pc.wrapping_add(u32::from(self.nb_ops) * 4)
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub fn flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn has(&self, flags: BlockFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn set_flags(&self, flags: BlockFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn clear_flags(&self, flags: BlockFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Run `f` on the opcode list; `None` once the list has been freed.
    pub fn with_ops<R>(&self, f: impl FnOnce(&mut [Opcode]) -> R) -> Option<R> {
        self.ops.lock().as_mut().map(|ops| f(ops))
    }

    /// Copy of the opcode list for code generation.
    pub fn ops_snapshot(&self) -> Option<Vec<Opcode>> {
        self.ops.lock().clone()
    }

    pub fn has_ops(&self) -> bool {
        self.ops.lock().is_some()
    }

    /// Drop the opcode list; returns whether it was still present.
    pub fn free_ops(&self) -> bool {
        self.ops.lock().take().is_some()
    }

    /// Tag opcode `index` with `tag` if it is not tagged yet. Returns `true`
    /// when the tag is new.
    pub fn tag_op(&self, index: usize, tag: OpFlags) -> bool {
        let mut guard = self.ops.lock();
        let Some(op) = guard.as_mut().and_then(|ops| ops.get_mut(index)) else {
            return false;
        };
        if op.is_tagged() {
            return false;
        }
        op.flags.insert(tag);
        true
    }

    /// A memory access of the compiled code got its first tag: ask for new
    /// code and send the dispatcher back through the driver.
    pub fn flag_recompile(&self, lut: &CodeLut) {
        let Some(code) = self.code() else {
            return;
        };
        self.set_flags(BlockFlags::SHOULD_RECOMPILE);
        if let Some(slot) = lut.index(self.pc) {
            lut.compare_exchange(
                slot,
                LutEntry::Code {
                    id: code.id,
                    offset: 0,
                },
                LutEntry::Pending,
            );
        }
        log::debug!(
            "[REC] Block at {:#010x} has new access tags, flagged for recompilation",
            self.pc
        );
    }

    pub fn code(&self) -> Option<Arc<CompiledCode>> {
        self.code.lock().clone()
    }

    pub fn has_code(&self) -> bool {
        self.code.lock().is_some()
    }

    /// Install new code, returning the previous code.
    pub fn replace_code(&self, code: Arc<CompiledCode>) -> Option<Arc<CompiledCode>> {
        self.code.lock().replace(code)
    }

    pub fn take_code(&self) -> Option<Arc<CompiledCode>> {
        self.code.lock().take()
    }
}

/// Every load and store carries an access tag.
pub fn is_fully_tagged(ops: &[Opcode]) -> bool {
    ops.iter().filter(|o| o.is_memory()).all(|o| o.is_tagged())
}

/// Jenkins one-at-a-time hash over instruction words.
pub fn hash_words(words: impl IntoIterator<Item = u32>) -> u32 {
    let mut hash = 0xffff_ffffu32;
    for w in words {
        hash = hash.wrapping_add(w);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::opcode::asm;

    fn block() -> Block {
        Block::new(
            0x8000_1000,
            vec![
                Opcode::new(asm::sw(0, 0, 4)),
                Opcode::new(asm::addiu(4, 4, 4)),
                Opcode::new(asm::jr(31)),
                Opcode::NOP,
            ],
            BlockFlags::empty(),
        )
    }

    #[test]
    fn test_flags() {
        let b = block();
        b.set_flags(BlockFlags::SHOULD_RECOMPILE | BlockFlags::IS_DEAD);
        assert!(b.has(BlockFlags::IS_DEAD));
        b.clear_flags(BlockFlags::SHOULD_RECOMPILE);
        assert_eq!(b.flags(), BlockFlags::IS_DEAD);
        assert_eq!(b.kpc(), 0x1000);
        assert_eq!(b.end_pc(), 0x8000_1010);
    }

    #[test]
    fn test_tagging_and_full_tag() {
        let b = block();
        assert!(!b.with_ops(|ops| is_fully_tagged(ops)).unwrap());
        assert!(b.tag_op(0, OpFlags::DIRECT_IO));
        assert!(!b.tag_op(0, OpFlags::HW_IO));
        assert!(b.with_ops(|ops| is_fully_tagged(ops)).unwrap());

        assert!(b.free_ops());
        assert!(!b.free_ops());
        assert!(!b.tag_op(0, OpFlags::DIRECT_IO));
        assert!(b.ops_snapshot().is_none());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = hash_words([1, 2, 3]);
        assert_eq!(a, hash_words([1, 2, 3]));
        assert_ne!(a, hash_words([1, 2, 4]));
        assert_eq!(block().hash(), block().hash());
    }
}
