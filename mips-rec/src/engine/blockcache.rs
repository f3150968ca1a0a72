//! Block cache: PC → block.
//!
//! A small direct-mapped hot table in front of a bucketed table. Buckets hold
//! block handles with the most recently registered block first. Both tables
//! are indexed by the physical address, so the same code reached through
//! KUSEG, KSEG0 or KSEG1 finds the same block.

use std::sync::Arc;

use super::block::Block;
use super::lut::{CodeLut, LutEntry};
use crate::memory::kunseg;

pub const TINY_LUT_SIZE: usize = 0x100;
pub const LUT_SIZE: usize = 0x4000;

pub struct BlockCache {
    tiny: Box<[Option<Arc<Block>>]>,
    buckets: Box<[Vec<Arc<Block>>]>,
    count: usize,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            tiny: vec![None; TINY_LUT_SIZE].into_boxed_slice(),
            buckets: (0..LUT_SIZE).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    #[inline]
    fn tiny_index(kpc: u32) -> usize {
        (kpc >> 2) as usize & (TINY_LUT_SIZE - 1)
    }

    #[inline]
    fn bucket_index(kpc: u32) -> usize {
        (kpc >> 2) as usize & (LUT_SIZE - 1)
    }

    /// Block starting at `pc`, if cached.
    pub fn find(&self, pc: u32) -> Option<Arc<Block>> {
        let kpc = kunseg(pc);
        if let Some(block) = &self.tiny[Self::tiny_index(kpc)] {
            if block.kpc() == kpc {
                return Some(Arc::clone(block));
            }
        }
        self.buckets[Self::bucket_index(kpc)]
            .iter()
            .find(|b| b.kpc() == kpc)
            .cloned()
    }

    /// Insert `block` and point its Code Address Table slot at the driver.
    pub fn register(&mut self, block: Arc<Block>, lut: &CodeLut) {
        let kpc = block.kpc();
        if let Some(index) = lut.index(kpc) {
            lut.note_span(index, block.nb_ops(), true);
            lut.store(index, LutEntry::Pending);
        }
        self.tiny[Self::tiny_index(kpc)] = Some(Arc::clone(&block));
        self.buckets[Self::bucket_index(kpc)].insert(0, block);
        self.count += 1;
    }

    /// Remove `block`, null its slot and unpublish its code.
    ///
    /// Panics if `block` is not cached.
    pub fn unregister(&mut self, block: &Arc<Block>, lut: &CodeLut) {
        let kpc = block.kpc();
        let bucket = &mut self.buckets[Self::bucket_index(kpc)];
        let Some(pos) = bucket.iter().position(|b| Arc::ptr_eq(b, block)) else {
            log::error!("[REC] Block at PC {:#010x} is not in cache", block.pc());
            panic!("unregistering uncached block {:#010x}", block.pc());
        };
        bucket.remove(pos);
        self.count -= 1;

        if let Some(index) = lut.index(kpc) {
            lut.store(index, LutEntry::Null);
        }
        if let Some(code) = block.code() {
            lut.retire(code.id, &code.slots);
        }

        let tiny = &mut self.tiny[Self::tiny_index(kpc)];
        if tiny.as_ref().is_some_and(|b| Arc::ptr_eq(b, block)) {
            *tiny = None;
        }
    }

    /// A cached block whose slot was nulled by invalidation.
    pub fn is_outdated(&self, block: &Block, lut: &CodeLut) -> bool {
        match lut.index(block.kpc()) {
            Some(index) => lut.load(index).is_null(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    /// Remove every block without touching the Code Address Table.
    pub fn drain(&mut self) -> Vec<Arc<Block>> {
        self.tiny.iter_mut().for_each(|t| *t = None);
        self.count = 0;
        self.buckets.iter_mut().flat_map(|b| b.drain(..)).collect()
    }
}
