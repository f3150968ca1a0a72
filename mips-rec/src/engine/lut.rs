//! Code Address Table: guest PC → entry point.
//!
//! One slot per guest word of every code-capable direct region (mirrors share
//! the slots of their canonical region). The dispatcher reads slots without
//! taking any lock; writers publish with atomic stores.
//!
//! ## Slot states
//!
//! ```text
//!   Null ──register──▶ Pending ──compile/publish──▶ Code{id, offset}
//!    ▲                    │                             │
//!    └──── invalidate ────┴──────── invalidate ─────────┘
//! ```
//!
//! `Null` means "outdated or unknown", `Pending` means "a block is registered
//! here, ask the driver". `Memset` routes to the host memset accelerator.
//!
//! ## Invalidation
//!
//! Every slot that starts code (a block start or a mid-block entry point)
//! records how many words its code spans. A write to `[addr, addr + len)`
//! nulls every slot in the range plus every slot in the preceding window of
//! `window` words whose span reaches into the range. A per-word coverage bit
//! lets writes to memory that never held a block return immediately.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use crate::memory::{MemoryMap, kunseg};

/// Identifier of a piece of compiled code.
pub type CodeId = u32;

const RAW_NULL: u64 = 0;
const RAW_PENDING: u64 = 1;
const RAW_MEMSET: u64 = 2;
/// Set in every `Code` entry so that no code id collides with the sentinels.
const CODE_TAG: u64 = 1 << 16;

/// Decoded slot content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LutEntry {
    Null,
    Pending,
    Memset,
    /// Compiled code `id`, entered at opcode `offset` of its block.
    Code { id: CodeId, offset: u16 },
}

impl LutEntry {
    fn encode(self) -> u64 {
        match self {
            LutEntry::Null => RAW_NULL,
            LutEntry::Pending => RAW_PENDING,
            LutEntry::Memset => RAW_MEMSET,
            LutEntry::Code { id, offset } => {
                (u64::from(id) << 32) | CODE_TAG | u64::from(offset)
            }
        }
    }

    fn decode(raw: u64) -> Self {
        if raw & CODE_TAG != 0 {
            return LutEntry::Code {
                id: (raw >> 32) as CodeId,
                offset: raw as u16,
            };
        }
        match raw {
            RAW_PENDING => LutEntry::Pending,
            RAW_MEMSET => LutEntry::Memset,
            _ => LutEntry::Null,
        }
    }

    pub fn is_null(self) -> bool {
        self == LutEntry::Null
    }

    pub fn code_id(self) -> Option<CodeId> {
        match self {
            LutEntry::Code { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LutRegion {
    pc: u32,
    length: u32,
    /// Length of the canonical region (mirror offsets wrap on it).
    canonical_length: u32,
    base: usize,
}

/// Location of a guest address in the table.
#[derive(Debug, Clone, Copy)]
struct SlotPos {
    /// First slot of the canonical region.
    base: usize,
    /// Number of slots of the canonical region.
    slots: usize,
    /// Slot of the address, relative to `base`.
    word: usize,
}

/// The Code Address Table.
pub struct CodeLut {
    regions: Vec<LutRegion>,
    slots: Box<[AtomicU64]>,
    spans: Box<[AtomicU16]>,
    covered: Box<[AtomicBool]>,
    window: usize,
    invalidations: AtomicU64,
}

impl CodeLut {
    /// Table for the code regions of `memory`, with the default backward
    /// invalidation window.
    pub fn new(memory: &MemoryMap) -> Self {
        Self::with_window(memory, crate::config::DEFAULT_MAX_BLOCK_OPS)
    }

    /// `max_block_ops` is the opcode limit blocks are decoded with. A branch
    /// at the limit pulls in its delay slot, so the backward window is one
    /// word longer.
    pub fn with_window(memory: &MemoryMap, max_block_ops: usize) -> Self {
        let maps = memory.regions();
        let mut bases = vec![None; maps.len()];
        let mut total = 0usize;
        for (i, map) in maps.iter().enumerate() {
            if !map.is_mirror() && memory.is_code(i) {
                bases[i] = Some(total);
                total += (map.length as usize).div_ceil(4);
            }
        }

        let mut regions = Vec::new();
        for (i, map) in maps.iter().enumerate() {
            let canonical = memory.canonical(i);
            if let Some(base) = bases[canonical] {
                regions.push(LutRegion {
                    pc: map.pc,
                    length: map.length,
                    canonical_length: maps[canonical].length,
                    base,
                });
            }
        }

        log::debug!(
            "[REC] Code address table: {} slots over {} regions",
            total,
            regions.len()
        );

        Self {
            regions,
            slots: (0..total).map(|_| AtomicU64::new(RAW_NULL)).collect(),
            spans: (0..total).map(|_| AtomicU16::new(0)).collect(),
            covered: (0..total).map(|_| AtomicBool::new(false)).collect(),
            window: max_block_ops.max(2) + 1,
            invalidations: AtomicU64::new(0),
        }
    }

    fn locate(&self, addr: u32) -> Option<SlotPos> {
        let paddr = kunseg(addr);
        let r = self
            .regions
            .iter()
            .find(|r| paddr >= r.pc && paddr - r.pc < r.length)?;
        let offset = (paddr - r.pc) % r.canonical_length;
        Some(SlotPos {
            base: r.base,
            slots: (r.canonical_length as usize).div_ceil(4),
            word: (offset >> 2) as usize,
        })
    }

    /// Slot index of `pc`, or `None` when `pc` is outside every code region.
    pub fn index(&self, pc: u32) -> Option<usize> {
        self.locate(pc).map(|p| p.base + p.word)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn load(&self, index: usize) -> LutEntry {
        LutEntry::decode(self.slots[index].load(Ordering::SeqCst))
    }

    /// Entry for `pc`; addresses without a slot read as `Null`.
    #[inline]
    pub fn get(&self, pc: u32) -> LutEntry {
        match self.index(pc) {
            Some(i) => self.load(i),
            None => LutEntry::Null,
        }
    }

    pub fn store(&self, index: usize, entry: LutEntry) {
        self.slots[index].store(entry.encode(), Ordering::SeqCst);
    }

    /// Replace the slot only if it still holds `current`.
    pub fn compare_exchange(&self, index: usize, current: LutEntry, new: LutEntry) -> bool {
        self.slots[index]
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Record that code starting at slot `index` spans `ops` words.
    ///
    /// `exact` replaces the previous span (a block start); otherwise the
    /// larger of the two is kept (a mid-block entry).
    pub fn note_span(&self, index: usize, ops: usize, exact: bool) {
        let ops = ops.min(u16::MAX as usize) as u16;
        if exact {
            self.spans[index].store(ops, Ordering::SeqCst);
        } else {
            self.spans[index].fetch_max(ops, Ordering::SeqCst);
        }
        let end = (index + ops as usize).min(self.covered.len());
        for bit in &self.covered[index..end] {
            bit.store(true, Ordering::SeqCst);
        }
    }

    /// Null every slot whose code overlaps `[addr, addr + len)`.
    ///
    /// Addresses outside the code regions are ignored. Returns the number of
    /// slots cleared.
    pub fn invalidate(&self, addr: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let Some(pos) = self.locate(addr & !3) else {
            return 0;
        };
        let first = pos.word;
        let bytes = (addr & 3) as usize + len as usize;
        let end = (first + bytes.div_ceil(4)).min(pos.slots);

        let any_covered = (first..end).any(|w| self.covered[pos.base + w].load(Ordering::SeqCst));
        if !any_covered {
            return 0;
        }

        let mut cleared = 0;
        let scan = first.saturating_sub(self.window - 1);
        for w in scan..end {
            let slot = pos.base + w;
            let span = self.spans[slot].load(Ordering::SeqCst) as usize;
            let overlaps = w >= first || (span != 0 && w + span > first);
            if overlaps && self.slots[slot].swap(RAW_NULL, Ordering::SeqCst) != RAW_NULL {
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            log::trace!("[REC] Invalidated {cleared} entries for {addr:#010x}+{len}");
        }
        cleared
    }

    /// Null every slot.
    pub fn invalidate_all(&self) {
        for slot in self.slots.iter() {
            slot.store(RAW_NULL, Ordering::SeqCst);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the given slots if they still point into code `id`.
    pub fn retire(&self, id: CodeId, slots: &[usize]) {
        for &index in slots {
            let raw = self.slots[index].load(Ordering::SeqCst);
            if LutEntry::decode(raw).code_id() == Some(id) {
                let _ = self.slots[index].compare_exchange(
                    raw,
                    RAW_NULL,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }
    }

    /// Number of invalidation calls that cleared at least one slot.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::small_map;

    fn lut() -> CodeLut {
        CodeLut::with_window(&small_map(), 16)
    }

    #[test]
    fn test_entry_encoding() {
        for e in [
            LutEntry::Null,
            LutEntry::Pending,
            LutEntry::Memset,
            LutEntry::Code { id: 1, offset: 0 },
            LutEntry::Code {
                id: 0xffff_ffff,
                offset: 513,
            },
        ] {
            assert_eq!(LutEntry::decode(e.encode()), e);
        }
    }

    #[test]
    fn test_code_id_zero_is_not_a_sentinel() {
        let sentinels = [LutEntry::Null, LutEntry::Pending, LutEntry::Memset].map(LutEntry::encode);
        for offset in 0..=2 {
            let e = LutEntry::Code { id: 0, offset };
            assert!(!sentinels.contains(&e.encode()));
            assert_eq!(LutEntry::decode(e.encode()), e);
        }

        let lut = lut();
        lut.store(3, LutEntry::Code { id: 0, offset: 0 });
        assert_eq!(lut.load(3).code_id(), Some(0));
        lut.retire(0, &[3]);
        assert!(lut.load(3).is_null());
    }

    #[test]
    fn test_invalidate_reaches_delay_slot_past_op_limit() {
        let lut = CodeLut::with_window(&small_map(), 4);
        let start = lut.index(0x100).unwrap();
        // Four opcodes plus the delay slot of the branch at the limit.
        lut.store(start, LutEntry::Code { id: 9, offset: 0 });
        lut.note_span(start, 5, true);

        assert_eq!(lut.invalidate(0x8000_0110, 4), 1);
        assert!(lut.load(start).is_null());
    }

    #[test]
    fn test_slots_cover_code_regions_and_mirrors() {
        let lut = lut();
        // 64 KiB RAM + 4 KiB ROM; the device region gets nothing.
        assert_eq!(lut.len(), 0x4000 + 0x400);
        assert_eq!(lut.index(0x8000_0010), Some(4));
        assert_eq!(lut.index(0x0001_0010), Some(4));
        assert_eq!(lut.index(0xbfc0_0000), Some(0x4000));
        assert_eq!(lut.index(0x1f80_1000), None);
        assert_eq!(lut.get(0x1f80_1000), LutEntry::Null);
    }

    #[test]
    fn test_invalidate_block_start_before_range() {
        let lut = lut();
        let start = lut.index(0x100).unwrap();
        lut.store(start, LutEntry::Pending);
        lut.note_span(start, 4, true);

        // Write to the last word of the 4-word block.
        assert_eq!(lut.invalidate(0x8000_010c, 4), 1);
        assert_eq!(lut.load(start), LutEntry::Null);
    }

    #[test]
    fn test_invalidate_leaves_non_overlapping_blocks() {
        let lut = lut();
        let a = lut.index(0x100).unwrap();
        let b = lut.index(0x200).unwrap();
        lut.store(a, LutEntry::Pending);
        lut.note_span(a, 2, true);
        lut.store(b, LutEntry::Pending);
        lut.note_span(b, 2, true);

        assert_eq!(lut.invalidate(0x108, 4), 0);
        assert_eq!(lut.load(a), LutEntry::Pending);
        assert_eq!(lut.invalidate(0x0001_0200, 1), 1);
        assert_eq!(lut.load(b), LutEntry::Null);
    }

    #[test]
    fn test_invalidate_mid_block_entry() {
        let lut = lut();
        let start = lut.index(0x400).unwrap();
        let code = LutEntry::Code { id: 7, offset: 0 };
        let mid = LutEntry::Code { id: 7, offset: 3 };
        lut.store(start, code);
        lut.note_span(start, 6, true);
        lut.store(start + 3, mid);
        lut.note_span(start + 3, 3, false);

        lut.invalidate(0x414, 4);
        assert!(lut.load(start).is_null());
        assert!(lut.load(start + 3).is_null());
    }

    #[test]
    fn test_uncovered_write_is_free() {
        let lut = lut();
        assert_eq!(lut.invalidate(0x3000, 0x100), 0);
        assert_eq!(lut.invalidation_count(), 0);
    }

    #[test]
    fn test_retire_only_clears_own_entries() {
        let lut = lut();
        lut.store(10, LutEntry::Code { id: 3, offset: 0 });
        lut.store(11, LutEntry::Code { id: 4, offset: 0 });
        lut.retire(3, &[10, 11]);
        assert!(lut.load(10).is_null());
        assert_eq!(lut.load(11), LutEntry::Code { id: 4, offset: 0 });
    }

    #[test]
    fn test_compare_exchange() {
        let lut = lut();
        assert!(!lut.compare_exchange(5, LutEntry::Pending, LutEntry::Memset));
        lut.store(5, LutEntry::Pending);
        assert!(lut.compare_exchange(5, LutEntry::Pending, LutEntry::Memset));
        assert_eq!(lut.load(5), LutEntry::Memset);
    }
}
