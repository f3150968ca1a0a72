//! Register cache: guest registers → host registers during code generation.
//!
//! Guest registers are GPR 0-31, LO (32) and HI (33). The cache hands out
//! host registers for the operands of the opcode being compiled, loading
//! inputs and marking outputs dirty; when it runs out it evicts the least
//! recently used unlocked register, spilling it if dirty. Spill code goes
//! through a [`SpillEmitter`] so the cache knows nothing about the backend.
//!
//! ```text
//!   alloc_in(rs) ──┐                         ┌── flush_all: store dirty
//!   alloc_in(rt) ──┼─▶ host regs (locked) ──▶│
//!   alloc_out(rd) ─┘        release_locks    └── unload_all: store dirty, forget
//! ```
//!
//! Backends must flush at calls into collaborators and unload at block exits
//! and before branch targets, so every entry point starts with an empty cache.

use crate::cpu::NUM_REGS;

/// Number of host registers managed by the cache.
pub const NUM_HOST_REGS: usize = 8;

pub type HostReg = u8;

/// Backend hook for spill code.
pub trait SpillEmitter {
    /// Load guest register `guest` into host register `host`.
    fn load(&mut self, host: HostReg, guest: u8);
    /// Store host register `host` into guest register `guest`.
    fn store(&mut self, host: HostReg, guest: u8);
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    guest: Option<u8>,
    dirty: bool,
    locked: bool,
    last_use: u64,
}

#[derive(Debug, Default)]
pub struct RegCache {
    slots: [Slot; NUM_HOST_REGS],
    tick: u64,
    spills: u64,
}

impl RegCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every mapping. Called before each compile.
    pub fn reset(&mut self) {
        self.slots = [Slot::default(); NUM_HOST_REGS];
        self.tick = 0;
    }

    fn find(&self, guest: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.guest == Some(guest))
    }

    fn touch(&mut self, index: usize) {
        self.tick += 1;
        let slot = &mut self.slots[index];
        slot.last_use = self.tick;
        slot.locked = true;
    }

    /// Free slot, or the least recently used unlocked one after spilling it.
    fn victim(&mut self, emit: &mut dyn SpillEmitter) -> usize {
        if let Some(free) = self
            .slots
            .iter()
            .position(|s| s.guest.is_none() && !s.locked)
        {
            return free;
        }
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i);
        let Some(index) = index else {
            // An opcode never needs more than a few registers.
            panic!("register cache exhausted: all {NUM_HOST_REGS} host registers locked");
        };
        self.evict(index, emit);
        index
    }

    fn evict(&mut self, index: usize, emit: &mut dyn SpillEmitter) {
        let slot = self.slots[index];
        if let (Some(guest), true) = (slot.guest, slot.dirty) {
            emit.store(index as HostReg, guest);
            self.spills += 1;
        }
        self.slots[index] = Slot::default();
    }

    /// Host register holding the value of `guest`, loading it if needed.
    pub fn alloc_in(&mut self, emit: &mut dyn SpillEmitter, guest: u8) -> HostReg {
        debug_assert!((guest as usize) < NUM_REGS);
        let index = match self.find(guest) {
            Some(index) => index,
            None => {
                let index = self.victim(emit);
                emit.load(index as HostReg, guest);
                self.slots[index].guest = Some(guest);
                index
            }
        };
        self.touch(index);
        index as HostReg
    }

    /// Host register that will receive a new value for `guest`.
    pub fn alloc_out(&mut self, emit: &mut dyn SpillEmitter, guest: u8) -> HostReg {
        debug_assert!((guest as usize) < NUM_REGS);
        let index = match self.find(guest) {
            Some(index) => index,
            None => {
                let index = self.victim(emit);
                self.slots[index].guest = Some(guest);
                index
            }
        };
        // $zero is never written back.
        self.slots[index].dirty = guest != 0;
        self.touch(index);
        index as HostReg
    }

    /// Scratch register, released by [`RegCache::release_locks`].
    pub fn alloc_temp(&mut self, emit: &mut dyn SpillEmitter) -> HostReg {
        let index = self.victim(emit);
        self.slots[index] = Slot::default();
        self.touch(index);
        index as HostReg
    }

    /// End of an opcode: unlock everything.
    pub fn release_locks(&mut self) {
        for slot in &mut self.slots {
            slot.locked = false;
        }
    }

    /// Write back every dirty register, keeping the mappings.
    pub fn flush_all(&mut self, emit: &mut dyn SpillEmitter) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let (Some(guest), true) = (slot.guest, slot.dirty) {
                emit.store(i as HostReg, guest);
                slot.dirty = false;
            }
        }
    }

    /// Write back every dirty register and forget all mappings.
    pub fn unload_all(&mut self, emit: &mut dyn SpillEmitter) {
        self.flush_all(emit);
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
    }

    /// Drop the mapping of `guest` without writing it back.
    pub fn discard(&mut self, guest: u8) {
        if let Some(index) = self.find(guest) {
            self.slots[index] = Slot::default();
        }
    }

    /// Guest register currently mapped to `host`, if any.
    pub fn guest_of(&self, host: HostReg) -> Option<u8> {
        self.slots.get(host as usize).and_then(|s| s.guest)
    }

    pub fn is_dirty(&self, guest: u8) -> bool {
        self.find(guest).is_some_and(|i| self.slots[i].dirty)
    }

    /// Number of mapped guest registers.
    pub fn mapped(&self) -> usize {
        self.slots.iter().filter(|s| s.guest.is_some()).count()
    }

    /// Evictions that required a store since creation.
    pub fn spill_count(&self) -> u64 {
        self.spills
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(char, HostReg, u8)>,
    }

    impl SpillEmitter for Recorder {
        fn load(&mut self, host: HostReg, guest: u8) {
            self.events.push(('L', host, guest));
        }
        fn store(&mut self, host: HostReg, guest: u8) {
            self.events.push(('S', host, guest));
        }
    }

    #[test]
    fn test_same_guest_same_host() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        let a = rc.alloc_in(&mut e, 4);
        let b = rc.alloc_out(&mut e, 4);
        assert_eq!(a, b);
        assert_eq!(e.events, vec![('L', a, 4)]);
        assert!(rc.is_dirty(4));
    }

    #[test]
    fn test_zero_never_dirty() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        rc.alloc_out(&mut e, 0);
        rc.unload_all(&mut e);
        assert!(e.events.is_empty());
    }

    #[test]
    fn test_lru_eviction_spills_dirty() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        for g in 1..=NUM_HOST_REGS as u8 {
            rc.alloc_out(&mut e, g);
            rc.release_locks();
        }
        // Register 1 is the oldest.
        let host = rc.alloc_in(&mut e, 20);
        assert_eq!(rc.guest_of(host), Some(20));
        assert_eq!(e.events, vec![('S', host, 1), ('L', host, 20)]);
        assert_eq!(rc.spill_count(), 1);
    }

    #[test]
    fn test_locked_registers_survive() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        let first = rc.alloc_in(&mut e, 1);
        for g in 2..=NUM_HOST_REGS as u8 {
            rc.alloc_in(&mut e, g);
            rc.release_locks();
            // Keep $1 locked as if still in use by the current opcode.
            rc.alloc_in(&mut e, 1);
        }
        let host = rc.alloc_temp(&mut e);
        assert_ne!(host, first);
        assert_eq!(rc.guest_of(first), Some(1));
    }

    #[test]
    fn test_flush_keeps_mapping_unload_forgets() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        let h = rc.alloc_out(&mut e, 33);
        rc.release_locks();
        rc.flush_all(&mut e);
        assert_eq!(e.events, vec![('S', h, 33)]);
        assert_eq!(rc.mapped(), 1);
        assert!(!rc.is_dirty(33));

        rc.unload_all(&mut e);
        assert_eq!(e.events.len(), 1);
        assert_eq!(rc.mapped(), 0);
    }

    #[test]
    fn test_discard_and_reset() {
        let mut rc = RegCache::new();
        let mut e = Recorder::default();
        rc.alloc_out(&mut e, 5);
        rc.discard(5);
        rc.unload_all(&mut e);
        assert!(e.events.is_empty());

        rc.alloc_in(&mut e, 6);
        rc.reset();
        assert_eq!(rc.mapped(), 0);
    }
}
