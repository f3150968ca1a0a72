//! Compiler driver: turns a guest PC into something that runs.
//!
//! The dispatcher reads the Code Address Table first and only comes here for
//! slots that are `Null`, `Pending` or `Memset`, or whose code went away.
//!
//! ```text
//!   lookup(pc) ─ Code{id, off} ──────────────────────────────▶ call compiled code
//!       │
//!       └─ other ─▶ get_block ─ cached & fresh ───┐
//!                      │ outdated → reuse or kill │
//!                      └ missing  → precompile ───┤
//!                                                 ▼
//!                 IS_MEMSET → host memset     NEVER_COMPILE → interpreter
//!                 threaded  → submit + first pass (old code or interpreter)
//!                 sync      → interpret once, compile, run
//! ```

use std::sync::Arc;

use super::Engine;
use super::block::{Block, BlockFlags, CompiledCode, hash_words};
use super::compiler::compile_block;
use super::disasm::log_block_disassembly;
use super::interpreter::emulate_block;
use super::lut::{CodeId, LutEntry};
use super::optimizer::{decode_block, optimize};
use super::reaper::Reap;
use super::trace::TraceEvent;
use crate::cpu::{ExitFlags, reg};

impl Engine {
    /// Run one block's worth of guest code at `pc`; returns the next PC.
    pub(crate) fn get_next_block(&mut self, pc: u32) -> u32 {
        if let LutEntry::Code { id, offset } = self.shared.lut.get(pc)
            && let Some(next) = self.call_published(id, offset)
        {
            return next;
        }

        let Some(block) = self.get_block(pc) else {
            return pc;
        };
        // Aliases of the same physical code share a block.
        let pc = block.pc();

        if block.has(BlockFlags::IS_MEMSET) && self.shared.config.replace_memset {
            return self.run_memset(&block);
        }

        let can_compile = !block.has(BlockFlags::NEVER_COMPILE) && self.compiler_enabled();
        let should_recompile = can_compile
            && block.has(BlockFlags::SHOULD_RECOMPILE)
            && !block.has(BlockFlags::IS_DEAD);

        if self.recompiler.is_some() {
            if should_recompile {
                self.shared.queue.submit(&block);
            }
            return self.run_first_pass(&block, can_compile);
        }

        if should_recompile {
            compile_block(&self.shared, &block, &mut self.regcache, false);
        }
        if let Some(code) = block.code() {
            return self.call_code(&code, 0, &block);
        }
        if !can_compile {
            return self.interpret(&block, pc);
        }

        if self.shared.config.first_pass {
            // Profile the block once so that its memory accesses are tagged
            // when code is generated.
            let next = self.interpret(&block, pc);
            compile_block(&self.shared, &block, &mut self.regcache, false);
            return next;
        }
        compile_block(&self.shared, &block, &mut self.regcache, false);
        match block.code() {
            Some(code) => self.call_code(&code, 0, &block),
            None => self.interpret(&block, pc),
        }
    }

    /// Threaded mode: run the block's current code if it has any, otherwise
    /// interpret it and hand it to the recompiler.
    fn run_first_pass(&mut self, block: &Arc<Block>, can_compile: bool) -> u32 {
        if let Some(code) = block.code() {
            return self.call_code(&code, 0, block);
        }
        let next = self.interpret(block, block.pc());
        if can_compile {
            self.shared.queue.submit(block);
        }
        next
    }

    /// Cached block for `pc`, decoding a new one if needed. `None` when the
    /// code cannot be fetched; the exit flags say why.
    pub(crate) fn get_block(&mut self, pc: u32) -> Option<Arc<Block>> {
        let shared = Arc::clone(&self.shared);
        let mut cache = shared.cache.lock();

        if let Some(block) = cache.find(pc) {
            if !cache.is_outdated(&block, &shared.lut) {
                return Some(block);
            }

            if shared.config.reuse_identical_blocks && self.is_unchanged(&block) {
                self.republish(&block);
                shared.counters.bump(&shared.counters.reused_blocks);
                shared.trace(TraceEvent::BlockOutdated {
                    pc: block.pc(),
                    reused: true,
                });
                return Some(block);
            }

            log::debug!("[REC] Block at {:#010x} is outdated", block.pc());
            block.set_flags(BlockFlags::IS_DEAD);
            shared.queue.cancel(&block);
            cache.unregister(&block, &shared.lut);
            shared.counters.bump(&shared.counters.outdated_blocks);
            shared.trace(TraceEvent::BlockOutdated {
                pc: block.pc(),
                reused: false,
            });
            shared.reap(Reap::Block(block));
        }
        drop(cache);

        self.precompile(pc)
    }

    /// Decode and optimize a new block and register it.
    fn precompile(&mut self, pc: u32) -> Option<Arc<Block>> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;

        let mut ops = match decode_block(&self.state.memory, pc, config.max_block_ops) {
            Ok(ops) => ops,
            Err(fault) => {
                log::error!("[REC] Unable to fetch block at {pc:#010x}: {fault}");
                self.state.set_exit(ExitFlags::SEGFAULT);
                return None;
            }
        };
        let mut flags = optimize(&self.state.memory, pc, &mut ops, config);
        if config.log_disassembly {
            log_block_disassembly(pc, &ops);
        }

        let slot = shared.lut.index(pc);
        if slot.is_none() {
            // No Code Address Table slot: nothing could ever dispatch to
            // compiled code, so the block is interpreted and not cached.
            flags |= BlockFlags::NEVER_COMPILE;
        }

        let block = Arc::new(Block::new(pc, ops, flags));
        shared.counters.bump(&shared.counters.blocks_precompiled);
        shared.trace(TraceEvent::BlockPrecompiled {
            pc,
            ops: block.nb_ops() as u32,
            flags: flags.bits(),
        });
        log::trace!(
            "[REC] Precompiled block at {pc:#010x}: {} ops, flags {flags:?}",
            block.nb_ops()
        );

        match slot {
            Some(slot) => {
                shared.cache.lock().register(Arc::clone(&block), &shared.lut);
                if flags.contains(BlockFlags::IS_MEMSET) && config.replace_memset {
                    shared.lut.store(slot, LutEntry::Memset);
                }
            }
            None => shared.counters.bump(&shared.counters.uncached_blocks),
        }
        Some(block)
    }

    /// The guest words under an outdated block still hash to its contents.
    fn is_unchanged(&self, block: &Block) -> bool {
        let len = block.nb_ops() * 4;
        match self.state.memory.slice(block.pc(), len) {
            Ok(bytes) => {
                let words = bytes
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                hash_words(words) == block.hash()
            }
            Err(_) => false,
        }
    }

    /// Point the start slot of an outdated but unchanged block back at it.
    fn republish(&self, block: &Block) {
        let lut = &self.shared.lut;
        let Some(slot) = lut.index(block.kpc()) else {
            return;
        };
        let entry = match block.code() {
            // Code evicted by the budget stays unpublished.
            Some(code)
                if !block.has(BlockFlags::SHOULD_RECOMPILE)
                    && self.shared.budget.lock().contains(code.id) =>
            {
                LutEntry::Code {
                    id: code.id,
                    offset: 0,
                }
            }
            _ if block.has(BlockFlags::IS_MEMSET) => LutEntry::Memset,
            _ => LutEntry::Pending,
        };
        lut.note_span(slot, block.nb_ops(), true);
        lut.store(slot, entry);
        log::debug!("[REC] Reusing unchanged block at {:#010x}", block.pc());
    }

    /// Call code `id` at `offset` if it is still registered.
    fn call_published(&mut self, id: CodeId, offset: u16) -> Option<u32> {
        let code = self.shared.codes.read().get(&id).cloned()?;
        let block = code.block.upgrade()?;
        Some(self.call_code(&code, offset, &block))
    }

    fn call_code(&mut self, code: &CompiledCode, offset: u16, block: &Block) -> u32 {
        self.shared
            .counters
            .bump(&self.shared.counters.compiled_dispatches);
        self.shared.budget.lock().touch(code.id);
        code.function.call(offset, &mut self.state, block)
    }

    /// Interpret `block` from `pc`.
    pub(crate) fn interpret(&mut self, block: &Block, pc: u32) -> u32 {
        let before = self.state.clock.current;
        let next = emulate_block(&mut self.state, block, pc);
        self.shared
            .counters
            .bump(&self.shared.counters.interpreted_blocks);
        self.shared.trace(TraceEvent::BlockInterpreted {
            pc,
            cycles: self.state.clock.current.wrapping_sub(before),
        });
        next
    }

    /// Host memset in place of the guest loop; the loop runs for real when
    /// the host implementation declines.
    fn run_memset(&mut self, block: &Block) -> u32 {
        let bytes = self.state.regs.get(reg::A1).wrapping_mul(4);
        match self.state.memset() {
            Some(cycles) => {
                self.state.clock.add(cycles);
                self.shared.counters.bump(&self.shared.counters.memsets);
                self.shared.trace(TraceEvent::Memset {
                    pc: block.pc(),
                    bytes,
                });
                self.state.regs.get(reg::RA)
            }
            None => self.interpret(block, block.pc()),
        }
    }
}
