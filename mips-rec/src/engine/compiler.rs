//! Block compilation and publication.
//!
//! `compile_block` is shared by the synchronous path (dispatching thread)
//! and the recompiler thread. Code generation runs without the block cache
//! lock; publication runs under it:
//!
//! ```text
//!   ops snapshot ──▶ CodeGenerator::compile ──▶ lock cache
//!                                                 ├─ block dead?        → discard code
//!                                                 ├─ kill covered blocks (start inside our targets)
//!                                                 ├─ mid-block entries  → Code{id, offset}
//!                                                 ├─ start slot CAS     → Code{id, 0}   (fails → discard)
//!                                                 ├─ retire old code    → reaper
//!                                                 ├─ tagged meanwhile?  → SHOULD_RECOMPILE
//!                                                 └─ code budget        → retire evicted code
//! ```
//!
//! Compile failures never abort emulation: the block is marked
//! `NEVER_COMPILE` and keeps running in the interpreter. Too many failures
//! disable the compiler until the host re-enables it.

use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::Serialize;

use super::block::{Block, BlockFlags, CompiledCode, is_fully_tagged};
use super::lut::LutEntry;
use super::reaper::Reap;
use super::regcache::RegCache;
use super::trace::TraceEvent;
use super::Shared;
use crate::backend::BlockSource;
use crate::error::CodegenError;

// ═══════════════════════════════════════════════════════════════════════════
// Failure tracking
// ═══════════════════════════════════════════════════════════════════════════

/// Compile failure bookkeeping with graceful degradation.
#[derive(Debug, Default)]
pub struct FailureTracker {
    /// Consecutive compilation failures
    consecutive_failures: u32,
    /// Total compilation failures
    total_failures: u32,
    /// Compiler disabled due to errors
    disabled_by_error: bool,
    /// Reason the compiler was disabled
    disabled_reason: Option<String>,
    /// Total successful compilations
    successful_compilations: u64,
}

impl FailureTracker {
    pub fn is_disabled(&self) -> bool {
        self.disabled_by_error
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.successful_compilations += 1;
    }

    /// Count a failure; returns `true` when it disabled the compiler.
    pub fn record_failure(
        &mut self,
        pc: u32,
        max_consecutive: u32,
        max_total: u32,
    ) -> bool {
        self.consecutive_failures += 1;
        self.total_failures += 1;
        if self.disabled_by_error {
            return false;
        }

        let reason = if self.consecutive_failures >= max_consecutive {
            format!(
                "{} consecutive failures (last at {:#010x})",
                self.consecutive_failures, pc
            )
        } else if self.total_failures >= max_total {
            format!("{} total failures", self.total_failures)
        } else {
            return false;
        };
        log::warn!("[REC] Compiler disabled: {reason}");
        self.disabled_by_error = true;
        self.disabled_reason = Some(reason);
        true
    }

    /// Re-enable compilation after it was disabled by errors.
    pub fn reenable(&mut self) {
        self.disabled_by_error = false;
        self.disabled_reason = None;
        self.consecutive_failures = 0;
        // Keep total_failures for diagnostics
    }

    pub fn diagnostics(&self) -> CompilerDiagnostics {
        CompilerDiagnostics {
            enabled: !self.disabled_by_error,
            disabled_reason: self.disabled_reason.clone(),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            successful_compilations: self.successful_compilations,
        }
    }
}

/// Snapshot of the compiler's health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerDiagnostics {
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub successful_compilations: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Compilation
// ═══════════════════════════════════════════════════════════════════════════

/// Generate and publish code for `block`. Returns whether new code was
/// published.
pub(crate) fn compile_block(
    shared: &Shared,
    block: &Arc<Block>,
    regcache: &mut RegCache,
    threaded: bool,
) -> bool {
    if shared.failures.lock().is_disabled() {
        return false;
    }
    let Some(ops) = block.ops_snapshot() else {
        // Fully tagged and already compiled.
        return false;
    };
    let pc = block.pc();
    let fully_tagged = is_fully_tagged(&ops);
    if fully_tagged {
        block.set_flags(BlockFlags::FULLY_TAGGED);
    }

    shared.trace(TraceEvent::CompileStart {
        pc,
        ops: ops.len() as u32,
        threaded,
    });
    regcache.reset();
    let start = Instant::now();
    let result = shared
        .generator
        .lock()
        .compile(&BlockSource { pc, ops: &ops }, regcache);
    let time_us = start.elapsed().as_micros() as u64;

    let emitted = match result {
        Ok(emitted) => emitted,
        Err(err) => {
            handle_failure(shared, block, &err, time_us);
            return false;
        }
    };
    shared.failures.lock().record_success();

    let id = shared.new_code_id();
    let lut = &shared.lut;
    let mut cache = shared.cache.lock();

    let Some(start_slot) = lut.index(block.kpc()) else {
        log::error!("[REC] Compiled block {pc:#010x} has no code address slot");
        panic!("compiled uncached block {pc:#010x}");
    };

    if block.has(BlockFlags::IS_DEAD) {
        log::debug!("[REC] Block {pc:#010x} died while compiling, dropping its code");
        drop(cache);
        shared.discard(emitted.function, id);
        return false;
    }

    // Blocks starting at one of our entry points are now covered by this
    // code: they die.
    let nb_ops = block.nb_ops();
    let targets: Vec<u16> = emitted
        .targets
        .iter()
        .copied()
        .filter(|&t| t != 0 && usize::from(t) < nb_ops)
        .collect();
    for &offset in &targets {
        let covered_pc = pc.wrapping_add(u32::from(offset) * 4);
        if let Some(covered) = cache.find(covered_pc)
            && !Arc::ptr_eq(&covered, block)
        {
            covered.set_flags(BlockFlags::IS_DEAD);
            shared.queue.cancel(&covered);
            cache.unregister(&covered, lut);
            shared.counters.bump(&shared.counters.dead_blocks);
            shared.trace(TraceEvent::BlockDead {
                pc: covered_pc,
                reason: "covered",
            });
            shared.reap(Reap::Block(covered));
        }
    }

    let mut slots = vec![start_slot];
    for &offset in &targets {
        if let Some(slot) = lut.index(block.kpc().wrapping_add(u32::from(offset) * 4)) {
            lut.store(slot, LutEntry::Code { id, offset });
            lut.note_span(slot, nb_ops - usize::from(offset), false);
            slots.push(slot);
        }
    }

    let code = Arc::new(CompiledCode {
        id,
        function: emitted.function,
        size: emitted.code_size,
        slots,
        block: Arc::downgrade(block),
    });
    shared.codes.write().insert(id, Arc::clone(&code));

    let observed = lut.load(start_slot);
    let published = !observed.is_null()
        && lut.compare_exchange(start_slot, observed, LutEntry::Code { id, offset: 0 });
    if !published {
        // Invalidated while we were compiling: the block is outdated and
        // will be evicted on its next lookup.
        log::debug!("[REC] Block {pc:#010x} was invalidated during compilation");
        lut.retire(id, &code.slots);
        drop(cache);
        shared.reap(Reap::Code(code));
        return false;
    }

    block.clear_flags(BlockFlags::SHOULD_RECOMPILE);
    if let Some(old) = block.replace_code(Arc::clone(&code)) {
        lut.retire(old.id, &old.slots);
        shared.counters.bump(&shared.counters.recompilations);
        shared.reap(Reap::Code(old));
    }
    // Accesses tagged by the dispatcher while we were compiling.
    let retagged = block
        .with_ops(|now| now.iter().zip(&ops).any(|(a, b)| a.flags != b.flags))
        .unwrap_or(false);
    if retagged {
        block.flag_recompile(lut);
    } else if fully_tagged {
        block.free_ops();
    }

    let evicted = shared.budget.lock().insert(id, code.size);
    drop(cache);
    for victim in evicted {
        if let Some(old) = shared.codes.read().get(&victim) {
            log::debug!("[REC] Code budget exceeded, retiring code {victim}");
            lut.retire(old.id, &old.slots);
        }
    }

    shared.counters.bump(&shared.counters.blocks_compiled);
    shared.trace(TraceEvent::CompileEnd {
        pc,
        code_size: code.size,
        time_us,
        success: true,
    });
    log::trace!(
        "[REC] Published {} bytes of code for {pc:#010x} ({} entry points)",
        code.size,
        code.slots.len()
    );
    true
}

fn handle_failure(shared: &Shared, block: &Block, err: &CodegenError, time_us: u64) {
    let pc = block.pc();
    block.set_flags(BlockFlags::NEVER_COMPILE);
    shared.counters.bump(&shared.counters.compile_failures);
    shared.trace(TraceEvent::CompileEnd {
        pc,
        code_size: 0,
        time_us,
        success: false,
    });
    match err {
        CodegenError::OutOfMemory => {
            log::error!("[REC] Out of code memory compiling block {pc:#010x}")
        }
        CodegenError::Failure(msg) => {
            log::error!("[REC] Unable to compile block at {pc:#010x}: {msg}")
        }
    }
    let config = &shared.config;
    shared.failures.lock().record_failure(
        pc,
        config.max_consecutive_failures,
        config.max_total_failures,
    );
}

/// Code that never got published.
fn orphan(function: Arc<dyn crate::backend::HostCode>, id: u32) -> Arc<CompiledCode> {
    Arc::new(CompiledCode {
        id,
        function,
        size: 0,
        slots: Vec::new(),
        block: Weak::new(),
    })
}

impl Shared {
    /// Hand unpublished code to the reaper so the generator can release it.
    fn discard(&self, function: Arc<dyn crate::backend::HostCode>, id: u32) {
        self.reap(Reap::Code(orphan(function, id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_tracker_disables_and_reenables() {
        let mut t = FailureTracker::default();
        assert!(!t.record_failure(0x100, 3, 100));
        assert!(!t.record_failure(0x104, 3, 100));
        assert!(t.record_failure(0x108, 3, 100));
        assert!(t.is_disabled());
        assert!(t.disabled_reason().unwrap().contains("3 consecutive"));

        t.reenable();
        assert!(!t.is_disabled());
        let d = t.diagnostics();
        assert_eq!(d.total_failures, 3);
        assert_eq!(d.consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut t = FailureTracker::default();
        t.record_failure(0, 5, 3);
        t.record_success();
        assert!(!t.record_failure(0, 5, 3));
        assert!(t.record_failure(0, 5, 3));
        assert!(t.disabled_reason().unwrap().contains("total"));
    }
}
