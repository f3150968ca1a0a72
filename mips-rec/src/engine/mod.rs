//! The recompiler engine.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────────── Engine (driving thread) ───────────────────────────┐
//!   │  run(pc) ─▶ dispatch loop ─▶ Code Address Table ─ Code ─▶ HostCode::call        │
//!   │                                   │                                              │
//!   │                                   └─ other ─▶ driver ─▶ interpreter / compile    │
//!   │  reaper.drain() at the end of every run                                          │
//!   └─────────────────────────────────────┬──────────────────────────────────────────┘
//!                                         │ Arc<Shared>
//!   ┌────────────────── Shared ───────────┴───────────────────────────────────────────┐
//!   │  CodeLut (atomic slots)   BlockCache (Mutex)   code registry (RwLock)            │
//!   │  CodeGenerator (Mutex)    CodeBudget (Mutex)   CompileQueue   counters   trace   │
//!   └─────────────────────────────────────┬──────────────────────────────────────────┘
//!                                         │
//!                         recompiler thread (threaded mode only)
//! ```
//!
//! Guest registers, memory and coprocessors live in [`CpuState`] and are only
//! touched by the driving thread. The recompiler thread only sees opcode
//! lists, the tables above and the generator.
//!
//! ## Lock order
//!
//! `cache` → `queue` → `codes` → `budget`. The generator lock is never held
//! together with the cache lock.

pub mod block;
pub mod blockcache;
pub mod budget;
pub mod compiler;
pub mod disasm;
mod driver;
pub mod interpreter;
pub mod lut;
pub mod optimizer;
pub mod reaper;
pub mod recompiler;
pub mod regcache;
pub mod trace;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;

use self::block::CompiledCode;
use self::blockcache::BlockCache;
use self::budget::{BudgetStats, CodeBudget};
use self::compiler::{CompilerDiagnostics, FailureTracker};
use self::lut::{CodeId, CodeLut};
use self::reaper::{Reap, Reaper};
use self::recompiler::{CompileQueue, Recompiler};
use self::regcache::RegCache;
use self::trace::{TraceBuffer, TraceEvent, TraceStats};
use crate::backend::{CodeGenerator, default_generator};
use crate::config::EngineConfig;
use crate::cpu::{CopOps, CpuState, ExitFlags, NUM_REGS, Opcode, Registers};
use crate::error::Result;
use crate::memory::MemoryMap;

// ═══════════════════════════════════════════════════════════════════════════
// Shared state
// ═══════════════════════════════════════════════════════════════════════════

/// Event counters, updated from both threads.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) blocks_precompiled: AtomicU64,
    pub(crate) blocks_compiled: AtomicU64,
    pub(crate) compile_failures: AtomicU64,
    pub(crate) recompilations: AtomicU64,
    pub(crate) interpreted_blocks: AtomicU64,
    pub(crate) compiled_dispatches: AtomicU64,
    pub(crate) memsets: AtomicU64,
    pub(crate) outdated_blocks: AtomicU64,
    pub(crate) reused_blocks: AtomicU64,
    pub(crate) dead_blocks: AtomicU64,
    pub(crate) reaped_blocks: AtomicU64,
    pub(crate) reaped_codes: AtomicU64,
    pub(crate) uncached_blocks: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(&self, counter: &AtomicU64) {
        self.add(counter, 1);
    }

    #[inline]
    pub(crate) fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// State shared between the driving thread and the recompiler thread.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) lut: Arc<CodeLut>,
    pub(crate) cache: Mutex<BlockCache>,
    /// Every published code object, by id.
    pub(crate) codes: RwLock<HashMap<CodeId, Arc<CompiledCode>>>,
    next_code_id: AtomicU32,
    pub(crate) generator: Mutex<Box<dyn CodeGenerator>>,
    generator_name: &'static str,
    pub(crate) budget: Mutex<CodeBudget>,
    pub(crate) trace: Mutex<TraceBuffer>,
    pub(crate) counters: Counters,
    pub(crate) failures: Mutex<FailureTracker>,
    pub(crate) queue: CompileQueue,
    reaper: Sender<Reap>,
}

impl Shared {
    /// Fresh code id. Ids start at 1 and only repeat after 2^32 compiles.
    pub(crate) fn new_code_id(&self) -> CodeId {
        self.next_code_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn trace(&self, event: TraceEvent) {
        self.trace.lock().push(event);
    }

    /// Hand something to the reaper.
    pub(crate) fn reap(&self, token: Reap) {
        if self.reaper.send(token).is_err() {
            log::warn!("[REC] Reaper is gone, dropping reclaim token");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════

/// Engine counters and table sizes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub blocks_precompiled: u64,
    pub blocks_compiled: u64,
    pub compile_failures: u64,
    pub recompilations: u64,
    pub interpreted_blocks: u64,
    pub compiled_dispatches: u64,
    pub memsets: u64,
    pub outdated_blocks: u64,
    pub reused_blocks: u64,
    pub dead_blocks: u64,
    pub reaped_blocks: u64,
    pub reaped_codes: u64,
    pub uncached_blocks: u64,
    pub cached_blocks: usize,
    pub code_objects: usize,
    pub code_bytes: usize,
    pub queued_jobs: usize,
    pub dropped_jobs: u64,
    pub invalidations: u64,
    pub deferred_reaps: usize,
    pub budget: BudgetStats,
}

/// Everything worth knowing when the engine misbehaves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDiagnostics {
    pub generator: &'static str,
    pub threaded: bool,
    pub compiler: CompilerDiagnostics,
    pub stats: EngineStats,
    pub trace_stats: TraceStats,
}

// ═══════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════

/// A MIPS R3000A dynamic recompiler instance.
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    pub(crate) state: CpuState,
    pub(crate) regcache: RegCache,
    reaper: Reaper,
    pub(crate) recompiler: Option<Recompiler>,
    last_report: u32,
}

impl Engine {
    /// Engine over `memory` with the built-in code generator.
    pub fn new(memory: MemoryMap, cops: CopOps, config: EngineConfig) -> Result<Self> {
        Self::with_generator(memory, cops, config, default_generator())
    }

    pub fn with_generator(
        memory: MemoryMap,
        cops: CopOps,
        mut config: EngineConfig,
        generator: Box<dyn CodeGenerator>,
    ) -> Result<Self> {
        config.normalize();

        let lut = Arc::new(CodeLut::with_window(&memory, config.max_block_ops));
        let (tx, reaper) = Reaper::channel();
        let mut trace = TraceBuffer::new(config.trace_capacity);
        if config.trace_enabled {
            trace.enable();
        }
        let generator_name = generator.name();

        let shared = Arc::new(Shared {
            lut: Arc::clone(&lut),
            cache: Mutex::new(BlockCache::new()),
            codes: RwLock::new(HashMap::new()),
            next_code_id: AtomicU32::new(1),
            generator: Mutex::new(generator),
            generator_name,
            budget: Mutex::new(CodeBudget::new(config.code_budget_bytes)),
            trace: Mutex::new(trace),
            counters: Counters::default(),
            failures: Mutex::new(FailureTracker::default()),
            queue: CompileQueue::new(config.compile_queue_capacity),
            reaper: tx,
            config,
        });

        let mut state = CpuState::new(memory, cops.cop0, cops.cop2, lut);
        state.invalidate_from_dma_only = shared.config.invalidate_from_dma_only;

        let recompiler = if shared.config.threaded {
            Some(Recompiler::spawn(Arc::clone(&shared))?)
        } else {
            None
        };

        log::info!(
            "[REC] Engine ready: {} code slots, {} generator, {} compilation",
            shared.lut.len(),
            generator_name,
            if recompiler.is_some() { "threaded" } else { "synchronous" }
        );

        Ok(Self {
            shared,
            state,
            regcache: RegCache::new(),
            reaper,
            recompiler,
            last_report: 0,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // ─── Execution ─────────────────────────────────────────────────────────

    /// Run guest code from `pc` until the cycle counter reaches
    /// `target_cycle` or an exit condition is raised. Returns the next PC.
    ///
    /// A target below the current cycle count means "no cycle limit".
    pub fn run(&mut self, pc: u32, target_cycle: u32) -> u32 {
        let clock = &mut self.state.clock;
        clock.exit = ExitFlags::empty();
        clock.target = if target_cycle < clock.current {
            u32::MAX
        } else {
            target_cycle
        };

        let mut pc = pc;
        loop {
            pc = self.get_next_block(pc);
            if self.state.clock.should_stop() {
                break;
            }
        }

        self.finish_run(pc);
        pc
    }

    /// Run a single block at `pc`. Compiled code with an inner loop leaves
    /// after one iteration.
    pub fn execute_one(&mut self, pc: u32) -> u32 {
        let saved = self.state.clock.target;
        self.state.clock.exit = ExitFlags::empty();
        self.state.clock.target = self.state.clock.current;

        let next = self.get_next_block(pc);

        if self.state.clock.exit.is_normal() {
            self.state.clock.target = saved;
        }
        self.finish_run(next);
        next
    }

    /// Interpret the block at `pc` once, ignoring any compiled code.
    pub fn run_interpreter(&mut self, pc: u32) -> u32 {
        self.state.clock.exit = ExitFlags::empty();
        let next = match self.get_block(pc) {
            Some(block) => {
                let start = block.pc();
                self.interpret(&block, start)
            }
            None => pc,
        };
        self.finish_run(next);
        next
    }

    fn finish_run(&mut self, pc: u32) {
        let exit = self.state.clock.exit;
        if !exit.is_normal() {
            log::debug!("[REC] Leaving at {pc:#010x} with exit flags {exit:?}");
            self.shared.trace(TraceEvent::Exit { pc, flags: exit });
        }
        self.reaper.drain(&self.shared);
        self.print_info();
    }

    /// Block until the recompiler thread has nothing left to do. Returns
    /// immediately in synchronous mode.
    pub fn wait_for_compiler(&self) {
        if let Some(recompiler) = &self.recompiler {
            recompiler.wait_idle();
        }
    }

    // ─── Invalidation ──────────────────────────────────────────────────────

    /// Mark code overlapping `[addr, addr + len)` as outdated (after a DMA
    /// transfer or a host write).
    pub fn invalidate(&mut self, addr: u32, len: u32) {
        let cleared = self.shared.lut.invalidate(addr, len);
        if cleared > 0 {
            self.shared.trace(TraceEvent::Invalidate {
                addr: Some(addr),
                len,
                reason: "host",
            });
        }
    }

    /// Mark all code as outdated.
    pub fn invalidate_all(&mut self) {
        log::debug!("[REC] Invalidating all code");
        self.shared.lut.invalidate_all();
        self.shared.trace(TraceEvent::Invalidate {
            addr: None,
            len: 0,
            reason: "all",
        });
    }

    /// With `dma_only` set, guest stores stop invalidating code and only
    /// [`Engine::invalidate`] does. Changing the mode invalidates everything.
    pub fn set_invalidate_mode(&mut self, dma_only: bool) {
        if self.state.invalidate_from_dma_only != dma_only {
            self.invalidate_all();
        }
        self.state.invalidate_from_dma_only = dma_only;
    }

    // ─── Clock and exit flags ──────────────────────────────────────────────

    pub fn current_cycle(&self) -> u32 {
        self.state.clock.current
    }

    pub fn reset_cycle(&mut self, cycles: u32) {
        self.state.clock.reset(cycles);
    }

    /// Move the target of the current run (from a device callback, say).
    pub fn set_target_cycle(&mut self, cycles: u32) {
        self.state.clock.set_target(cycles);
    }

    /// Why the last run stopped; empty when the cycle budget ran out.
    pub fn exit_flags(&self) -> ExitFlags {
        self.state.clock.exit
    }

    pub fn set_exit_flags(&mut self, flags: ExitFlags) {
        self.state.set_exit(flags);
    }

    // ─── Registers and memory ──────────────────────────────────────────────

    /// GPR 0-31, LO, HI.
    pub fn dump_registers(&self) -> [u32; NUM_REGS] {
        self.state.regs.to_array()
    }

    pub fn restore_registers(&mut self, regs: &[u32; NUM_REGS]) {
        self.state.regs = Registers::from_array(regs);
    }

    pub fn registers(&self) -> &Registers {
        &self.state.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.state.regs
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.state.memory
    }

    /// Host writes through this reference do not invalidate code; call
    /// [`Engine::invalidate`] afterwards.
    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.state.memory
    }

    pub fn cpu(&self) -> &CpuState {
        &self.state
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    // ─── Diagnostics ───────────────────────────────────────────────────────

    /// Re-enable compilation after too many failures disabled it.
    pub fn reenable_compiler(&self) {
        log::info!("[REC] Compiler re-enabled");
        self.shared.failures.lock().reenable();
    }

    pub fn compiler_enabled(&self) -> bool {
        !self.shared.failures.lock().is_disabled()
    }

    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let c = &shared.counters;
        let (code_objects, code_bytes) = {
            let codes = shared.codes.read();
            (codes.len(), codes.values().map(|code| code.size).sum())
        };
        EngineStats {
            blocks_precompiled: Counters::get(&c.blocks_precompiled),
            blocks_compiled: Counters::get(&c.blocks_compiled),
            compile_failures: Counters::get(&c.compile_failures),
            recompilations: Counters::get(&c.recompilations),
            interpreted_blocks: Counters::get(&c.interpreted_blocks),
            compiled_dispatches: Counters::get(&c.compiled_dispatches),
            memsets: Counters::get(&c.memsets),
            outdated_blocks: Counters::get(&c.outdated_blocks),
            reused_blocks: Counters::get(&c.reused_blocks),
            dead_blocks: Counters::get(&c.dead_blocks),
            reaped_blocks: Counters::get(&c.reaped_blocks),
            reaped_codes: Counters::get(&c.reaped_codes),
            uncached_blocks: Counters::get(&c.uncached_blocks),
            cached_blocks: shared.cache.lock().len(),
            code_objects,
            code_bytes,
            queued_jobs: shared.queue.len(),
            dropped_jobs: shared.queue.dropped(),
            invalidations: shared.lut.invalidation_count(),
            deferred_reaps: self.reaper.pending() + self.reaper.unreleased(),
            budget: shared.budget.lock().stats().clone(),
        }
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            generator: self.shared.generator_name,
            threaded: self.recompiler.is_some(),
            compiler: self.shared.failures.lock().diagnostics(),
            stats: self.stats(),
            trace_stats: self.shared.trace.lock().stats(),
        }
    }

    /// [`Engine::diagnostics`] as pretty-printed JSON.
    pub fn diagnostics_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.diagnostics())?)
    }

    /// The event trace. Holding the guard blocks the recompiler thread.
    pub fn trace(&self) -> MutexGuard<'_, TraceBuffer> {
        self.shared.trace.lock()
    }

    /// Log memory usage every `report_interval_cycles` cycles.
    fn print_info(&mut self) {
        let interval = self.shared.config.report_interval_cycles;
        let now = self.state.clock.current;
        if interval == 0 || now.wrapping_sub(self.last_report) < interval {
            return;
        }
        self.last_report = now;

        let (ir_bytes, guest_bytes) = {
            let cache = self.shared.cache.lock();
            cache.iter().fold((0usize, 0usize), |(ir, guest), block| {
                let ops = block.nb_ops();
                let ir = if block.has_ops() {
                    ir + ops * std::mem::size_of::<Opcode>()
                } else {
                    ir
                };
                (ir, guest + ops * 4)
            })
        };
        let code_bytes = self.shared.budget.lock().memory_usage();
        let ratio = if guest_bytes == 0 {
            0.0
        } else {
            code_bytes as f64 / (guest_bytes / 4) as f64
        };
        log::info!(
            "[REC] Memory usage: IR {} KiB, code {} KiB, guest code {} KiB, {ratio:.2} code bytes per guest instruction",
            ir_bytes / 1024,
            code_bytes / 1024,
            guest_bytes / 1024
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlockSource, Emitted, HostCode, ThreadedGenerator};
    use crate::cpu::opcode::{OpFlags, asm};
    use crate::cpu::reg;
    use crate::error::CodegenError;
    use crate::memory::tests::small_map;
    use super::block::{Block, BlockFlags};
    use super::compiler::compile_block;
    use super::lut::LutEntry;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    const PC: u32 = 0x8000_1000;
    const RET: u32 = 0x8000_2000;

    /// Built-in generator that counts compiles and releases.
    struct CountingGenerator {
        inner: ThreadedGenerator,
        compiled: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl CodeGenerator for CountingGenerator {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn compile(
            &mut self,
            src: &BlockSource<'_>,
            regcache: &mut RegCache,
        ) -> std::result::Result<Emitted, CodegenError> {
            self.compiled.fetch_add(1, Ordering::SeqCst);
            self.inner.compile(src, regcache)
        }

        fn release(&mut self, function: Arc<dyn HostCode>) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release(function);
        }
    }

    struct FailingGenerator;

    impl CodeGenerator for FailingGenerator {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn compile(
            &mut self,
            _src: &BlockSource<'_>,
            _regcache: &mut RegCache,
        ) -> std::result::Result<Emitted, CodegenError> {
            Err(CodegenError::Failure("no backend".into()))
        }
    }

    /// Holds the compile of the block at `pc` until the test opens it.
    struct Gate {
        pc: u32,
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    struct GateHandle {
        entered: mpsc::Receiver<()>,
        release: mpsc::Sender<()>,
    }

    impl GateHandle {
        fn wait_entered(&self) {
            self.entered
                .recv_timeout(Duration::from_secs(10))
                .expect("worker never reached the gated block");
        }

        fn open(&self) {
            self.release.send(()).unwrap();
        }
    }

    struct GatedGenerator {
        inner: ThreadedGenerator,
        gate: Option<Gate>,
        compiled: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl CodeGenerator for GatedGenerator {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn compile(
            &mut self,
            src: &BlockSource<'_>,
            regcache: &mut RegCache,
        ) -> std::result::Result<Emitted, CodegenError> {
            if let Some(gate) = self.gate.take_if(|g| g.pc == src.pc) {
                let _ = gate.entered.send(());
                let _ = gate.release.recv();
            }
            self.compiled.fetch_add(1, Ordering::SeqCst);
            self.inner.compile(src, regcache)
        }

        fn release(&mut self, function: Arc<dyn HostCode>) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.release(function);
        }
    }

    /// Tags the first opcode of a block from inside its compile, as the
    /// dispatcher can while the worker is busy.
    struct RetaggingGenerator {
        inner: ThreadedGenerator,
        block: Arc<Mutex<Option<Arc<Block>>>>,
    }

    impl CodeGenerator for RetaggingGenerator {
        fn name(&self) -> &'static str {
            "retagging"
        }

        fn compile(
            &mut self,
            src: &BlockSource<'_>,
            regcache: &mut RegCache,
        ) -> std::result::Result<Emitted, CodegenError> {
            if let Some(block) = self.block.lock().take() {
                block.tag_op(0, OpFlags::DIRECT_IO);
            }
            self.inner.compile(src, regcache)
        }
    }

    struct Counts {
        compiled: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Counts {
        fn compiled(&self) -> usize {
            self.compiled.load(Ordering::SeqCst)
        }
        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    fn counting_engine(config: EngineConfig) -> (Engine, Counts) {
        let counts = Counts {
            compiled: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        };
        let generator = CountingGenerator {
            inner: ThreadedGenerator::new(),
            compiled: Arc::clone(&counts.compiled),
            released: Arc::clone(&counts.released),
        };
        let engine =
            Engine::with_generator(small_map(), CopOps::default(), config, Box::new(generator))
                .unwrap();
        (engine, counts)
    }

    /// Threaded engine whose worker stops inside the compile of `gate_pc`.
    fn gated_engine(gate_pc: u32) -> (Engine, GateHandle, Counts) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let counts = Counts {
            compiled: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        };
        let generator = GatedGenerator {
            inner: ThreadedGenerator::new(),
            gate: Some(Gate {
                pc: gate_pc,
                entered: entered_tx,
                release: release_rx,
            }),
            compiled: Arc::clone(&counts.compiled),
            released: Arc::clone(&counts.released),
        };
        let engine = Engine::with_generator(
            small_map(),
            CopOps::default(),
            EngineConfig::default(),
            Box::new(generator),
        )
        .unwrap();
        let handle = GateHandle {
            entered: entered_rx,
            release: release_tx,
        };
        (engine, handle, counts)
    }

    fn engine(config: EngineConfig) -> Engine {
        Engine::new(small_map(), CopOps::default(), config).unwrap()
    }

    fn no_first_pass() -> EngineConfig {
        EngineConfig {
            first_pass: false,
            ..EngineConfig::synchronous()
        }
    }

    fn load(engine: &mut Engine, pc: u32, words: &[u32]) {
        engine.memory_mut().write_words(pc, words).unwrap();
        engine.invalidate(pc, (words.len() * 4) as u32);
    }

    #[test]
    fn test_invalidated_block_is_recompiled() {
        let (mut e, counts) = counting_engine(no_first_pass());
        load(
            &mut e,
            PC,
            &[asm::sw(3, 0x3000, 0), asm::addiu(1, 1, 1), asm::jr(2), asm::NOP],
        );
        e.registers_mut().set(2, RET);
        e.registers_mut().set(3, 42);

        assert_eq!(e.execute_one(PC), RET);
        assert_eq!(counts.compiled(), 1);
        assert_eq!(e.memory().read_u32(0x3000).unwrap(), 42);

        assert_eq!(e.execute_one(PC), RET);
        assert_eq!(counts.compiled(), 1);
        assert_eq!(e.registers().get(1), 2);

        e.invalidate(0x1000, 4);
        assert!(e.shared.lut.get(PC).is_null());

        assert_eq!(e.execute_one(PC), RET);
        assert_eq!(counts.compiled(), 2);
        assert_eq!(e.registers().get(1), 3);

        let stats = e.stats();
        assert_eq!(stats.outdated_blocks, 1);
        assert_eq!(stats.reaped_blocks, 1);
        assert_eq!(counts.released(), 1);
        assert_eq!(stats.code_objects, 1);
        assert_eq!(stats.cached_blocks, 1);
    }

    #[test]
    fn test_first_pass_interprets_then_compiles() {
        let mut e = engine(EngineConfig::synchronous());
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(2), asm::NOP]);
        e.registers_mut().set(2, RET);

        e.execute_one(PC);
        let stats = e.stats();
        assert_eq!(stats.interpreted_blocks, 1);
        assert_eq!(stats.blocks_compiled, 1);
        assert_eq!(stats.compiled_dispatches, 0);

        e.execute_one(PC);
        assert_eq!(e.stats().compiled_dispatches, 1);
        assert_eq!(e.registers().get(1), 2);
        assert!(matches!(e.shared.lut.get(PC), LutEntry::Code { offset: 0, .. }));
    }

    #[test]
    fn test_loop_runs_to_target_cycle() {
        // addiu + jr + nop = 6 cycles, interpreted or compiled.
        for config in [EngineConfig::synchronous(), no_first_pass()] {
            let mut e = engine(config);
            load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
            e.registers_mut().set(reg::RA, PC);

            assert_eq!(e.run(PC, 600), PC);
            assert_eq!(e.current_cycle(), 600);
            assert_eq!(e.registers().get(1), 100);
            assert!(e.exit_flags().is_normal());
        }
    }

    #[test]
    fn test_threaded_compilation() {
        let mut e = engine(EngineConfig::default());
        assert!(e.recompiler.is_some());
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, PC);

        assert_eq!(e.run(PC, 600), PC);
        assert_eq!(e.registers().get(1), 100);

        e.wait_for_compiler();
        assert!(e.stats().blocks_compiled >= 1);

        assert_eq!(e.run(PC, 1200), PC);
        assert_eq!(e.registers().get(1), 200);
        assert!(e.stats().compiled_dispatches > 0);
    }

    #[test]
    fn test_syscall_stops_the_run() {
        for config in [EngineConfig::synchronous(), no_first_pass()] {
            let mut e = engine(config);
            load(&mut e, PC, &[asm::addiu(1, 0, 5), asm::syscall()]);

            assert_eq!(e.run(PC, 10_000), PC + 4);
            assert!(e.exit_flags().contains(ExitFlags::SYSCALL));
            assert_eq!(e.registers().get(1), 5);
            assert!(e.current_cycle() < 10_000);
        }
    }

    #[test]
    fn test_unmapped_pc_is_a_segfault() {
        let mut e = engine(EngineConfig::synchronous());
        assert_eq!(e.run(0x0800_0000, 100), 0x0800_0000);
        assert!(e.exit_flags().contains(ExitFlags::SEGFAULT));

        // Cleared by the next run.
        load(&mut e, PC, &[asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, PC);
        e.run(PC, 100);
        assert!(e.exit_flags().is_normal());
    }

    #[test]
    fn test_covered_block_dies() {
        let mut e = engine(no_first_pass());
        let inner = PC + 4;
        load(
            &mut e,
            PC,
            &[
                asm::addiu(1, 1, 1),
                asm::addiu(2, 2, 1),
                asm::bne(2, 4, -2),
                asm::NOP,
                asm::jr(31),
                asm::NOP,
            ],
        );
        load(&mut e, RET, &[asm::syscall()]);
        e.registers_mut().set(4, 3);
        e.registers_mut().set(reg::RA, RET);

        // A block starting at the loop head gets cached first.
        e.run_interpreter(inner);
        let covered = e.shared.cache.lock().find(inner).unwrap();
        e.registers_mut().set(2, 0);

        assert_eq!(e.run(PC, 10_000), RET);
        assert!(e.exit_flags().contains(ExitFlags::SYSCALL));
        assert_eq!(e.registers().get(2), 3);

        assert!(covered.has(BlockFlags::IS_DEAD));
        assert!(e.shared.cache.lock().find(inner).is_none());
        assert!(matches!(e.shared.lut.get(inner), LutEntry::Code { offset: 1, .. }));
        assert_eq!(e.stats().dead_blocks, 1);
        assert_eq!(e.stats().reaped_blocks, 1);
    }

    #[test]
    fn test_memset_loop_is_replaced() {
        let mut e = engine(EngineConfig::synchronous());
        load(
            &mut e,
            PC,
            &[
                asm::sw(0, 0, reg::A0),
                asm::addiu(reg::A1, reg::A1, -1),
                asm::bne(reg::A1, 0, -3),
                asm::addiu(reg::A0, reg::A0, 4),
                asm::jr(31),
                asm::NOP,
            ],
        );
        e.memory_mut().fill_bytes(0x4000, 0x80, 0xff).unwrap();
        e.registers_mut().set(reg::A0, 0x8000_4000);
        e.registers_mut().set(reg::A1, 16);
        e.registers_mut().set(reg::RA, RET);

        assert_eq!(e.execute_one(PC), RET);
        assert!(e.memory().slice(0x4000, 64).unwrap().iter().all(|&b| b == 0));
        assert_eq!(e.memory().slice(0x4040, 1).unwrap(), &[0xff]);
        assert_eq!(e.registers().get(reg::A0), 0x8000_4040);
        assert_eq!(e.registers().get(reg::A1), 0);
        assert_eq!(e.current_cycle(), 8 + 5 * 64);
        assert_eq!(e.stats().memsets, 1);
        assert_eq!(e.shared.lut.get(PC), LutEntry::Memset);
    }

    #[test]
    fn test_guest_store_invalidates_code() {
        let victim = 0x8000_2000;
        let mut e = engine(no_first_pass());
        load(&mut e, victim, &[asm::addiu(1, 0, 1), asm::jr(31), asm::NOP]);
        load(&mut e, PC, &[asm::sw(3, 0x2000, 0), asm::jr(31), asm::NOP]);
        e.registers_mut().set(3, asm::addiu(1, 0, 7));
        e.registers_mut().set(reg::RA, 0x8000_3000);

        e.execute_one(victim);
        assert_eq!(e.registers().get(1), 1);

        e.execute_one(PC);
        assert!(e.shared.lut.get(victim).is_null());
        e.execute_one(victim);
        assert_eq!(e.registers().get(1), 7);
    }

    #[test]
    fn test_dma_only_mode_keeps_stale_code() {
        let victim = 0x8000_2000;
        let mut e = engine(no_first_pass());
        load(&mut e, victim, &[asm::addiu(1, 0, 1), asm::jr(31), asm::NOP]);
        load(&mut e, PC, &[asm::sw(3, 0x2000, 0), asm::jr(31), asm::NOP]);
        e.registers_mut().set(3, asm::addiu(1, 0, 7));
        e.registers_mut().set(reg::RA, 0x8000_3000);
        e.set_invalidate_mode(true);

        e.execute_one(victim);
        e.execute_one(PC);
        e.execute_one(victim);
        assert_eq!(e.registers().get(1), 1);

        // The DMA path still invalidates.
        e.invalidate(0x2000, 4);
        e.execute_one(victim);
        assert_eq!(e.registers().get(1), 7);
    }

    #[test]
    fn test_identical_block_is_reused() {
        let config = EngineConfig {
            reuse_identical_blocks: true,
            ..no_first_pass()
        };
        let (mut e, counts) = counting_engine(config);
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(2), asm::NOP]);
        e.registers_mut().set(2, RET);

        e.execute_one(PC);
        e.invalidate(0x1000, 12);
        e.execute_one(PC);

        assert_eq!(counts.compiled(), 1);
        assert_eq!(e.stats().reused_blocks, 1);
        assert_eq!(e.registers().get(1), 2);
    }

    #[test]
    fn test_compile_failures_fall_back_to_interpreter() {
        let config = EngineConfig {
            max_consecutive_failures: 2,
            ..EngineConfig::synchronous()
        };
        let mut e = Engine::with_generator(
            small_map(),
            CopOps::default(),
            config,
            Box::new(FailingGenerator),
        )
        .unwrap();
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(2), asm::NOP]);
        load(&mut e, RET, &[asm::addiu(1, 1, 1), asm::jr(3), asm::NOP]);
        e.registers_mut().set(2, RET);
        e.registers_mut().set(3, PC);

        assert_eq!(e.execute_one(PC), RET);
        let block = e.shared.cache.lock().find(PC).unwrap();
        assert!(block.has(BlockFlags::NEVER_COMPILE));
        assert!(e.compiler_enabled());

        assert_eq!(e.execute_one(RET), PC);
        assert!(!e.compiler_enabled());
        assert_eq!(e.registers().get(1), 2);

        // Still runs, interpreted.
        // 48 more cycles: eight 6-cycle blocks.
        assert_eq!(e.run(PC, 60), PC);
        assert_eq!(e.registers().get(1), 10);

        let json = e.diagnostics_json().unwrap();
        assert!(json.contains("\"enabled\": false"));
        assert!(json.contains("\"generator\": \"failing\""));

        e.reenable_compiler();
        assert!(e.compiler_enabled());
    }

    #[test]
    fn test_register_dump_round_trip() {
        let program = [
            asm::addiu(1, 1, 3),
            asm::mult(1, 1),
            asm::mflo(5),
            asm::jr(31),
            asm::NOP,
        ];

        let mut a = engine(EngineConfig::synchronous());
        load(&mut a, PC, &program);
        a.registers_mut().set(reg::RA, PC);
        a.run(PC, 100);
        let dump = a.dump_registers();

        let mut b = engine(no_first_pass());
        load(&mut b, PC, &program);
        b.restore_registers(&dump);
        assert_eq!(b.dump_registers(), dump);

        a.reset_cycle(0);
        b.reset_cycle(0);
        a.run(PC, 100);
        b.run(PC, 100);
        assert_eq!(a.dump_registers(), b.dump_registers());
    }

    #[test]
    fn test_trace_records_compilation() {
        let config = EngineConfig {
            trace_enabled: true,
            ..no_first_pass()
        };
        let mut e = engine(config);
        load(&mut e, PC, &[asm::jr(2), asm::NOP]);
        e.registers_mut().set(2, RET);
        e.execute_one(PC);

        let trace = e.trace();
        assert!(trace
            .events_for_pc(PC)
            .iter()
            .any(|ev| matches!(ev, TraceEvent::CompileEnd { success: true, .. })));
        assert_eq!(trace.stats().compilations, 1);
    }

    #[test]
    fn test_store_to_delay_slot_past_op_limit_invalidates() {
        let config = EngineConfig {
            max_block_ops: 4,
            ..no_first_pass()
        };
        let mut e = engine(config);
        let writer = 0x8000_1800;
        load(
            &mut e,
            PC,
            &[
                asm::NOP,
                asm::NOP,
                asm::NOP,
                asm::bne(0, 0, 2),
                asm::addiu(5, 0, 1),
                asm::syscall(),
            ],
        );
        load(&mut e, writer, &[asm::sw(6, 16, 7), asm::jr(31), asm::NOP]);
        e.registers_mut().set(6, asm::addiu(5, 0, 7));
        e.registers_mut().set(7, PC);
        e.registers_mut().set(reg::RA, RET);

        assert_eq!(e.execute_one(PC), PC + 20);
        assert_eq!(e.shared.cache.lock().find(PC).unwrap().nb_ops(), 5);
        assert_eq!(e.registers().get(5), 1);

        e.execute_one(writer);
        assert!(e.shared.lut.get(PC).is_null());
        e.execute_one(PC);
        assert_eq!(e.registers().get(5), 7);
    }

    #[test]
    fn test_reaping_does_not_wait_for_a_compile_in_progress() {
        let slow = 0x8000_1800;
        let (mut e, gate, counts) = gated_engine(slow);
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
        load(&mut e, slow, &[asm::addiu(2, 2, 1), asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, RET);

        e.execute_one(PC);
        e.wait_for_compiler();
        assert!(e.shared.lut.get(PC).code_id().is_some());

        e.execute_one(slow);
        gate.wait_entered();

        // Replace the compiled block while the worker holds the generator.
        load(&mut e, PC, &[asm::addiu(1, 1, 2), asm::jr(31), asm::NOP]);
        assert_eq!(e.execute_one(PC), RET);
        assert_eq!(e.registers().get(1), 3);
        assert_eq!(e.reaper.unreleased(), 1);
        assert_eq!(counts.released(), 0);
        assert_eq!(e.stats().deferred_reaps, 1);
        assert_eq!(e.diagnostics().generator, "gated");

        gate.open();
        e.wait_for_compiler();
        e.execute_one(slow);
        assert_eq!(e.reaper.unreleased(), 0);
        assert_eq!(counts.released(), 1);
        assert_eq!(counts.compiled(), 3);
    }

    #[test]
    fn test_block_replaced_during_its_compile_is_discarded() {
        let (mut e, gate, counts) = gated_engine(PC);
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, RET);

        e.execute_one(PC);
        gate.wait_entered();
        let old = e.shared.cache.lock().find(PC).unwrap();

        load(&mut e, PC, &[asm::addiu(1, 1, 2), asm::jr(31), asm::NOP]);
        e.execute_one(PC);
        assert!(old.has(BlockFlags::IS_DEAD));
        // Held back while the worker still compiles it.
        assert_eq!(e.reaper.pending(), 1);
        assert!(old.has_ops());

        gate.open();
        e.wait_for_compiler();
        assert!(!old.has_code());

        e.execute_one(PC);
        assert_eq!(e.reaper.pending(), 0);
        assert!(!old.has_ops());
        assert_eq!(counts.compiled(), 2);
        assert_eq!(counts.released(), 1);
        assert_eq!(e.registers().get(1), 5);

        let stats = e.stats();
        assert_eq!(stats.blocks_compiled, 1);
        assert_eq!(stats.code_objects, 1);
    }

    #[test]
    fn test_invalidation_during_compile_drops_the_new_code() {
        let (mut e, gate, counts) = gated_engine(PC);
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, RET);

        e.execute_one(PC);
        gate.wait_entered();
        e.invalidate(PC, 4);
        gate.open();
        e.wait_for_compiler();

        assert!(e.shared.lut.get(PC).is_null());
        let block = e.shared.cache.lock().find(PC).unwrap();
        assert!(!block.has_code());
        assert_eq!(e.stats().blocks_compiled, 0);

        e.reaper.drain(&e.shared);
        assert_eq!(counts.released(), 1);
        assert_eq!(e.stats().code_objects, 0);
    }

    #[test]
    fn test_block_queued_during_its_compile_is_compiled_once() {
        let (mut e, gate, counts) = gated_engine(PC);
        load(&mut e, PC, &[asm::addiu(1, 1, 1), asm::jr(31), asm::NOP]);
        e.registers_mut().set(reg::RA, RET);

        e.execute_one(PC);
        gate.wait_entered();
        e.execute_one(PC);
        e.execute_one(PC);
        assert_eq!(e.shared.queue.len(), 1);

        gate.open();
        e.wait_for_compiler();
        assert_eq!(counts.compiled(), 1);
        assert_eq!(e.registers().get(1), 3);

        e.execute_one(PC);
        assert_eq!(e.stats().compiled_dispatches, 1);
        assert_eq!(e.registers().get(1), 4);
    }

    #[test]
    fn test_tag_added_during_compile_requests_recompile() {
        let target = Arc::new(Mutex::new(None));
        let generator = RetaggingGenerator {
            inner: ThreadedGenerator::new(),
            block: Arc::clone(&target),
        };
        let mut e = Engine::with_generator(
            small_map(),
            CopOps::default(),
            no_first_pass(),
            Box::new(generator),
        )
        .unwrap();
        load(&mut e, PC, &[asm::lw(1, 0, 4), asm::jr(31), asm::NOP]);
        e.registers_mut().set(4, 0x100);
        e.registers_mut().set(reg::RA, RET);

        let block = e.get_block(PC).unwrap();
        assert!(block.with_ops(|ops| !ops[0].is_tagged()).unwrap());
        *target.lock() = Some(Arc::clone(&block));

        assert!(compile_block(&e.shared, &block, &mut e.regcache, false));
        assert!(block.has(BlockFlags::SHOULD_RECOMPILE));
        assert_eq!(e.shared.lut.get(PC), LutEntry::Pending);
        assert!(block.has_ops());

        assert_eq!(e.execute_one(PC), RET);
        assert_eq!(e.stats().recompilations, 1);
        assert!(!block.has(BlockFlags::SHOULD_RECOMPILE));
        assert!(matches!(e.shared.lut.get(PC), LutEntry::Code { offset: 0, .. }));
    }

    #[test]
    #[should_panic(expected = "compiled uncached block")]
    fn test_compiling_a_block_without_a_slot_panics() {
        let mut e = engine(EngineConfig::synchronous());
        let block = Arc::new(Block::new(
            0x1f80_1000,
            vec![Opcode::new(asm::jr(31)), Opcode::NOP],
            BlockFlags::empty(),
        ));
        compile_block(&e.shared, &block, &mut e.regcache, false);
    }
}
