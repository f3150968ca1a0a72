//! Event tracing for recompiler debugging.

use std::collections::VecDeque;

use crate::cpu::ExitFlags;

/// Trace event types.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A block was decoded and registered
    BlockPrecompiled { pc: u32, ops: u32, flags: u32 },
    /// A block ran through the interpreter
    BlockInterpreted { pc: u32, cycles: u32 },
    /// Code generation started
    CompileStart { pc: u32, ops: u32, threaded: bool },
    /// Code generation completed
    CompileEnd {
        pc: u32,
        code_size: usize,
        time_us: u64,
        success: bool,
    },
    /// The driver found a cached block whose slot was invalidated
    BlockOutdated { pc: u32, reused: bool },
    /// A block was retired
    BlockDead { pc: u32, reason: &'static str },
    /// Code Address Table invalidation
    Invalidate {
        addr: Option<u32>, // None = everything
        len: u32,
        reason: &'static str,
    },
    /// The host memset replaced a guest loop
    Memset { pc: u32, bytes: u32 },
    /// Reaper drained its queue
    Reap { blocks: u32, codes: u32 },
    /// Dispatch loop left with non-normal exit flags
    Exit { pc: u32, flags: ExitFlags },
}

impl TraceEvent {
    fn pc(&self) -> Option<u32> {
        match self {
            TraceEvent::BlockPrecompiled { pc, .. }
            | TraceEvent::BlockInterpreted { pc, .. }
            | TraceEvent::CompileStart { pc, .. }
            | TraceEvent::CompileEnd { pc, .. }
            | TraceEvent::BlockOutdated { pc, .. }
            | TraceEvent::BlockDead { pc, .. }
            | TraceEvent::Memset { pc, .. }
            | TraceEvent::Exit { pc, .. } => Some(*pc),
            TraceEvent::Invalidate { addr, .. } => *addr,
            TraceEvent::Reap { .. } => None,
        }
    }
}

/// Trace buffer with ring-buffer semantics.
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    enabled: bool,
    /// Sequence number for ordering
    sequence: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            enabled: false,
            sequence: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, event: TraceEvent) {
        if !self.enabled {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.sequence += 1;
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.sequence = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Log the most recent `count` events at info level.
    pub fn dump_recent(&self, count: usize) {
        let start = self.events.len().saturating_sub(count);
        log::info!("═══ Recent {} recompiler events ═══", count);
        for (i, event) in self.events.iter().skip(start).enumerate() {
            log::info!("{}", format_event(i, event));
        }
    }

    /// Get statistics from trace buffer.
    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats::default();
        for event in &self.events {
            match event {
                TraceEvent::BlockPrecompiled { .. } => stats.precompiled += 1,
                TraceEvent::BlockInterpreted { .. } => stats.interpreted += 1,
                TraceEvent::CompileEnd {
                    success: true,
                    code_size,
                    time_us,
                    ..
                } => {
                    stats.compilations += 1;
                    stats.total_code_bytes += code_size;
                    stats.total_compile_time_us += time_us;
                }
                TraceEvent::CompileEnd { success: false, .. } => {
                    stats.compilation_failures += 1;
                }
                TraceEvent::BlockOutdated { .. } => stats.outdated += 1,
                TraceEvent::BlockDead { .. } => stats.dead += 1,
                TraceEvent::Invalidate { .. } => stats.invalidations += 1,
                TraceEvent::Memset { .. } => stats.memsets += 1,
                TraceEvent::Exit { .. } => stats.exits += 1,
                _ => {}
            }
        }
        stats
    }

    /// Find events matching a predicate.
    pub fn filter<F>(&self, predicate: F) -> Vec<&TraceEvent>
    where
        F: Fn(&TraceEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).collect()
    }

    /// Find all events for a specific PC.
    pub fn events_for_pc(&self, pc: u32) -> Vec<&TraceEvent> {
        self.filter(|e| e.pc() == Some(pc))
    }
}

/// Format a trace event for display.
fn format_event(index: usize, event: &TraceEvent) -> String {
    match event {
        TraceEvent::BlockPrecompiled { pc, ops, flags } => {
            format!("[{index:4}] PRECOMPILE {pc:08x} ({ops} ops, flags={flags:#x})")
        }
        TraceEvent::BlockInterpreted { pc, cycles } => {
            format!("[{index:4}] INTERP {pc:08x} ({cycles} cycles)")
        }
        TraceEvent::CompileStart { pc, ops, threaded } => {
            let mode = if *threaded { "worker" } else { "sync" };
            format!("[{index:4}] COMPILE_START {pc:08x} ({ops} ops, {mode})")
        }
        TraceEvent::CompileEnd {
            pc,
            code_size,
            time_us,
            success,
        } => {
            let status = if *success { "OK" } else { "FAIL" };
            format!("[{index:4}] COMPILE_END {pc:08x} {status} ({code_size} bytes, {time_us}μs)")
        }
        TraceEvent::BlockOutdated { pc, reused } => {
            let action = if *reused { "reused" } else { "evicted" };
            format!("[{index:4}] OUTDATED {pc:08x} ({action})")
        }
        TraceEvent::BlockDead { pc, reason } => {
            format!("[{index:4}] DEAD {pc:08x} ({reason})")
        }
        TraceEvent::Invalidate { addr, len, reason } => match addr {
            Some(addr) => format!("[{index:4}] INVALIDATE {addr:08x}+{len} ({reason})"),
            None => format!("[{index:4}] INVALIDATE_ALL ({reason})"),
        },
        TraceEvent::Memset { pc, bytes } => {
            format!("[{index:4}] MEMSET {pc:08x} ({bytes} bytes)")
        }
        TraceEvent::Reap { blocks, codes } => {
            format!("[{index:4}] REAP {blocks} blocks, {codes} codes")
        }
        TraceEvent::Exit { pc, flags } => {
            format!("[{index:4}] EXIT {pc:08x} {flags:?}")
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    pub precompiled: u64,
    pub interpreted: u64,
    pub compilations: u64,
    pub compilation_failures: u64,
    pub total_code_bytes: usize,
    pub total_compile_time_us: u64,
    pub outdated: u64,
    pub dead: u64,
    pub invalidations: u64,
    pub memsets: u64,
    pub exits: u64,
}

impl TraceStats {
    /// Calculate average compilation time in microseconds.
    pub fn avg_compile_time_us(&self) -> f64 {
        if self.compilations == 0 {
            0.0
        } else {
            self.total_compile_time_us as f64 / self.compilations as f64
        }
    }

    /// Calculate average code size per compiled block.
    pub fn avg_code_size(&self) -> f64 {
        if self.compilations == 0 {
            0.0
        } else {
            self.total_code_bytes as f64 / self.compilations as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_buffer_records_nothing() {
        let mut trace = TraceBuffer::new(4);
        trace.push(TraceEvent::Memset { pc: 0, bytes: 4 });
        assert!(trace.is_empty());
        assert_eq!(trace.sequence(), 0);
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut trace = TraceBuffer::new(2);
        trace.enable();
        for pc in 0..3 {
            trace.push(TraceEvent::BlockInterpreted { pc, cycles: 2 });
        }
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.sequence(), 3);
        assert!(trace.events_for_pc(0).is_empty());
        assert_eq!(trace.events_for_pc(2).len(), 1);
    }

    #[test]
    fn test_stats() {
        let mut trace = TraceBuffer::new(16);
        trace.enable();
        trace.push(TraceEvent::CompileEnd {
            pc: 0x100,
            code_size: 64,
            time_us: 10,
            success: true,
        });
        trace.push(TraceEvent::CompileEnd {
            pc: 0x200,
            code_size: 0,
            time_us: 2,
            success: false,
        });
        trace.push(TraceEvent::Invalidate {
            addr: None,
            len: 0,
            reason: "mode change",
        });
        let stats = trace.stats();
        assert_eq!(stats.compilations, 1);
        assert_eq!(stats.compilation_failures, 1);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.avg_code_size(), 64.0);
        assert!(format_event(0, &trace.events[2]).contains("INVALIDATE_ALL"));
    }
}
