//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Default upper bound on the number of opcodes in one block.
pub const DEFAULT_MAX_BLOCK_OPS: usize = 256;

/// Recompiler configuration with optimization switches and safety limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Compile on a background thread instead of the dispatching thread.
    ///
    /// While a block is queued the dispatcher keeps running it through the
    /// interpreter (or its previous compiled code when recompiling).
    pub threaded: bool,

    /// Interpret a block once before compiling it so that memory accesses
    /// are tagged when code is generated.
    pub first_pass: bool,

    /// Replace the BIOS memset loop with a host implementation.
    pub replace_memset: bool,

    /// Detect branches in delay slots and leave them to the interpreter.
    pub detect_impossible_branches: bool,

    /// Resolve branches that stay inside the block to in-block jumps.
    pub local_branches: bool,

    /// Tag memory accesses whose base address is known at decode time.
    pub flag_io: bool,

    /// Maximum opcodes per block. Also bounds the backward window scanned on
    /// invalidation.
    pub max_block_ops: usize,

    /// Pending compile jobs before new requests are dropped.
    pub compile_queue_capacity: usize,

    /// Compiled code budget in bytes; least recently compiled blocks are
    /// evicted beyond it (0 = unlimited).
    pub code_budget_bytes: usize,

    /// Disable compilation after this many consecutive failures.
    pub max_consecutive_failures: u32,

    /// Disable compilation after this many failures in total.
    pub max_total_failures: u32,

    /// Guest stores do not invalidate code; only explicit invalidation does.
    pub invalidate_from_dma_only: bool,

    /// Re-publish the code of an outdated block whose bytes did not change.
    pub reuse_identical_blocks: bool,

    /// Record engine events in the trace buffer.
    pub trace_enabled: bool,

    /// Trace buffer capacity (events).
    pub trace_capacity: usize,

    /// Log the disassembly of every precompiled block at debug level.
    pub log_disassembly: bool,

    /// Log memory usage every this many cycles (0 = never).
    pub report_interval_cycles: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            first_pass: true,
            replace_memset: true,
            detect_impossible_branches: true,
            local_branches: true,
            flag_io: true,
            max_block_ops: DEFAULT_MAX_BLOCK_OPS,
            compile_queue_capacity: 512,
            code_budget_bytes: 8 * 1024 * 1024, // 8 MiB code buffer
            max_consecutive_failures: 10,
            max_total_failures: 100,
            invalidate_from_dma_only: false,
            reuse_identical_blocks: false,
            trace_enabled: false,
            trace_capacity: 1024,
            log_disassembly: false,
            report_interval_cycles: 1 << 28,
        }
    }
}

impl EngineConfig {
    /// Single-threaded configuration, compiling on first sight. Deterministic,
    /// which is what tests and tracing want.
    pub fn synchronous() -> Self {
        Self {
            threaded: false,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields keep their defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let mut config: EngineConfig = serde_json::from_str(json)?;
        config.normalize();
        Ok(config)
    }

    /// Clamp values the engine cannot honor.
    pub fn normalize(&mut self) {
        // Opcode offsets inside a block are 16-bit.
        self.max_block_ops = self.max_block_ops.clamp(2, u16::MAX as usize - 1);
        self.compile_queue_capacity = self.compile_queue_capacity.max(1);
        self.trace_capacity = self.trace_capacity.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"threaded": false, "maxBlockOps": 1}"#).unwrap();
        assert!(!config.threaded);
        assert_eq!(config.max_block_ops, 2);
        assert!(config.first_pass);
        assert_eq!(config.code_budget_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(EngineConfig::from_json("{\"threaded\": 3}").is_err());
    }
}
