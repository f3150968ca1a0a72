//! Code buffer budget with LRU eviction.
//!
//! Tracks the size of every published code object, keyed by code id. When
//! the total exceeds the configured budget the least recently compiled codes
//! are handed back to the caller, which retires their Code Address Table
//! entries. The dispatcher then finds the owning blocks outdated and they
//! leave through the normal eviction and reaper path.
//!
//! ```text
//!   compile ──insert(id, size)──▶ ┌──────────────┐
//!                                 │  LRU of ids  │──over budget──▶ evicted ids
//!   reap ─────remove(id)────────▶ └──────────────┘                (slots → Null)
//! ```

use lru::LruCache;

/// Budget statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStats {
    /// Number of entries inserted
    pub insertions: u64,
    /// Number of entries evicted to stay within budget
    pub evictions: u64,
    /// Total bytes of code ever accounted
    pub bytes_compiled: usize,
}

pub struct CodeBudget {
    entries: LruCache<u32, usize>,
    /// Maximum total bytes (0 = unlimited)
    max_bytes: usize,
    current_bytes: usize,
    stats: BudgetStats,
}

impl CodeBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_bytes,
            current_bytes: 0,
            stats: BudgetStats::default(),
        }
    }

    /// Account `size` bytes for code object `id`.
    ///
    /// Returns the ids evicted to make room. `id` itself is never evicted by
    /// its own insertion.
    pub fn insert(&mut self, id: u32, size: usize) -> Vec<u32> {
        // Recompilation replaces the previous size.
        if let Some(old) = self.entries.pop(&id) {
            self.current_bytes = self.current_bytes.saturating_sub(old);
        }

        let mut evicted = Vec::new();
        if self.max_bytes != 0 {
            while self.current_bytes + size > self.max_bytes {
                let Some((victim, bytes)) = self.entries.pop_lru() else {
                    break;
                };
                self.current_bytes = self.current_bytes.saturating_sub(bytes);
                self.stats.evictions += 1;
                evicted.push(victim);
            }
        }

        self.entries.put(id, size);
        self.current_bytes += size;
        self.stats.insertions += 1;
        self.stats.bytes_compiled += size;
        evicted
    }

    /// Forget code `id` (it was reaped).
    pub fn remove(&mut self, id: u32) -> bool {
        match self.entries.pop(&id) {
            Some(bytes) => {
                self.current_bytes = self.current_bytes.saturating_sub(bytes);
                true
            }
            None => false,
        }
    }

    /// Mark code `id` as recently used.
    pub fn touch(&mut self, id: u32) {
        self.entries.promote(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains(&id)
    }

    pub fn memory_usage(&self) -> usize {
        self.current_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> &BudgetStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_by_bytes() {
        let mut budget = CodeBudget::new(100);
        assert!(budget.insert(0x100, 40).is_empty());
        assert!(budget.insert(0x200, 40).is_empty());
        assert_eq!(budget.insert(0x300, 40), vec![0x100]);
        assert_eq!(budget.memory_usage(), 80);
        assert_eq!(budget.stats().evictions, 1);
    }

    #[test]
    fn test_touch_updates_lru_order() {
        let mut budget = CodeBudget::new(100);
        budget.insert(0x100, 40);
        budget.insert(0x200, 40);
        budget.touch(0x100);
        assert_eq!(budget.insert(0x300, 40), vec![0x200]);
        assert!(budget.contains(0x100));
    }

    #[test]
    fn test_recompilation_replaces_entry() {
        let mut budget = CodeBudget::new(100);
        budget.insert(0x100, 60);
        assert!(budget.insert(0x100, 90).is_empty());
        assert_eq!(budget.memory_usage(), 90);
        assert_eq!(budget.entry_count(), 1);
    }

    #[test]
    fn test_unlimited_and_remove() {
        let mut budget = CodeBudget::new(0);
        for pc in 0..64 {
            assert!(budget.insert(pc * 4, 1 << 20).is_empty());
        }
        assert!(budget.remove(0));
        assert!(!budget.remove(0));
        assert_eq!(budget.memory_usage(), 63 << 20);
        budget.clear();
        assert_eq!(budget.entry_count(), 0);
    }

    #[test]
    fn test_oversized_entry_empties_budget() {
        let mut budget = CodeBudget::new(10);
        budget.insert(0x100, 5);
        assert_eq!(budget.insert(0x200, 50), vec![0x100]);
        assert!(budget.contains(0x200));
    }
}
