//! Background recompiler thread.
//!
//! A single worker pops blocks from a FIFO queue and runs
//! [`compile_block`] on them while the dispatcher keeps going. The
//! dispatcher keeps interpreting a queued block (or runs its previous code)
//! until the new code shows up in the Code Address Table.
//!
//! ```text
//!   dispatcher ──submit──▶ ┌────────────┐ ──pop──▶ worker ──compile_block──▶ publish
//!              ──cancel──▶ │ job queue  │            │
//!                          └────────────┘            └── current (reaper defers it)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::Shared;
use super::block::{Block, BlockFlags};
use super::compiler::compile_block;
use super::regcache::RegCache;
use crate::error::{Error, Result};

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Arc<Block>>,
    /// Block being compiled by the worker.
    current: Option<Arc<Block>>,
}

/// Compile job queue shared by the dispatcher and the worker.
pub struct CompileQueue {
    state: Mutex<QueueState>,
    /// Signalled when a job arrives or on shutdown.
    work: Condvar,
    /// Signalled when the worker finishes a job.
    done: Condvar,
    stop: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

impl CompileQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            stop: AtomicBool::new(false),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `block` for compilation. A block already queued is not queued
    /// twice; a full queue drops the request. Returns whether the block is
    /// now queued.
    pub fn submit(&self, block: &Arc<Block>) -> bool {
        let mut state = self.state.lock();
        if state.jobs.iter().any(|b| Arc::ptr_eq(b, block)) {
            return true;
        }
        if state.jobs.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[REC] Compile queue full, dropping request for {:#010x}",
                block.pc()
            );
            return false;
        }
        state.jobs.push_back(Arc::clone(block));
        self.work.notify_one();
        true
    }

    /// Remove a pending job for `block`. Does not wait for a compile in
    /// progress; publication checks `IS_DEAD` instead.
    pub fn cancel(&self, block: &Arc<Block>) -> bool {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|b| !Arc::ptr_eq(b, block));
        before != state.jobs.len()
    }

    /// Whether the worker is compiling `block` right now.
    pub fn is_current(&self, block: &Arc<Block>) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(b, block))
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Block until the queue is empty and the worker is idle.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !state.jobs.is_empty() || state.current.is_some() {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            self.done.wait(&mut state);
        }
    }

    /// Forget every pending job.
    pub fn clear(&self) {
        self.state.lock().jobs.clear();
    }

    fn next_job(&self) -> Option<Arc<Block>> {
        let mut state = self.state.lock();
        state.current = None;
        self.done.notify_all();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(block) = state.jobs.pop_front() {
                state.current = Some(Arc::clone(&block));
                return Some(block);
            }
            self.work.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.jobs.clear();
        self.work.notify_all();
        self.done.notify_all();
    }
}

/// Owner of the worker thread. Dropping it stops and joins the thread.
pub struct Recompiler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Recompiler {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("mips-rec-compiler".into())
            .spawn(move || worker_loop(&worker))
            .map_err(Error::Io)?;
        log::debug!("[REC] Recompiler thread started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn submit(&self, block: &Arc<Block>) -> bool {
        self.shared.queue.submit(block)
    }

    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle();
    }
}

impl Drop for Recompiler {
    fn drop(&mut self) {
        self.shared.queue.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[REC] Recompiler thread panicked");
            }
        }
        log::debug!("[REC] Recompiler thread stopped");
    }
}

fn worker_loop(shared: &Shared) {
    let mut regcache = RegCache::new();
    while let Some(block) = shared.queue.next_job() {
        if block.has(BlockFlags::IS_DEAD) {
            continue;
        }
        // Queued again while it was being compiled.
        if block.has_code() && !block.has(BlockFlags::SHOULD_RECOMPILE) {
            continue;
        }
        log::trace!("[REC] Recompiler picked up {:#010x}", block.pc());
        compile_block(shared, &block, &mut regcache, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Opcode;

    fn block(pc: u32) -> Arc<Block> {
        Arc::new(Block::new(pc, vec![Opcode::NOP], BlockFlags::empty()))
    }

    #[test]
    fn test_submit_is_idempotent() {
        let q = CompileQueue::new(8);
        let b = block(0x100);
        assert!(q.submit(&b));
        assert!(q.submit(&b));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_capacity_drops_requests() {
        let q = CompileQueue::new(2);
        assert!(q.submit(&block(0x100)));
        assert!(q.submit(&block(0x200)));
        assert!(!q.submit(&block(0x300)));
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_cancel_removes_job() {
        let q = CompileQueue::new(8);
        let a = block(0x100);
        let b = block(0x200);
        q.submit(&a);
        q.submit(&b);
        assert!(q.cancel(&a));
        assert!(!q.cancel(&a));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_worker_hands_out_jobs_in_order() {
        let q = CompileQueue::new(8);
        let a = block(0x100);
        let b = block(0x200);
        q.submit(&a);
        q.submit(&b);
        let first = q.next_job().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert!(q.is_current(&a));
        let second = q.next_job().unwrap();
        assert!(Arc::ptr_eq(&second, &b));
        assert!(!q.is_current(&a));

        q.shutdown();
        assert!(q.next_job().is_none());
        q.wait_idle();
    }
}
