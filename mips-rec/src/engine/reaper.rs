//! Deferred reclamation of dead blocks and retired code.
//!
//! Neither the recompiler thread nor the publication path may free a block
//! or a piece of code the dispatcher could still be running. They post a
//! [`Reap`] token instead; the dispatching thread drains the queue at the end
//! of every run, when it holds no reference into guest code. Tokens for the
//! block the recompiler is working on stay queued until it is done.
//!
//! Handing code back to the generator needs the generator lock, which the
//! recompiler holds for a whole compile. When it is busy the functions wait
//! for a later drain; the dispatching thread never waits on it.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use super::Shared;
use super::block::{Block, CompiledCode};
use super::trace::TraceEvent;
use crate::backend::HostCode;

/// Something to reclaim.
#[derive(Debug)]
pub enum Reap {
    Block(Arc<Block>),
    Code(Arc<CompiledCode>),
}

impl Reap {
    /// Block the token refers to, if it is still alive.
    fn block(&self) -> Option<Arc<Block>> {
        match self {
            Reap::Block(block) => Some(Arc::clone(block)),
            Reap::Code(code) => code.block.upgrade(),
        }
    }
}

/// Receiving end, owned by the engine.
pub struct Reaper {
    rx: Receiver<Reap>,
    deferred: Vec<Reap>,
    /// Retired functions not yet handed back to the generator.
    unreleased: Vec<Arc<dyn HostCode>>,
}

impl Reaper {
    /// Sending end for the tokens, and the reaper that drains them.
    pub fn channel() -> (Sender<Reap>, Self) {
        let (tx, rx) = channel();
        (
            tx,
            Self {
                rx,
                deferred: Vec::new(),
                unreleased: Vec::new(),
            },
        )
    }

    /// Tokens held back by the last drain.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    /// Functions waiting for the generator lock.
    pub fn unreleased(&self) -> usize {
        self.unreleased.len()
    }

    /// Reclaim everything that is safe to reclaim now.
    pub(crate) fn drain(&mut self, shared: &Shared) {
        let mut tokens = std::mem::take(&mut self.deferred);
        tokens.extend(self.rx.try_iter());
        if !tokens.is_empty() {
            self.reap(shared, tokens);
        }
        self.release_functions(shared);
    }

    fn reap(&mut self, shared: &Shared, tokens: Vec<Reap>) {
        let (mut blocks, mut codes) = (0u32, 0u32);
        for token in tokens {
            if token
                .block()
                .is_some_and(|block| shared.queue.is_current(&block))
            {
                self.deferred.push(token);
                continue;
            }
            match token {
                Reap::Block(block) => {
                    if let Some(code) = block.take_code() {
                        self.release_code(shared, code);
                        codes += 1;
                    }
                    block.free_ops();
                    blocks += 1;
                }
                Reap::Code(code) => {
                    self.release_code(shared, code);
                    codes += 1;
                }
            }
        }

        if blocks + codes > 0 {
            log::trace!("[REC] Reaped {blocks} blocks and {codes} code objects");
            shared.counters.add(&shared.counters.reaped_blocks, u64::from(blocks));
            shared.counters.add(&shared.counters.reaped_codes, u64::from(codes));
            shared.trace(TraceEvent::Reap { blocks, codes });
        }
    }

    fn release_code(&mut self, shared: &Shared, code: Arc<CompiledCode>) {
        shared.lut.retire(code.id, &code.slots);
        shared.codes.write().remove(&code.id);
        shared.budget.lock().remove(code.id);
        self.unreleased.push(Arc::clone(&code.function));
    }

    fn release_functions(&mut self, shared: &Shared) {
        if self.unreleased.is_empty() {
            return;
        }
        let Some(mut generator) = shared.generator.try_lock() else {
            log::trace!(
                "[REC] Generator busy, holding {} functions",
                self.unreleased.len()
            );
            return;
        };
        for function in self.unreleased.drain(..) {
            generator.release(function);
        }
    }
}
