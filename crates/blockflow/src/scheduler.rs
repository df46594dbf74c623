//! Priority loop scheduler.
//!
//! Queued blocks land in a wait list and are split into four priority
//! buckets right before they run. Bucket 0 is a stack (depth first), buckets
//! 1-3 are FIFO queues. After every block the wait list is split again; a
//! newly queued block with a better priority than the bucket being serviced
//! restarts the drain from bucket 0. `run` returns only at a fixed point and
//! counts one tick per fixed point.

use std::collections::VecDeque;

use futures_channel::mpsc;

use crate::arena::BlockId;
use crate::block::RunState;
use crate::runner::Invocation;
use crate::runtime::Runtime;
use crate::value::{MAX_SAFE_INTEGER, MIN_SAFE_INTEGER};

pub const BUCKETS: usize = 4;

#[derive(Default)]
pub(crate) struct Loop {
    buckets: [VecDeque<BlockId>; BUCKETS],
    wait: Vec<BlockId>,
    tick: i64,
    running: bool,
    /// The schedule hook fired and `run` has not been called since.
    scheduled: bool,
    hook: Option<Box<dyn FnMut()>>,
}

impl Loop {
    pub(crate) fn tick(&self) -> i64 {
        self.tick
    }

    fn pop(&mut self, bucket: usize) -> Option<BlockId> {
        if bucket == 0 {
            self.buckets[0].pop_back()
        } else {
            self.buckets[bucket].pop_front()
        }
    }

    fn has_work(&self) -> bool {
        !self.wait.is_empty() || self.buckets.iter().any(|bucket| !bucket.is_empty())
    }

    fn advance_tick(&mut self) {
        self.tick = if self.tick >= MAX_SAFE_INTEGER {
            MIN_SAFE_INTEGER
        } else {
            self.tick + 1
        };
    }
}

impl Runtime {
    pub(crate) fn queue_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        block.queued = true;
        block.state = RunState::Queued;
        self.scheduler.wait.push(id);
        if !self.scheduler.running && !self.scheduler.scheduled {
            self.scheduler.scheduled = true;
            if let Some(hook) = self.scheduler.hook.as_mut() {
                hook();
            }
        }
    }

    /// Move the wait list into buckets. Returns the best priority seen.
    fn split_wait(&mut self) -> Option<usize> {
        let mut best = None;
        for id in std::mem::take(&mut self.scheduler.wait) {
            let Some(block) = self.blocks.get_mut(id) else {
                continue;
            };
            if block.priority < 0 {
                block.queued = false;
                if block.state == RunState::Queued {
                    block.state = RunState::Idle;
                }
                continue;
            }
            let bucket = (block.priority as usize).min(BUCKETS - 1);
            self.scheduler.buckets[bucket].push_back(id);
            best = Some(best.map_or(bucket, |b: usize| b.min(bucket)));
        }
        best
    }

    /// Drain every queue to a fixed point, then advance the tick.
    pub fn run(&mut self) {
        if self.scheduler.running {
            return;
        }
        self.scheduler.running = true;
        self.scheduler.scheduled = false;
        self.split_wait();
        let mut bucket = 0;
        loop {
            match self.scheduler.pop(bucket) {
                Some(id) => {
                    self.run_block(id);
                    if let Some(best) = self.split_wait() {
                        if best < bucket {
                            bucket = 0;
                        }
                    }
                }
                None if bucket + 1 < BUCKETS => bucket += 1,
                None => {
                    if self.split_wait().is_none() {
                        break;
                    }
                    bucket = 0;
                }
            }
        }
        self.scheduler.advance_tick();
        self.scheduler.running = false;
        log::trace!("tick {}", self.scheduler.tick);
    }

    fn run_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id) else {
            return;
        };
        block.queued = false;
        if block.state != RunState::Queued {
            return;
        }
        block.state = RunState::Idle;
        if self.is_disabled(id) {
            if let Some(block) = self.blocks.get_mut(id) {
                block.pending = true;
            }
            return;
        }
        self.invoke(id, Invocation::Run);
    }

    /// Call `run` up to `limit` times while work remains.
    pub fn run_all(&mut self, limit: usize) {
        for _ in 0..limit {
            if !self.has_pending() {
                break;
            }
            self.run();
        }
    }

    pub fn has_pending(&self) -> bool {
        self.scheduler.has_work()
    }

    /// Called once whenever work is queued while no drain is running or
    /// already scheduled. Embedders use it to schedule `run`.
    pub fn set_schedule_hook(&mut self, hook: impl FnMut() + 'static) {
        self.scheduler.hook = Some(Box::new(hook));
    }

    /// Schedule hook as a channel: one item per schedule request.
    pub fn schedule_channel(&mut self) -> mpsc::UnboundedReceiver<()> {
        let (sender, receiver) = mpsc::unbounded();
        self.set_schedule_hook(move || {
            let _ = sender.unbounded_send(());
        });
        receiver
    }
}
