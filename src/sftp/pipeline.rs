//! State for the two pipelined transfer engines: the fixed write-ahead
//! window and the adaptive read window. Pure bookkeeping; the session
//! moves the bytes.

use std::collections::VecDeque;

use super::constants::{
    MAX_PENDING_WRITES, MAX_PENDING_WRITE_BUFFER, MAX_PIPELINED_READS, READ_WINDOW_STEP,
};

/// Request ids of WRITEs sent but not yet acknowledged, in issue
/// order. The cap is derived from the blocksize at open time so at
/// most MAX_PENDING_WRITE_BUFFER bytes are ever in flight.
#[derive(Debug, Default)]
pub struct WriteQueue {
    ids: Vec<u32>,
    cap: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue::default()
    }

    pub fn for_blocksize(blocksize: u32) -> Self {
        let cap = (MAX_PENDING_WRITE_BUFFER / blocksize.max(1) as usize)
            .clamp(1, MAX_PENDING_WRITES);
        WriteQueue {
            ids: Vec::with_capacity(cap),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.ids.len() < self.cap
    }

    pub fn is_full(&self) -> bool {
        !self.has_room()
    }

    pub fn push(&mut self, id: u32) {
        self.ids.push(id);
    }

    /// Remove an acknowledged id; false when the id was never queued.
    pub fn remove(&mut self, id: u32) -> bool {
        match self.ids.iter().position(|&queued| queued == id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }
}

/// Adaptive multi-read dispatcher state.
///
/// Planned requests cover the expected size plus one extra block that
/// either carries the tail or runs into EOF. The window starts at the
/// step and grows by the step each time the consumer drains the queue
/// to one below the window, up to the hard cap.
#[derive(Debug)]
pub struct ReadPipeline {
    ids: VecDeque<u32>,
    blocksize: u32,
    total_blocks: u64,
    dispatched: u64,
    consumed: u64,
    window: usize,
    low_water: usize,
    eof_seen: bool,
    aborted: bool,
}

impl ReadPipeline {
    pub fn new(blocksize: u32, expected_size: u64) -> Self {
        let blocksize = blocksize.max(1);
        let total_blocks = expected_size / blocksize as u64 + 1;
        let window = READ_WINDOW_STEP.min(MAX_PIPELINED_READS);
        ReadPipeline {
            ids: VecDeque::new(),
            blocksize,
            total_blocks,
            dispatched: 0,
            consumed: 0,
            window,
            low_water: window / 2,
            eof_seen: false,
            aborted: false,
        }
    }

    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn outstanding(&self) -> usize {
        self.ids.len()
    }

    /// How many READ requests the caller may issue before the first
    /// catch.
    pub fn initial_permits(&self) -> usize {
        self.total_blocks.min(self.window as u64) as usize
    }

    /// How many additional READs to fire right now: only when the
    /// queue has drained to the low-water mark and the window has
    /// room, and never beyond the planned total.
    pub fn dispatch_quota(&self) -> usize {
        if self.eof_seen || self.aborted {
            return 0;
        }
        let queued = self.ids.len();
        if queued > self.low_water || queued >= self.window {
            return 0;
        }
        let room = self.window - queued;
        let remaining = self.total_blocks.saturating_sub(self.dispatched);
        room.min(remaining.min(usize::MAX as u64) as usize)
    }

    pub fn on_dispatch(&mut self, id: u32) {
        self.ids.push_back(id);
        self.dispatched += 1;
    }

    /// Next reply to await, in strict issue order.
    pub fn pop_pending(&mut self) -> Option<u32> {
        self.ids.pop_front()
    }

    /// Account one consumed DATA block; true when it was the last
    /// planned block.
    pub fn on_data(&mut self) -> bool {
        self.consumed += 1;
        self.consumed >= self.total_blocks
    }

    /// Window growth check, run after each consumed reply.
    pub fn maybe_grow(&mut self) {
        if self.window < MAX_PIPELINED_READS && self.ids.len() + 1 == self.window {
            self.window = (self.window + READ_WINDOW_STEP).min(MAX_PIPELINED_READS);
            self.low_water = self.window / 2;
        }
    }

    pub fn on_eof(&mut self) {
        self.eof_seen = true;
    }

    /// A short non-final reply poisons the pipeline; the caller falls
    /// back to single reads.
    pub fn on_abort(&mut self) {
        self.aborted = true;
    }

    pub fn finished(&self) -> bool {
        self.eof_seen || self.aborted || self.consumed >= self.total_blocks
    }
}
