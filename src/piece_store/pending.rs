use crate::data_structures::ID;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// `(piece, begin, length)`, the unit of request and delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: usize,
    pub begin: usize,
    pub length: usize,
}

/// Fixed-size blocks, the last one truncated to what is left of the piece.
pub fn plan_blocks(piece: usize, piece_size: usize, block_size: usize) -> Vec<BlockRequest> {
    (0..piece_size)
        .step_by(block_size)
        .map(|begin| BlockRequest {
            piece,
            begin,
            length: std::cmp::min(block_size, piece_size - begin),
        })
        .collect()
}

#[derive(Debug, Clone)]
struct PendingBlockDesc {
    target: ID,
    time_sent: Instant,
}

#[derive(Debug, Clone)]
enum Block {
    Unbegun,
    Pending(PendingBlockDesc),
    Downloaded(Bytes),
}

impl Block {
    fn is_expected_from(&self, peer: &ID) -> bool {
        matches!(self, Block::Pending(desc) if desc.target == *peer)
    }

    fn is_requestable(&self, now: Instant, timeout: Duration) -> bool {
        match self {
            Block::Unbegun => true,
            Block::Pending(desc) => now.duration_since(desc.time_sent) >= timeout,
            Block::Downloaded(_) => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddBlockRes {
    Added,
    AddedLast,
    Duplicate,
    Unexpected,
}

/// Blocks of one piece being assembled, possibly from several peers.
#[derive(Debug)]
pub struct PendingPiece {
    plan: Vec<BlockRequest>,
    blocks: Vec<Block>,
    remaining: usize,
}

impl PendingPiece {
    pub fn new(plan: Vec<BlockRequest>) -> Self {
        Self {
            blocks: vec![Block::Unbegun; plan.len()],
            remaining: plan.len(),
            plan,
        }
    }

    fn slot(&self, begin: usize) -> Option<usize> {
        self.plan
            .binary_search_by_key(&begin, |block| block.begin)
            .ok()
    }

    pub fn mark_requested(&mut self, begin: usize, target: ID, now: Instant) {
        let Some(slot) = self.slot(begin) else {
            return;
        };

        if !matches!(self.blocks[slot], Block::Downloaded(_)) {
            self.blocks[slot] = Block::Pending(PendingBlockDesc {
                target,
                time_sent: now,
            });
        }
    }

    pub fn add_block(&mut self, begin: usize, data: Bytes) -> AddBlockRes {
        let Some(slot) = self.slot(begin) else {
            warn!(begin, "block does not start on a block boundary");
            return AddBlockRes::Unexpected;
        };

        if self.plan[slot].length != data.len() {
            warn!(
                begin,
                expected = self.plan[slot].length,
                got = data.len(),
                "block has the wrong length"
            );
            return AddBlockRes::Unexpected;
        }

        if matches!(self.blocks[slot], Block::Downloaded(_)) {
            return AddBlockRes::Duplicate;
        }

        self.blocks[slot] = Block::Downloaded(data);
        self.remaining -= 1;

        if self.remaining == 0 {
            AddBlockRes::AddedLast
        } else {
            AddBlockRes::Added
        }
    }

    /// Blocks never requested plus requests that went unanswered for `timeout`.
    pub fn requestable(&self, now: Instant, timeout: Duration) -> Vec<BlockRequest> {
        self.plan
            .iter()
            .zip(self.blocks.iter())
            .filter_map(|(req, block)| block.is_requestable(now, timeout).then_some(*req))
            .collect()
    }

    /// Forgets requests addressed to `from`; delivered blocks stay.
    pub fn cancel_pending(&mut self, from: &ID) -> usize {
        let mut cancelled = 0;

        for block in self.blocks.iter_mut() {
            if block.is_expected_from(from) {
                *block = Block::Unbegun;
                cancelled += 1;
            }
        }

        cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn downloaded_blocks(&self) -> usize {
        self.plan.len() - self.remaining
    }

    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        let mut piece = BytesMut::with_capacity(self.plan.iter().map(|b| b.length).sum());

        for block in self.blocks.iter() {
            let Block::Downloaded(data) = block else {
                return None;
            };
            piece.extend_from_slice(data);
        }

        Some(piece.freeze())
    }

    pub fn reset(&mut self) {
        self.blocks = vec![Block::Unbegun; self.plan.len()];
        self.remaining = self.plan.len();
    }
}
