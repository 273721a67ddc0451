//! Pending-command ordering for one command queue
//!
//! A max-heap keyed by (priority, sequence). In FIFO mode the priority is ignored and only the
//! arrival sequence counts.

use super::model::{CommandPriority, ProcessingMode};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
struct PendingEntry {
    /// Effective rank; constant in FIFO mode
    rank: u8,
    sequence: u64,
    command_id: String,
}

impl PendingEntry {
    fn key(&self) -> (u8, Reverse<u64>) {
        (self.rank, Reverse(self.sequence))
    }
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    // Higher priority first, then earlier arrival
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug)]
pub struct PendingQueue {
    mode: ProcessingMode,
    heap: BinaryHeap<PendingEntry>,
    next_sequence: u64,
}

impl PendingQueue {
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            mode,
            heap: BinaryHeap::new(),
            next_sequence: 0,
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn push(&mut self, command_id: String, priority: CommandPriority) {
        let rank = match self.mode {
            ProcessingMode::Priority => priority.value(),
            ProcessingMode::Fifo => 0,
        };
        self.heap.push(PendingEntry {
            rank,
            sequence: self.next_sequence,
            command_id,
        });
        self.next_sequence += 1;
    }

    pub fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|entry| entry.command_id)
    }

    pub fn peek(&self) -> Option<&str> {
        self.heap.peek().map(|entry| entry.command_id.as_str())
    }

    pub fn remove(&mut self, command_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.command_id != command_id);
        self.heap.len() != before
    }

    pub fn contains(&self, command_id: &str) -> bool {
        self.heap.iter().any(|entry| entry.command_id == command_id)
    }

    /// Remove everything, returning ids in dispatch order
    pub fn drain(&mut self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.heap.len());
        while let Some(id) = self.pop() {
            ids.push(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
