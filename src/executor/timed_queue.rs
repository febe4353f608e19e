//! Time-ordered task queue backed by a slot arena.
//!
//! Tasks live in a vector of slots; the binary heap only stores `(due, seq, slot,
//! generation)` tuples. Cancelling a task empties its slot and bumps the slot
//! generation, so the heap entry that still points at it is recognised as stale
//! and skipped when it reaches the top. No entry ever points at freed memory.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Stable handle to a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    slot: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    task: Option<Task>,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    due: Instant,
    seq: u64,
    id: TaskId,
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: invert so the earliest due (then lowest seq) is on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimedQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    live: usize,
}

impl TimedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks still waiting to run
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn push(&mut self, due: Instant, task: Task) -> TaskId {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].task = Some(task);
                slot
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    task: Some(task),
                });
                self.slots.len() - 1
            }
        };
        let id = TaskId {
            slot,
            generation: self.slots[slot].generation,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { due, seq, id });
        self.live += 1;
        id
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.slots
            .get(id.slot)
            .is_some_and(|slot| slot.generation == id.generation && slot.task.is_some())
    }

    /// Removes the task without running it and hands it back, so the caller can drop it
    /// outside any lock. `None` if it already ran or was cancelled.
    pub fn cancel(&mut self, id: TaskId) -> Option<Task> {
        if !self.contains(id) {
            return None;
        }
        self.take_slot(id)
    }

    /// Due time of the earliest live task
    pub fn next_due(&mut self) -> Option<Instant> {
        self.discard_stale_head();
        self.heap.peek().map(|entry| entry.due)
    }

    /// Pops the earliest task if it is due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<Task> {
        match self.next_due() {
            Some(due) if due <= now => self.pop_next(),
            _ => None,
        }
    }

    /// Pops the earliest task regardless of its due time
    pub fn pop_next(&mut self) -> Option<Task> {
        self.discard_stale_head();
        let entry = self.heap.pop()?;
        self.take_slot(entry.id)
    }

    /// Removes every task, returning them so the caller can drop them outside any lock
    pub fn drain_all(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.live);
        while let Some(task) = self.pop_next() {
            tasks.push(task);
        }
        self.heap.clear();
        tasks
    }

    fn discard_stale_head(&mut self) {
        while let Some(entry) = self.heap.peek() {
            if self.contains(entry.id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn take_slot(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.slot)?;
        if slot.generation != id.generation {
            return None;
        }
        let task = slot.task.take()?;
        slot.generation += 1;
        self.free.push(id.slot);
        self.live -= 1;
        Some(task)
    }
}
