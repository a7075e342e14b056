//! Bounded, priority-ordered work queue with backpressure.
//!
//! Lower priority values dispatch first; entries within a priority class
//! leave in FIFO order (a monotonic sequence number breaks ties, so ordering
//! is deterministic). `enqueue` blocks up to a timeout when the queue is at
//! capacity and then reports fullness instead of growing unbounded;
//! `dequeue` blocks up to a timeout when empty.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Marker returned when backpressure could not be relieved in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

struct Entry<T> {
    priority: u32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the max entry; invert so the smallest
        // (priority, seq) pair wins.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

/// In-process bounded priority queue. Cheap to clone; all clones share state.
pub struct BoundedPriorityQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedPriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> BoundedPriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    seq: 0,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.shared.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned queue mutex");
            poisoned.into_inner()
        })
    }

    /// Push an item, waiting up to `timeout` for space.
    pub async fn enqueue(&self, item: T, priority: u32, timeout: Duration) -> Result<(), QueueFull> {
        let deadline = Instant::now() + timeout;
        let mut item = Some(item);
        loop {
            {
                let mut state = self.lock_state();
                if state.heap.len() < self.shared.capacity
                    && let Some(value) = item.take()
                {
                    state.seq += 1;
                    let seq = state.seq;
                    state.heap.push(Entry {
                        priority,
                        seq,
                        item: value,
                    });
                    drop(state);
                    self.shared.not_empty.notify_one();
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueFull);
            }
            let _ = tokio::time::timeout_at(deadline, self.shared.not_full.notified()).await;
        }
    }

    /// Pop the highest-priority item, waiting up to `timeout` when empty.
    pub async fn dequeue(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock_state();
                if let Some(entry) = state.heap.pop() {
                    drop(state);
                    self.shared.not_full.notify_one();
                    return Some(entry.item);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout_at(deadline, self.shared.not_empty.notified()).await;
        }
    }

    /// Non-blocking pop.
    pub fn try_dequeue(&self) -> Option<T> {
        let popped = self.lock_state().heap.pop();
        if popped.is_some() {
            self.shared.not_full.notify_one();
        }
        popped.map(|entry| entry.item)
    }

    pub fn len(&self) -> usize {
        self.lock_state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}
