//! Bounded producer/consumer queue between stages.
//!
//! `push` blocks while the queue is at its high-water mark and `pop` blocks
//! while it is empty and the owning stage runs. Both wait on condition
//! variables; the bounded wait only exists so a blocked caller re-checks the
//! queue mode even if a wakeup is missed.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

/// Longest a blocked push/pop sleeps before re-checking the queue mode.
const RECHECK_INTERVAL: Duration = Duration::from_millis(20);

/// Decoder input: packets are cheap to hold.
pub const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 50;
/// Encoder input: frames can pin hardware surfaces.
pub const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 6;
pub const DEFAULT_MUX_QUEUE_CAPACITY: usize = 64;

/// Outcome of handing a unit to a queue or a pad consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The consumer is stopped or gone; the unit was dropped.
    Rejected,
}

/// Follows the owning stage's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Stage open but not started: pushes are queued, pops never block.
    Idle,
    /// Stage running: pushes and pops block.
    Running,
    /// Stage stopped or closed: pushes are rejected, pops return nothing.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    mode: QueueMode,
    peak: usize,
}

pub struct BufferQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BufferQueue<T> {
    pub fn new(name: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.to_string(),
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                mode: QueueMode::Idle,
                peak: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `unit`, blocking while the queue is full.
    pub fn push(&self, unit: T) -> Delivery {
        self.push_inner(unit, None)
    }

    /// Like [`push`](Self::push), but gives up once `cancel` fires. Used by
    /// stage workers so a blocked producer can still be stopped.
    pub fn push_until(&self, unit: T, cancel: &CancellationToken) -> Delivery {
        self.push_inner(unit, Some(cancel))
    }

    fn push_inner(&self, unit: T, cancel: Option<&CancellationToken>) -> Delivery {
        let mut inner = self.inner.lock();
        loop {
            if inner.mode == QueueMode::Closed {
                return Delivery::Rejected;
            }
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Delivery::Rejected;
            }
            if inner.items.len() < self.capacity {
                break;
            }
            self.not_full.wait_for(&mut inner, RECHECK_INTERVAL);
        }
        inner.items.push_back(unit);
        inner.peak = inner.peak.max(inner.items.len());
        drop(inner);
        self.not_empty.notify_one();
        Delivery::Accepted
    }

    /// Appends `unit` only if there is room. Hands the unit back otherwise.
    pub fn try_push(&self, unit: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.mode == QueueMode::Closed || inner.items.len() >= self.capacity {
            return Err(unit);
        }
        inner.items.push_back(unit);
        inner.peak = inner.peak.max(inner.items.len());
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Takes the oldest unit, blocking while the queue is empty and running.
    pub fn pop(&self) -> Option<T> {
        self.pop_inner(None)
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.pop_inner(Some(timeout))
    }

    fn pop_inner(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.mode == QueueMode::Closed {
                return None;
            }
            if let Some(unit) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(unit);
            }
            if inner.mode != QueueMode::Running {
                return None;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(RECHECK_INTERVAL)
                }
                None => RECHECK_INTERVAL,
            };
            self.not_empty.wait_for(&mut inner, wait);
        }
    }

    /// Drops every queued unit and returns how many there were.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = {
            let mut inner = self.inner.lock();
            inner.items.drain(..).collect()
        };
        self.not_full.notify_all();
        let count = drained.len();
        if count > 0 {
            log::debug!("queue {}: purged {} units", self.name, count);
        }
        // Units (and any surfaces they pin) are released outside the lock.
        drop(drained);
        count
    }

    pub fn set_mode(&self, mode: QueueMode) {
        self.inner.lock().mode = mode;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.lock().mode
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Highest depth observed since creation.
    pub fn peak(&self) -> usize {
        self.inner.lock().peak
    }
}

/// Type-erased queue control used by the stage runner on lifecycle changes.
pub trait QueueControl: Send + Sync {
    fn name(&self) -> &str;
    fn set_mode(&self, mode: QueueMode);
    fn clear(&self) -> usize;
    fn len(&self) -> usize;
    fn peak(&self) -> usize;
}

impl<T: Send> QueueControl for BufferQueue<T> {
    fn name(&self) -> &str {
        BufferQueue::name(self)
    }

    fn set_mode(&self, mode: QueueMode) {
        BufferQueue::set_mode(self, mode)
    }

    fn clear(&self) -> usize {
        BufferQueue::clear(self)
    }

    fn len(&self) -> usize {
        BufferQueue::len(self)
    }

    fn peak(&self) -> usize {
        BufferQueue::peak(self)
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
