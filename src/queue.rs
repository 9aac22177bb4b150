//! Owned, mutex-guarded FIFO queues handing connection requests between
//! pipeline stages. Waking is broadcast so a rapidly refilled queue cannot
//! stall a subset of a worker pool.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

pub struct ConnQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> Default for ConnQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConnQueue<T> {
    pub fn new() -> Self {
        ConnQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append at the tail; FIFO order within the queue.
    pub fn push_back(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        self.cond.notify_all();
    }

    /// Insert at the head (used for the bad-request queue, where drain
    /// order does not matter and head insertion is cheapest).
    pub fn push_front(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.items.push_front(item);
        self.cond.notify_all();
    }

    /// Remove from the head, blocking while empty. Returns `None` only
    /// after `shutdown` with the queue drained.
    pub fn pop_wait(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.shutdown {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Non-blocking drain of everything currently queued.
    pub fn try_drain(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        inner.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter; subsequent `pop_wait` calls drain whatever is
    /// left and then return `None`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.cond.notify_all();
    }
}
