//! Bounded, closable, observable MPMC queue used to hand work from the
//! `EventLoop` thread to a `WorkerPool`.
//!
//! Unlike a channel, `close()` is an explicit, idempotent operation: once
//! closed, `pop` drains whatever is left and then returns `None` forever,
//! and `push` always fails. An optional observer is invoked under the same
//! lock on every push, pop, and close so a caller can track queue depth
//! without a second round of synchronization.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Notified on every push/pop/close. Must not touch the queue it is
/// attached to from inside `observe` — that would deadlock.
pub trait LockedQueueObserver<T>: Send + Sync {
    fn observe(&self, item: Option<&T>, closed: bool);
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A bounded, thread-safe queue with blocking push/pop and explicit close.
pub struct LockedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    observer: Option<Arc<dyn LockedQueueObserver<T>>>,
}

impl<T> LockedQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_observer(capacity, None)
    }

    #[must_use]
    pub fn with_observer(capacity: usize, observer: Option<Arc<dyn LockedQueueObserver<T>>>) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            observer,
        }
    }

    /// Push an item, blocking while the queue is at capacity.
    ///
    /// Returns `false` if the queue was already closed (the item is
    /// dropped); `true` if the push succeeded.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                if let Some(obs) = &self.observer {
                    obs.observe(None, true);
                }
                return false;
            }
            if state.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut state);
        }
        state.items.push_back(item);
        if let Some(obs) = &self.observer {
            obs.observe(state.items.back(), false);
        }
        self.not_empty.notify_one();
        true
    }

    /// Pop the next item, blocking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                if let Some(obs) = &self.observer {
                    obs.observe(None, false);
                }
                return Some(item);
            }
            if state.closed {
                if let Some(obs) = &self.observer {
                    obs.observe(None, true);
                }
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Push an item without blocking. Returns the item back if the queue is
    /// closed or already at capacity, for a caller (the Absorber answering
    /// with `Overloaded`) that needs to try something else immediately
    /// rather than wait for room.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        if let Some(obs) = &self.observer {
            obs.observe(state.items.back(), false);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Close the queue. Idempotent. Wakes every blocked pusher and popper.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(obs) = &self.observer {
            obs.observe(None, true);
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Close the queue and return every item still buffered, atomically
    /// with the close. No concurrent `pop()` can observe these items: the
    /// lock is held across both the close and the drain, and a popper
    /// blocked on the condvar wakes to find the queue closed and empty.
    /// Used for graceful shutdown, where leftover items need an answer
    /// without being run.
    pub fn close_and_drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        let drained: Vec<T> = state.items.drain(..).collect();
        if let Some(obs) = &self.observer {
            obs.observe(None, true);
        }
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
        drained
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_pop_fifo() {
        let q: LockedQueue<i32> = LockedQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn close_drains_then_returns_none() {
        let q: LockedQueue<i32> = LockedQueue::new(4);
        q.push(1);
        q.push(2);
        q.close();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
        assert!(!q.push(3));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let q = Arc::new(LockedQueue::<i32>::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }

    struct CountObserver(AtomicUsize);
    impl LockedQueueObserver<i32> for CountObserver {
        fn observe(&self, _item: Option<&i32>, _closed: bool) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observer_invoked_on_every_transition() {
        let observer = Arc::new(CountObserver(AtomicUsize::new(0)));
        let q: LockedQueue<i32> = LockedQueue::with_observer(4, Some(observer.clone()));
        q.push(1);
        q.pop();
        q.close();
        assert_eq!(observer.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn try_push_rejects_when_full() {
        let q: LockedQueue<i32> = LockedQueue::new(1);
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
        assert_eq!(q.pop(), Some(1));
        assert!(q.try_push(3).is_ok());
    }

    #[test]
    fn close_and_drain_returns_buffered_items_only_once() {
        let q: LockedQueue<i32> = LockedQueue::new(4);
        q.push(1);
        q.push(2);
        assert_eq!(q.close_and_drain(), vec![1, 2]);
        assert_eq!(q.pop(), None);
        assert_eq!(q.close_and_drain(), Vec::<i32>::new());
    }

    #[test]
    fn try_push_rejects_when_closed() {
        let q: LockedQueue<i32> = LockedQueue::new(4);
        q.close();
        assert_eq!(q.try_push(1), Err(1));
    }

    #[test]
    fn blocks_when_full_until_pop() {
        let q = Arc::new(LockedQueue::<i32>::new(1));
        assert!(q.push(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.push(2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop(), Some(1));
        assert!(handle.join().unwrap());
        assert_eq!(q.pop(), Some(2));
    }
}
