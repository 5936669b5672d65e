//! A fixed-size pool of OS threads pulling jobs off a `LockedQueue`.
//!
//! Absorber compile workers and Emitter local-compile workers are both built
//! from this: `N` threads call `pop()` in a loop and run whatever closure is
//! handed to them, until `shutdown()` closes the queue out from under them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::locked_queue::LockedQueue;

/// A pool of worker threads that pop jobs from a shared `LockedQueue` and
/// run them with `handler`.
pub struct WorkerPool<T> {
    queue: Arc<LockedQueue<T>>,
    handles: Vec<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `count` threads, each looping `queue.pop()` and invoking
    /// `handler(item, &shutting_down)` until the queue closes.
    ///
    /// `handler` receives a shared shutdown flag so long-running jobs (a
    /// compile) can check it between steps and bail out early.
    pub fn new<F>(queue: Arc<LockedQueue<T>>, count: usize, handler: F) -> Self
    where
        F: Fn(T, &AtomicBool) + Send + Sync + 'static,
    {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);
        let mut handles = Vec::with_capacity(count);

        for worker_idx in 0..count {
            let queue = queue.clone();
            let handler = handler.clone();
            let shutting_down = shutting_down.clone();
            let handle = thread::Builder::new()
                .name(format!("distbuild-worker-{worker_idx}"))
                .spawn(move || {
                    while let Some(item) = queue.pop() {
                        handler(item, &shutting_down);
                    }
                })
                .expect("spawning a worker thread");
            handles.push(handle);
        }

        Self {
            queue,
            handles,
            shutting_down,
        }
    }

    /// Close the queue, wake every idle worker, and join them all.
    ///
    /// In-flight jobs are signalled via `shutting_down` but are not
    /// interrupted; this call blocks until every worker returns from its
    /// current job.
    pub fn shutdown(mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.queue.close();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn processes_all_queued_jobs() {
        let queue = Arc::new(LockedQueue::<i32>::new(16));
        let total = Arc::new(AtomicUsize::new(0));
        let total2 = total.clone();

        for i in 0..10 {
            queue.push(i);
        }

        let pool = WorkerPool::new(queue.clone(), 4, move |item, _shutting_down| {
            total2.fetch_add(item as usize, Ordering::SeqCst);
        });

        // Give workers time to drain, then shut down cleanly.
        thread::sleep(Duration::from_millis(100));
        pool.shutdown();

        assert_eq!(total.load(Ordering::SeqCst), (0..10).sum());
    }

    #[test]
    fn shutdown_wakes_idle_workers() {
        let queue = Arc::new(LockedQueue::<i32>::new(4));
        let pool = WorkerPool::new(queue, 2, |_item, _shutting_down| {});
        pool.shutdown();
    }
}
