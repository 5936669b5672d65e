//! Byte-based write backpressure for `Connection`.
//!
//! Flow control is sized in bytes, not message count: one large compile
//! result streaming to a peer should not block an unrelated small frame
//! from being queued on a different connection, so each `Connection` tracks
//! its own outstanding write-queue depth rather than sharing a process-wide
//! semaphore.
//!
//! `Connection::send` checks `WriteBudget::try_reserve` before enqueuing a
//! frame; once the queued byte count created by prior `reserve`s exceeds
//! `write_high_watermark_bytes`, new sends fail fast with
//! `Error::Backpressure` instead of growing the queue without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Tracks outstanding write-queue bytes for one connection.
#[derive(Debug, Clone)]
pub struct WriteBudget {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queued: AtomicUsize,
    watermark: usize,
}

impl WriteBudget {
    #[must_use]
    pub fn new(watermark: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queued: AtomicUsize::new(0),
                watermark,
            }),
        }
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn watermark(&self) -> usize {
        self.inner.watermark
    }

    /// Reserve `n_bytes` of queue space, returning a guard that releases them
    /// on drop (i.e. once the write pump has flushed the frame).
    ///
    /// # Errors
    ///
    /// Returns `Error::Backpressure` if reserving would push the queue past
    /// the watermark. The caller already holding frames queued is allowed to
    /// exceed the watermark by a single frame-worth of slack, since rejecting
    /// a frame that already started serialization would lose data; it is
    /// the *next* reservation that gets rejected.
    pub fn try_reserve(&self, n_bytes: usize) -> Result<WriteReservation> {
        let prior = self.inner.queued.fetch_add(n_bytes, Ordering::AcqRel);
        if prior > self.inner.watermark {
            self.inner.queued.fetch_sub(n_bytes, Ordering::AcqRel);
            return Err(Error::Backpressure {
                queued: prior,
                watermark: self.inner.watermark,
            });
        }
        Ok(WriteReservation {
            budget: self.clone(),
            n_bytes,
        })
    }
}

/// RAII reservation; releases its byte count back to the budget on drop.
#[derive(Debug)]
pub struct WriteReservation {
    budget: WriteBudget,
    n_bytes: usize,
}

impl Drop for WriteReservation {
    fn drop(&mut self) {
        self.budget.inner.queued.fetch_sub(self.n_bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_under_watermark() {
        let budget = WriteBudget::new(1024);
        let r = budget.try_reserve(512).unwrap();
        assert_eq!(budget.queued(), 512);
        drop(r);
        assert_eq!(budget.queued(), 0);
    }

    #[test]
    fn rejects_over_watermark() {
        let budget = WriteBudget::new(1024);
        let _r1 = budget.try_reserve(1025).unwrap(); // first frame always admitted
        let err = budget.try_reserve(1).unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));
    }

    #[test]
    fn release_allows_further_reservation() {
        let budget = WriteBudget::new(100);
        let r1 = budget.try_reserve(90).unwrap();
        assert!(budget.try_reserve(50).is_err());
        drop(r1);
        assert!(budget.try_reserve(50).is_ok());
    }
}
