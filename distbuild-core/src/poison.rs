//! RAII guard against partial-write corruption on a framed connection.
//!
//! # The problem
//!
//! A `Connection::send` writes a length prefix followed by a payload as two
//! separate `write_all` calls. If a worker thread is interrupted mid-write
//! (panicking handler, killed I/O thread) the peer is left holding half a
//! frame with no way to resynchronize.
//!
//! # The solution
//!
//! `PoisonGuard` assumes failure on construction and only clears the flag
//! when `disarm()` is called after the *entire* write completes. If the
//! guard is dropped first — including via an early `?` return or a panic
//! unwind — the connection stays marked poisoned and must be torn down
//! rather than reused.
//!
//! ```
//! use distbuild_core::poison::PoisonGuard;
//!
//! struct Conn {
//!     poisoned: bool,
//! }
//!
//! impl Conn {
//!     fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
//!         if self.poisoned {
//!             return Err(std::io::Error::new(
//!                 std::io::ErrorKind::BrokenPipe,
//!                 "connection poisoned by a prior partial write",
//!             ));
//!         }
//!
//!         let guard = PoisonGuard::new(&mut self.poisoned);
//!         // ... write length prefix, then payload ...
//!         guard.disarm();
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Apply this to every multi-step write (length prefix + payload); reads
//! don't need it since a short read just means "not enough data yet".

/// A RAII guard that marks a connection poisoned unless explicitly disarmed.
pub struct PoisonGuard<'a> {
    flag: &'a mut bool,
}

impl<'a> PoisonGuard<'a> {
    /// Marks `flag` poisoned immediately; only `disarm()` clears it.
    #[inline]
    pub fn new(flag: &'a mut bool) -> Self {
        *flag = true;
        Self { flag }
    }

    /// Marks the guarded flag healthy. Call only once the whole write has
    /// landed successfully.
    #[inline]
    pub fn disarm(self) {
        *self.flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisons_on_drop() {
        let mut poisoned = false;
        {
            let _guard = PoisonGuard::new(&mut poisoned);
        }
        assert!(poisoned);
    }

    #[test]
    fn disarm_clears_poison() {
        let mut poisoned = false;
        {
            let guard = PoisonGuard::new(&mut poisoned);
            guard.disarm();
        }
        assert!(!poisoned);
    }

    #[test]
    fn early_drop_stays_poisoned() {
        let mut poisoned = false;
        {
            let guard = PoisonGuard::new(&mut poisoned);
            drop(guard);
        }
        assert!(poisoned);
    }
}
