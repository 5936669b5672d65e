//! Wires SIGINT/SIGTERM to every running role's `ShutdownHandle`, so
//! `distbuildd` exits cleanly — in-flight compiles finish, queued work is
//! rejected, the event loop and worker threads join — rather than leaving
//! sockets and temp directories behind.

use distbuild_core::event_loop::ShutdownHandle;
use tracing::info;

/// Installs a process-wide signal handler that shuts down every handle in
/// `handles` on the first SIGINT/SIGTERM.
///
/// # Errors
///
/// Returns an error if a handler is already installed (`ctrlc` only allows
/// one per process).
pub fn install(handles: Vec<ShutdownHandle>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        for handle in &handles {
            let _ = handle.shutdown();
        }
    })
}
