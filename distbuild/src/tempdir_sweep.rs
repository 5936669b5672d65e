//! Startup cleanup for ephemeral compile directories.
//!
//! Absorber and Emitter workers each run under a `/tmp/clangd-<pid>-XXXXXX`
//! directory created with `tempfile`, which removes it on drop — except a
//! SIGKILL'd process skips drop glue entirely and leaks the directory. This
//! scans `/tmp` once at startup and removes any `clangd-<pid>-*` entry whose
//! owning pid is no longer alive, addressing the crash-cleanup open question
//! the reference runtime's process-lifetime RAII directories leave open.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Removes orphaned `clangd-<pid>-*` directories under `tmp_dir` left behind
/// by a process that no longer exists. Returns the number removed.
#[must_use]
pub fn sweep(tmp_dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(tmp_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(pid) = parse_owner_pid(name) else { continue };
        if pid_is_alive(pid) {
            continue;
        }
        let path = entry.path();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(?path, pid, "removed orphaned temp directory");
                removed += 1;
            }
            Err(err) => warn!(?path, %err, "failed to remove orphaned temp directory"),
        }
    }
    removed
}

/// Parses `clangd-<pid>-<rand>` into the pid component.
fn parse_owner_pid(name: &str) -> Option<i32> {
    let rest = name.strip_prefix("clangd-")?;
    let (pid, _) = rest.split_once('-')?;
    pid.parse().ok()
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(pid: i32) -> bool {
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pid_from_directory_name() {
        assert_eq!(parse_owner_pid("clangd-4821-ab12cd"), Some(4821));
        assert_eq!(parse_owner_pid("clangd-notapid-ab12cd"), None);
        assert_eq!(parse_owner_pid("unrelated"), None);
    }

    #[test]
    fn sweep_removes_dead_pid_directory_and_keeps_live_one() {
        let dir = tempfile::tempdir().unwrap();
        let dead_pid_dir = dir.path().join("clangd-999999999-abc");
        let live_pid_dir = dir.path().join(format!("clangd-{}-abc", std::process::id()));
        fs::create_dir(&dead_pid_dir).unwrap();
        fs::create_dir(&live_pid_dir).unwrap();

        let removed = sweep(dir.path());

        assert_eq!(removed, 1);
        assert!(!dead_pid_dir.exists());
        assert!(live_pid_dir.exists());
    }
}
