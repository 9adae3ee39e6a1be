//! Single-instance lock
//!
//! A PID file published with a hard link, so the lock never exists without
//! its PID. A lock whose owner no longer exists is reclaimed; one without a
//! readable PID is reclaimed only once it is older than [`UNREADABLE_GRACE`].

use crate::error::{FocusError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Age after which a lock with no readable PID counts as abandoned
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

/// Held for the life of the engine process; removed on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Take the lock or report the live owner
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FocusError::Lock(format!("cannot create {}: {e}", parent.display())))?;
        }
        let pid = std::process::id();
        let staged = staged_path(&path, pid);
        // A leftover may still be linked to a published lock
        let _ = std::fs::remove_file(&staged);
        std::fs::write(&staged, format!("{pid}\n"))
            .and_then(|_| std::fs::File::open(&staged)?.sync_all())
            .map_err(|e| FocusError::Lock(format!("cannot write {}: {e}", staged.display())))?;

        let result = Self::publish(&path, &staged, pid);
        let _ = std::fs::remove_file(&staged);
        result
    }

    /// Link the staged PID file into place; second pass only after reclaiming
    fn publish(path: &Path, staged: &Path, pid: u32) -> Result<Self> {
        for _ in 0..2 {
            match std::fs::hard_link(staged, path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), pid, "Instance lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::owner(path) {
                        Some(owner) if process_alive(owner) => {
                            return Err(FocusError::AlreadyRunning { pid: owner });
                        }
                        None if !abandoned(path) => {
                            return Err(FocusError::Lock(format!(
                                "{} has no readable PID yet, another instance may be starting",
                                path.display()
                            )));
                        }
                        owner => {
                            tracing::warn!(path = %path.display(), ?owner, "Reclaiming stale instance lock");
                            std::fs::remove_file(path).map_err(|e| {
                                FocusError::Lock(format!("cannot remove stale {}: {e}", path.display()))
                            })?;
                        }
                    }
                }
                Err(e) => {
                    return Err(FocusError::Lock(format!("cannot create {}: {e}", path.display())));
                }
            }
        }
        Err(FocusError::Lock(format!(
            "lost the race for {} to another instance",
            path.display()
        )))
    }

    /// PID recorded in a lock file, if it parses
    pub fn owner(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Leave a lock some other process has since taken over
        if Self::owner(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
            tracing::debug!(path = %self.path.display(), "Instance lock released");
        }
    }
}

fn staged_path(path: &Path, pid: u32) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "focus-guard.lock".into());
    path.with_file_name(format!(".{name}.{pid}"))
}

/// Whether an unreadable lock has outlived the grace period
fn abandoned(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age >= UNREADABLE_GRACE)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
