// Process markers
//
// Every live process belonging to a workflow run (the run itself and each
// tool it spawns) has an empty file named after its pid in the workflow's
// `pids/` directory. The directory is the only record of what is running,
// and cancellation signals whatever it lists.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::InvocationError;

/// How forcefully to stop marked processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

/// The marker directory of one workflow
#[derive(Debug, Clone)]
pub struct ProcessMarkers {
    dir: PathBuf,
}

/// Removes its marker when dropped
#[derive(Debug)]
pub struct MarkerGuard {
    path: PathBuf,
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove process marker {:?}: {}", self.path, e);
            }
        }
    }
}

impl ProcessMarkers {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the marker for `pid`; it stays until removed explicitly
    pub fn touch(&self, pid: u32) -> Result<PathBuf, InvocationError> {
        fs::create_dir_all(&self.dir).map_err(|source| InvocationError::Marker {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(pid.to_string());
        fs::write(&path, b"").map_err(|source| InvocationError::Marker {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Create the marker for `pid`, removed again when the guard drops
    pub fn record(&self, pid: u32) -> Result<MarkerGuard, InvocationError> {
        let path = self.touch(pid)?;
        Ok(MarkerGuard { path })
    }

    /// Remove the marker for `pid` if present
    pub fn remove(&self, pid: u32) {
        let _ = fs::remove_file(self.dir.join(pid.to_string()));
    }

    /// Pids with a marker
    pub fn pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Whether any marker exists
    pub fn any(&self) -> bool {
        !self.pids().is_empty()
    }

    /// Drop markers whose process no longer exists
    pub fn prune_dead(&self) {
        for pid in self.pids() {
            if !process_alive(pid) {
                tracing::debug!("Removing stale process marker {}", pid);
                self.remove(pid);
            }
        }
    }

    /// Signal every marked process, then remove the marker directory.
    /// Returns how many processes were signaled.
    pub fn terminate_all(&self, how: Termination) -> usize {
        let own_pid = std::process::id();
        let mut signaled = 0;
        for pid in self.pids() {
            if pid == own_pid {
                continue;
            }
            match send_termination(pid, how) {
                Ok(()) => signaled += 1,
                Err(e) => tracing::debug!("Could not signal process {}: {}", pid, e),
            }
        }
        if let Err(e) = crate::utils::remove_dir_if_exists(&self.dir) {
            tracing::warn!("Failed to remove marker directory {:?}: {}", self.dir, e);
        }
        signaled
    }

    /// Remove the marker directory without signaling anything
    pub fn clear(&self) {
        if let Err(e) = crate::utils::remove_dir_if_exists(&self.dir) {
            tracing::warn!("Failed to remove marker directory {:?}: {}", self.dir, e);
        }
    }
}

#[cfg(unix)]
fn send_termination(pid: u32, how: Termination) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let pid = i32::try_from(pid).map_err(|e| e.to_string())?;
    kill(Pid::from_raw(pid), signal).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn send_termination(pid: u32, _how: Termination) -> Result<(), String> {
    Err(format!("signaling process {} is not supported on this platform", pid))
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_marker() {
        let temp_dir = TempDir::new().unwrap();
        let markers = ProcessMarkers::new(temp_dir.path().join("pids"));
        assert!(!markers.any());

        let guard = markers.record(4242).unwrap();
        markers.touch(17).unwrap();
        assert_eq!(markers.pids(), vec![17, 4242]);

        drop(guard);
        assert_eq!(markers.pids(), vec![17]);
    }

    #[test]
    fn test_guard_tolerates_cleared_directory() {
        let temp_dir = TempDir::new().unwrap();
        let markers = ProcessMarkers::new(temp_dir.path().join("pids"));
        let guard = markers.record(99).unwrap();
        markers.clear();
        drop(guard);
        assert!(!markers.any());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_all_kills_marked_processes() {
        let temp_dir = TempDir::new().unwrap();
        let markers = ProcessMarkers::new(temp_dir.path().join("pids"));

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        markers.touch(child.id()).unwrap();

        assert_eq!(markers.terminate_all(Termination::Forced), 1);
        assert!(!markers.dir().exists());

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_prune_dead_markers() {
        let temp_dir = TempDir::new().unwrap();
        let markers = ProcessMarkers::new(temp_dir.path().join("pids"));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        markers.touch(pid).unwrap();
        markers.touch(std::process::id()).unwrap();
        markers.prune_dead();
        assert_eq!(markers.pids(), vec![std::process::id()]);
    }
}
