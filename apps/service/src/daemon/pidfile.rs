//! Single-instance guard. The PID file is only overwritten when the process
//! it names is gone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::DaemonError;

/// Result of probing a process id without affecting the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    NotFound,
    /// The process exists but belongs to someone we may not signal
    Inaccessible,
}

#[cfg(unix)]
pub fn liveness(pid: u32) -> Liveness {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and negative values address process groups
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Liveness::NotFound,
    };

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::NotFound,
        Err(Errno::EPERM) => Liveness::Inaccessible,
        Err(e) => {
            warn!(pid, "unexpected liveness probe failure: {}", e);
            Liveness::Inaccessible
        }
    }
}

/// Without a way to probe, never assume the owner is gone.
#[cfg(not(unix))]
pub fn liveness(_pid: u32) -> Liveness {
    Liveness::Inaccessible
}

/// Read the PID stored in `path`.
pub fn read_pid(path: &Path) -> Result<u32, DaemonError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| DaemonError::Io { path: path.to_path_buf(), source })?;
    let trimmed = raw.trim();
    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(DaemonError::PidFileMalformed {
            path: path.to_path_buf(),
            content: trimmed.to_string(),
        }),
    }
}

/// A PID file written by this process.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for `pid`, refusing when another live process holds it.
    pub fn acquire(path: &Path, pid: u32) -> Result<Self, DaemonError> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(DaemonError::PidFileIsDirectory(path.to_path_buf()));
            }
            Ok(_) => {
                warn!("PID file already exists: {}", path.display());
                let existing = read_pid(path)?;
                match liveness(existing) {
                    Liveness::Alive => {
                        return Err(DaemonError::AlreadyRunning {
                            pid: existing,
                            path: path.to_path_buf(),
                        });
                    }
                    Liveness::Inaccessible => {
                        return Err(DaemonError::PidInaccessible {
                            pid: existing,
                            path: path.to_path_buf(),
                        });
                    }
                    Liveness::NotFound => {
                        info!(stale_pid = existing, "overwriting stale PID file");
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(DaemonError::Io { path: path.to_path_buf(), source }),
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| DaemonError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(path, format!("{pid}\n"))
            .map_err(|source| DaemonError::Io { path: path.to_path_buf(), source })?;

        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file; failures are logged and otherwise ignored.
    pub fn release(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove PID file {}: {}", self.path.display(), e);
        }
    }
}
