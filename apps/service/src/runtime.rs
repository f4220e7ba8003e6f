//! Location of transient, process-scoped daemon state (PID file and the
//! per-PID state store).

use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "avail";
const PID_FILE_NAME: &str = "main.pid";

/// Writable directory holding everything a running daemon publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    /// Use an explicit root, e.g. from the command line or the config file.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Pick the platform and privilege appropriate location.
    ///
    /// Privileged processes use `/var/run/avail`. Other users get
    /// `$XDG_RUNTIME_DIR/avail`, then `/var/run/user/<uid>/avail` when that
    /// directory exists, and finally a directory under the system temp dir.
    #[cfg(unix)]
    pub fn resolve() -> Self {
        let uid = nix::unistd::geteuid();
        if uid.is_root() {
            return Self::new(Path::new("/var/run").join(APP_DIR));
        }

        if let Some(runtime) = env::var_os("XDG_RUNTIME_DIR").filter(|dir| !dir.is_empty()) {
            return Self::new(PathBuf::from(runtime).join(APP_DIR));
        }

        let per_user = Path::new("/var/run/user").join(uid.as_raw().to_string());
        if per_user.is_dir() {
            return Self::new(per_user.join(APP_DIR));
        }

        Self::new(env::temp_dir().join(format!("{APP_DIR}-{}", uid.as_raw())))
    }

    /// `%LOCALAPPDATA%\avail`, or the temp dir when it is not set.
    #[cfg(not(unix))]
    pub fn resolve() -> Self {
        let base = env::var_os("LOCALAPPDATA")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        Self::new(base.join(APP_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// State root of the daemon running as `pid`
    pub fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    pub fn default_pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let runtime = RuntimeDir::new("/run/test");
        assert_eq!(runtime.root(), Path::new("/run/test"));
        assert_eq!(runtime.pid_dir(4242), PathBuf::from("/run/test/4242"));
        assert_eq!(runtime.default_pid_file(), PathBuf::from("/run/test/main.pid"));
    }

    #[test]
    fn test_resolve_ends_in_app_dir() {
        let runtime = RuntimeDir::resolve();
        let name = runtime.root().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(APP_DIR), "unexpected runtime dir {}", runtime.root().display());
    }
}
