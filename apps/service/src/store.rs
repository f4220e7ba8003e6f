//! On-disk state exchange between the daemon and status readers.
//!
//! Layout: `<runtime root>/<pid>/<title>/{latency,health}`. `latency` holds the
//! last round-trip time in milliseconds and is rewritten every cycle; `health`
//! holds `1` or `0` and is only rewritten when it changes. Every write goes to
//! a temporary sibling that is renamed over the target, so readers never see a
//! partially written file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime::RuntimeDir;

pub const LATENCY_FILE: &str = "latency";
pub const HEALTH_FILE: &str = "health";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no running daemon with PID {pid} found (missing {})", .path.display())]
    NoSuchDaemon { pid: u32, path: PathBuf },
    #[error("no state published for target \"{title}\"")]
    UnknownTarget { title: String },
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("I/O failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed {} contents: {value:?}", .path.display())]
    Malformed { path: PathBuf, value: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// State published by one daemon instance.
#[derive(Debug, Clone)]
pub struct StateStore {
    pid: u32,
    root: PathBuf,
}

/// Latest published values of one target. `None` means the daemon has not
/// written that value yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub title: String,
    pub latency_ms: Option<i64>,
    pub healthy: Option<bool>,
}

impl StateStore {
    pub fn new(runtime: &RuntimeDir, pid: u32) -> Self {
        Self { pid, root: runtime.pid_dir(pid) }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the directory of `title`.
    pub fn create_target(&self, title: &str) -> Result<TargetDir, StoreError> {
        let path = self.root.join(title);
        match fs::metadata(&path) {
            Ok(meta) if !meta.is_dir() => return Err(StoreError::NotADirectory(path)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&path).map_err(io_error(&path))?;
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        Ok(TargetDir { path })
    }

    /// Remove the whole per-PID root. A missing root is not an error.
    pub fn remove_all(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path: self.root.clone(), source }),
        }
    }

    /// Titles with a published directory, sorted.
    pub fn titles(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NoSuchDaemon { pid: self.pid, path: self.root.clone() });
            }
            Err(source) => return Err(StoreError::Io { path: self.root.clone(), source }),
        };

        let mut titles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.root))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                titles.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        titles.sort();
        Ok(titles)
    }

    /// Read the latest values of `title`.
    pub fn read(&self, title: &str) -> Result<TargetStatus, StoreError> {
        let dir = self.root.join(title);
        if !dir.is_dir() {
            if !self.root.is_dir() {
                return Err(StoreError::NoSuchDaemon { pid: self.pid, path: self.root.clone() });
            }
            return Err(StoreError::UnknownTarget { title: title.to_string() });
        }

        let latency_ms = read_value(&dir.join(LATENCY_FILE), |raw| raw.parse::<i64>().ok())?;
        let healthy = read_value(&dir.join(HEALTH_FILE), |raw| raw.parse::<i64>().ok().map(|h| h != 0))?;

        Ok(TargetStatus { title: title.to_string(), latency_ms, healthy })
    }
}

fn read_value<T>(path: &Path, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };
    let trimmed = raw.trim();
    parse(trimmed)
        .map(Some)
        .ok_or_else(|| StoreError::Malformed { path: path.to_path_buf(), value: trimmed.to_string() })
}

/// Replace `dir/name` with `contents` in one rename.
fn write_atomic(dir: &Path, name: &str, contents: &str) -> Result<(), StoreError> {
    let target = dir.join(name);
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .tempfile_in(dir)
        .map_err(io_error(&target))?;
    tmp.write_all(contents.as_bytes()).map_err(io_error(&target))?;
    set_readable(&tmp).map_err(io_error(&target))?;
    tmp.persist(&target).map_err(|e| StoreError::Io { path: target.clone(), source: e.error })?;
    Ok(())
}

#[cfg(unix)]
fn set_readable(file: &NamedTempFile) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.as_file().set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_readable(_file: &NamedTempFile) -> io::Result<()> {
    Ok(())
}

/// Directory owned by a single probe.
#[derive(Debug)]
pub struct TargetDir {
    path: PathBuf,
}

impl TargetDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_latency(&self, latency_ms: i64) -> Result<(), StoreError> {
        write_atomic(&self.path, LATENCY_FILE, &format!("{latency_ms}\n"))
    }

    pub fn write_health(&self, healthy: bool) -> Result<(), StoreError> {
        write_atomic(&self.path, HEALTH_FILE, if healthy { "1\n" } else { "0\n" })
    }

    /// Remove the directory and everything in it; failures are only logged.
    pub fn remove(&self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(&RuntimeDir::new(dir), 4242)
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let target = store.create_target("example").unwrap();

        target.write_latency(123).unwrap();
        target.write_health(true).unwrap();

        assert_eq!(fs::read_to_string(target.path().join(LATENCY_FILE)).unwrap(), "123\n");
        assert_eq!(fs::read_to_string(target.path().join(HEALTH_FILE)).unwrap(), "1\n");
        assert_eq!(
            store.read("example").unwrap(),
            TargetStatus { title: "example".into(), latency_ms: Some(123), healthy: Some(true) }
        );

        target.write_health(false).unwrap();
        assert_eq!(store.read("example").unwrap().healthy, Some(false));
    }

    #[test]
    fn test_layout_is_keyed_by_pid() {
        let dir = tempdir().unwrap();
        let target = store(dir.path()).create_target("example").unwrap();
        assert_eq!(target.path(), dir.path().join("4242").join("example"));
    }

    #[test]
    fn test_writes_leave_no_temp_files() {
        let dir = tempdir().unwrap();
        let target = store(dir.path()).create_target("example").unwrap();
        for latency in 0..20 {
            target.write_latency(latency).unwrap();
        }
        target.write_health(true).unwrap();

        let mut names: Vec<_> = fs::read_dir(target.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![HEALTH_FILE.to_string(), LATENCY_FILE.to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_files_are_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let target = store(dir.path()).create_target("example").unwrap();
        target.write_latency(1).unwrap();

        let mode = fs::metadata(target.path().join(LATENCY_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_pending_values() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let target = store.create_target("fresh").unwrap();

        assert_eq!(store.read("fresh").unwrap().latency_ms, None);
        target.write_latency(5).unwrap();
        let status = store.read("fresh").unwrap();
        assert_eq!(status.latency_ms, Some(5));
        assert_eq!(status.healthy, None);
    }

    #[test]
    fn test_titles_and_missing_daemon() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(matches!(store.titles(), Err(StoreError::NoSuchDaemon { pid: 4242, .. })));
        assert!(matches!(store.read("x"), Err(StoreError::NoSuchDaemon { .. })));

        store.create_target("b").unwrap();
        store.create_target("a").unwrap();
        fs::write(store.root().join("stray-file"), "x").unwrap();

        assert_eq!(store.titles().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(store.read("c"), Err(StoreError::UnknownTarget { .. })));
    }

    #[test]
    fn test_malformed_values() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let target = store.create_target("x").unwrap();
        fs::write(target.path().join(LATENCY_FILE), "fast\n").unwrap();
        assert!(matches!(store.read("x"), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn test_create_target_rejects_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("taken"), "x").unwrap();
        assert!(matches!(store.create_target("taken"), Err(StoreError::NotADirectory(_))));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let target = store.create_target("x").unwrap();
        target.write_latency(1).unwrap();

        target.remove();
        assert!(!target.path().exists());
        target.remove();

        store.remove_all().unwrap();
        assert!(!store.root().exists());
        store.remove_all().unwrap();
    }
}
