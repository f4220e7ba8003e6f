//! The monitoring daemon: PID lock, probe construction and supervision.

mod pidfile;

pub use pidfile::{Liveness, PidFile, liveness, read_pid};

use std::io;
use std::path::PathBuf;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::monitoring::{Probe, ProbeError};
use crate::runtime::RuntimeDir;
use crate::store::StateStore;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already running with PID {pid} (PID file {})", .path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },
    #[error("PID {pid} from {} exists but cannot be inspected", .path.display())]
    PidInaccessible { pid: u32, path: PathBuf },
    #[error("PID file path is a directory: {}", .0.display())]
    PidFileIsDirectory(PathBuf),
    #[error("malformed PID file {}: {content:?}", .path.display())]
    PidFileMalformed { path: PathBuf, content: String },
    #[error("I/O failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

pub struct Daemon {
    config: Config,
    runtime: RuntimeDir,
    pid: u32,
}

impl Daemon {
    pub fn new(config: Config, runtime: RuntimeDir) -> Self {
        Self { config, runtime, pid: std::process::id() }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pid_file(&self) -> PathBuf {
        self.config.pid_file(&self.runtime)
    }

    /// Probe every configured target until `cancel` fires.
    ///
    /// Returns once every probe has stopped and the PID file and state root
    /// have been removed. Nothing is probed when the PID lock cannot be taken
    /// or any target fails to build.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let pid_file = PidFile::acquire(&self.pid_file(), self.pid)?;
        let store = StateStore::new(&self.runtime, self.pid);
        info!(pid = self.pid, "PID file written to {}", pid_file.path().display());

        let probes = match self.build_probes(&store) {
            Ok(probes) => probes,
            Err(e) => {
                cleanup(pid_file, &store);
                return Err(e);
            }
        };

        if probes.is_empty() {
            warn!("no targets configured");
        }
        info!(
            targets = probes.len(),
            "publishing state under {}",
            store.root().display()
        );

        let handles: Vec<_> = probes
            .into_iter()
            .map(|probe| tokio::spawn(probe.run(cancel.clone())))
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("probe task failed: {}", e);
            }
        }

        cleanup(pid_file, &store);
        info!("daemon stopped");
        Ok(())
    }

    fn build_probes(&self, store: &StateStore) -> Result<Vec<Probe>, DaemonError> {
        let targets = self.config.resolve_targets()?;
        let mut probes = Vec::with_capacity(targets.len());
        for target in targets {
            probes.push(Probe::from_target(target, store)?);
        }
        Ok(probes)
    }
}

fn cleanup(pid_file: PidFile, store: &StateStore) {
    pid_file.release();
    if let Err(e) = store.remove_all() {
        warn!("failed to remove state directory: {}", e);
    }
}
