//! Subprocess execution with optional stdin input and line-oriented output
//! forwarding.
//!
//! There is no built-in timeout. The child and everything it started are
//! killed when the future returned by [`Exec::run`] is dropped, so callers
//! bound execution with their own deadline or cancellation.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

/// How long to keep draining output after the child exited. A grandchild that
/// inherited the pipes can keep them open forever.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,
    #[error("unbalanced quoting in command: {0}")]
    Lex(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which output stream a forwarded line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives subprocess output one line at a time.
pub trait LineSink: Send + Sync {
    fn line(&self, stream: Stream, line: &str);
}

/// Forwards subprocess output to the log, prefixed with a label.
#[derive(Debug, Clone)]
pub struct TracingSink {
    label: String,
}

impl TracingSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl LineSink for TracingSink {
    fn line(&self, stream: Stream, line: &str) {
        info!("{} [{}]: {}", self.label, stream, line);
    }
}

/// Split a command line with shell quoting rules.
pub fn split_command(command: &str) -> Result<(String, Vec<String>), ExecError> {
    let mut parts = shlex::split(command).ok_or_else(|| ExecError::Lex(command.to_string()))?;
    if parts.is_empty() {
        return Err(ExecError::EmptyCommand);
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Builder for [`Exec`]
#[derive(Default)]
pub struct ExecBuilder {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    sink: Option<Arc<dyn LineSink>>,
}

impl ExecBuilder {
    /// Literal program and arguments, no lexing.
    pub fn command<I, S>(mut self, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Program and arguments lexed from a single command line.
    pub fn shell_words(mut self, command: &str) -> Result<Self, ExecError> {
        let (program, args) = split_command(command)?;
        self.program = program;
        self.args = args;
        Ok(self)
    }

    /// Add an environment variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's standard input.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Receive stdout and stderr lines. Without a sink both are discarded.
    pub fn sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Exec, ExecError> {
        if self.program.is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        Ok(Exec {
            program: self.program,
            args: self.args,
            env: self.env,
            stdin: self.stdin,
            sink: self.sink,
        })
    }
}

/// A ready-to-run subprocess description.
pub struct Exec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    sink: Option<Arc<dyn LineSink>>,
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Exec {
    pub fn builder() -> ExecBuilder {
        ExecBuilder::default()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run to completion and return the exit code.
    ///
    /// A process terminated by a signal reports `-1`. The child leads its own
    /// process group; dropping the returned future before the child exits
    /// kills the whole group, including anything the child started.
    pub async fn run(&self) -> Result<i32, ExecError> {
        let piped = |enabled: bool| if enabled { Stdio::piped() } else { Stdio::null() };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(piped(self.stdin.is_some()))
            .stdout(piped(self.sink.is_some()))
            .stderr(piped(self.sink.is_some()))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecError::Spawn { program: self.program.clone(), source })?;
        debug!(program = %self.program, pid = ?child.id(), "spawned subprocess");
        let mut guard = RunGuard { group: child.id(), forwarders: Vec::new(), armed: true };

        // Fed from its own task so a child that never reads stdin cannot block us
        if let (Some(input), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            let program = self.program.clone();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(%program, "stdin not fully consumed: {}", e);
                }
            });
        }

        let mut forwarders = Vec::new();
        if let Some(sink) = &self.sink {
            if let Some(stdout) = child.stdout.take() {
                forwarders.push(forward_lines(Stream::Stdout, stdout, sink.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                forwarders.push(forward_lines(Stream::Stderr, stderr, sink.clone()));
            }
        }
        guard.forwarders = forwarders.iter().map(JoinHandle::abort_handle).collect();

        let status = child
            .wait()
            .await
            .map_err(|source| ExecError::Wait { program: self.program.clone(), source })?;
        guard.armed = false;

        for forwarder in forwarders {
            match tokio::time::timeout(OUTPUT_DRAIN_GRACE, forwarder).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(program = %self.program, "output forwarder failed: {}", e),
                Err(_) => debug!(program = %self.program, "output still open after exit"),
            }
        }

        Ok(status.code().unwrap_or(-1))
    }
}

/// Cleanup for an [`Exec::run`] call. Output forwarders are always stopped;
/// the process group is only killed while the child has not been waited for.
struct RunGuard {
    group: Option<u32>,
    forwarders: Vec<AbortHandle>,
    armed: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        if let (true, Some(group)) = (self.armed, self.group) {
            kill_group(group);
        }
    }
}

#[cfg(unix)]
fn kill_group(group: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(group) else { return };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(group, "killed subprocess group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(group, "failed to kill subprocess group: {}", e),
    }
}

/// Only the direct child is killed, through `kill_on_drop`.
#[cfg(not(unix))]
fn kill_group(_group: u32) {}

fn forward_lines<R>(stream: Stream, reader: R, sink: Arc<dyn LineSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.line(stream, &line),
                Ok(None) => break,
                Err(e) => {
                    debug!(%stream, "stopped reading subprocess output: {}", e);
                    break;
                }
            }
        }
    })
}
