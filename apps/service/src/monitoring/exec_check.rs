//! Checks delegated to external programs.
//!
//! The full response is written to a private temporary file whose path is
//! exported as `AVAIL_HTTP`; the program decides up (exit 0) or down (any
//! other exit code). The file is removed once the program is done.

use std::io::{self, Write};
use std::sync::Arc;

use tempfile::TempPath;
use tracing::{debug, warn};

use super::checker::{CheckError, Checker};
use super::raw::RawResponse;
use crate::exec::{Exec, ExecError, LineSink, split_command};

/// Environment variable naming the response file
pub const HTTP_ENV: &str = "AVAIL_HTTP";

const RESPONSE_FILE_PREFIX: &str = "avail-http-";

/// Runs a command and maps its exit code to up/down.
#[derive(Clone)]
pub struct ExecCheck {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    sink: Option<Arc<dyn LineSink>>,
}

impl ExecCheck {
    /// `command` is lexed with shell quoting rules.
    pub fn new(command: &str) -> Result<Self, ExecError> {
        let (program, args) = split_command(command)?;
        Ok(Self { program, args, stdin: None, sink: None })
    }

    /// Literal program and arguments.
    pub fn with_args(program: &str, args: &[String]) -> Result<Self, ExecError> {
        if program.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        Ok(Self { program: program.to_string(), args: args.to_vec(), stdin: None, sink: None })
    }

    pub fn from_config(command: &str, args: Option<&[String]>) -> Result<Self, ExecError> {
        match args {
            Some(args) => Self::with_args(command, args),
            None => Self::new(command),
        }
    }

    /// Forward the program's stdout and stderr lines to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    async fn run(&self, response_file: &TempPath) -> Result<i32, ExecError> {
        let mut builder = Exec::builder()
            .command(&self.program, self.args.iter().cloned())
            .env(HTTP_ENV, response_file.to_string_lossy());
        if let Some(input) = &self.stdin {
            builder = builder.stdin(input.clone());
        }
        if let Some(sink) = &self.sink {
            builder = builder.sink(sink.clone());
        }

        builder.build()?.run().await
    }
}

fn write_response_file(response: &RawResponse) -> io::Result<TempPath> {
    let mut file = tempfile::Builder::new().prefix(RESPONSE_FILE_PREFIX).tempfile()?;
    file.write_all(&response.to_wire())?;
    file.flush()?;
    Ok(file.into_temp_path())
}

#[async_trait::async_trait]
impl Checker for ExecCheck {
    async fn is_up(&self, response: &RawResponse) -> Result<bool, CheckError> {
        let response_file = write_response_file(response).map_err(CheckError::ResponseFile)?;

        // The file is also removed on drop if running fails or is cancelled
        let result = self.run(&response_file).await;
        let path = response_file.to_path_buf();
        if let Err(e) = response_file.close() {
            warn!("failed to remove {}: {}", path.display(), e);
        }

        let exit_code = result?;
        debug!(program = %self.program, exit_code, "check command finished");
        Ok(exit_code == 0)
    }
}

/// Runs a shell with the check script on its standard input.
#[derive(Clone)]
pub struct ShellCheck {
    inner: ExecCheck,
}

impl ShellCheck {
    /// `shell` is lexed with shell quoting rules, so `bash -e` works.
    pub fn new(shell: &str, script: &str) -> Result<Self, ExecError> {
        Ok(Self { inner: ExecCheck::new(shell)?.with_stdin(script) })
    }

    pub fn with_sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.inner = self.inner.with_sink(sink);
        self
    }
}

#[async_trait::async_trait]
impl Checker for ShellCheck {
    async fn is_up(&self, response: &RawResponse) -> Result<bool, CheckError> {
        self.inner.is_up(response).await
    }
}
