use std::sync::Arc;

use thiserror::Error;

use super::exec_check::{ExecCheck, ShellCheck};
use super::raw::RawResponse;
use crate::config::{CheckConfig, ConfigError};
use crate::exec::{ExecError, TracingSink};

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("failed to write response file: {0}")]
    ResponseFile(#[source] std::io::Error),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Checker trait for the different ways of deciding whether a target is up
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Classify a response. An error counts as down.
    async fn is_up(&self, response: &RawResponse) -> Result<bool, CheckError>;

    /// Whether the response body has to be captured before calling
    /// [`Checker::is_up`]
    fn needs_body(&self) -> bool {
        true
    }
}

/// Up when the status code is in the 2xx range
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCheck;

#[async_trait::async_trait]
impl Checker for StatusCheck {
    async fn is_up(&self, response: &RawResponse) -> Result<bool, CheckError> {
        Ok(response.is_success())
    }

    fn needs_body(&self) -> bool {
        false
    }
}

/// Build the checker configured for `title`. Subprocess output of exec and
/// shell checks is logged under the target title.
pub fn checker_from_config(
    title: &str,
    config: &CheckConfig,
) -> Result<Box<dyn Checker>, ConfigError> {
    let command_error =
        |source: ExecError| ConfigError::Command { title: title.to_string(), source };
    let sink = Arc::new(TracingSink::new(title));

    let checker: Box<dyn Checker> = match config {
        CheckConfig::Status => Box::new(StatusCheck),
        CheckConfig::Exec { command, args } => Box::new(
            ExecCheck::from_config(command, args.as_deref())
                .map_err(command_error)?
                .with_sink(sink),
        ),
        CheckConfig::Shell { shell, script } => {
            Box::new(ShellCheck::new(shell, script).map_err(command_error)?.with_sink(sink))
        }
    };

    Ok(checker)
}
