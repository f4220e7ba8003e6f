/// Monitoring engine module - probes targets and classifies their responses
///
/// This module is responsible for:
/// - Running the per-target check loop
/// - Building HTTP clients, optionally proxied
/// - Deciding up/down through pluggable checkers (status, exec, shell)
/// - Capturing raw responses for out-of-process checks
pub mod checker;
pub mod exec_check;
pub mod probe;
pub mod proxy;
pub mod raw;
pub mod types;

pub use checker::{CheckError, Checker, StatusCheck, checker_from_config};
pub use exec_check::{ExecCheck, HTTP_ENV, ShellCheck};
pub use probe::{Probe, ProbeError};
pub use proxy::{ProxyError, build_client};
pub use raw::{RawResponse, WireError};
pub use types::{CheckOutcome, ProbeState};
