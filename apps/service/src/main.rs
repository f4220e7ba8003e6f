#![warn(clippy::all)]

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use avail::config::{Config, ConfigError, default_config_path};
use avail::daemon::{Daemon, DaemonError, read_pid};
use avail::monitoring::{HTTP_ENV, ProbeError, RawResponse};
use avail::runtime::RuntimeDir;
use avail::status::StatusReader;
use clap::{Args, Parser, Subcommand};
use crossterm::tty::IsTty;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter};

const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_INIT: u8 = 4;

/// HTTP availability monitor publishing per-target latency and health on disk.
#[derive(Parser)]
#[command(name = "avail", version, about)]
struct Cli {
    /// Root directory for the PID file and published state
    #[arg(long, global = true, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground until SIGINT or SIGTERM.
    Run {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Show the latest health and latency of each target.
    Status {
        #[command(flatten)]
        daemon: PidArgs,
        /// Only show these targets
        titles: Vec<String>,
    },
    /// List the targets a daemon publishes.
    List {
        #[command(flatten)]
        daemon: PidArgs,
    },
    /// Inspect the response file of the current check (for check scripts).
    Http {
        #[command(subcommand)]
        part: HttpPart,
    },
    /// Print the effective configuration.
    Config {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum HttpPart {
    /// Status code
    Status,
    /// Value of a header, empty when absent
    Header { name: String },
    /// Raw body
    Body,
}

/// Ways to find the daemon to query.
#[derive(Args)]
struct PidArgs {
    /// Configuration file naming the PID file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// PID of the daemon
    #[arg(short = 'P', long, conflicts_with = "pid_file")]
    pid: Option<u32>,

    /// PID file of the daemon
    #[arg(short = 'p', long, value_name = "FILE")]
    pid_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum UsageError {
    #[error("{0} is not set; `avail http` is meant to run inside a check")]
    MissingEnv(&'static str),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.verbose {
        logger::init_with_level(LevelFilter::DEBUG);
    } else {
        logger::init();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start async runtime: {}", e);
            return ExitCode::from(EXIT_INIT);
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run { config } => {
            let config = Config::from_config(config.as_deref())?;
            let runtime = runtime_dir(cli.runtime_dir, &config);
            run_daemon(config, runtime).await
        }
        Command::Status { daemon, titles } => {
            let reader = status_reader(cli.runtime_dir, &daemon)?;
            let list = reader.statuses(&titles)?.with_color(io::stdout().is_tty());
            print!("{list}");
            Ok(())
        }
        Command::List { daemon } => {
            for title in status_reader(cli.runtime_dir, &daemon)?.titles()? {
                println!("{title}");
            }
            Ok(())
        }
        Command::Http { part } => print_http(&part),
        Command::Config { config } => {
            print!("{}", Config::from_config(config.as_deref())?);
            Ok(())
        }
    }
}

/// `--runtime-dir`, then the config file, then the platform default
fn runtime_dir(flag: Option<PathBuf>, config: &Config) -> RuntimeDir {
    match flag {
        Some(path) => RuntimeDir::new(path),
        None => config.runtime_dir(),
    }
}

async fn run_daemon(config: Config, runtime: RuntimeDir) -> Result<()> {
    let daemon = Daemon::new(config, runtime);
    let cancel = CancellationToken::new();

    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));
    let result = daemon.run(cancel).await;
    signals.abort();

    result?;
    Ok(())
}

#[cfg(unix)]
async fn cancel_on_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = term.recv() => info!("received SIGTERM, shutting down"),
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received interrupt, shutting down");
    }
    cancel.cancel();
}

/// Config used only to locate a daemon: a missing default file is fine.
fn lookup_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    if path.is_some() {
        return Config::from_config(path);
    }
    match default_config_path() {
        Ok(default) if default.exists() => Config::from_config(Some(default)),
        _ => {
            debug!("no configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

fn status_reader(flag: Option<PathBuf>, args: &PidArgs) -> Result<StatusReader> {
    let config = lookup_config(args.config.as_deref())?;
    let runtime = runtime_dir(flag, &config);

    let pid = match (args.pid, &args.pid_file) {
        (Some(pid), _) => pid,
        (None, Some(path)) => read_pid(path).map_err(|e| anyhow!("{e}"))?,
        (None, None) => {
            let path = config.pid_file(&runtime);
            read_pid(&path)
                .map_err(|e| anyhow!("no daemon found ({e}); is it running?"))?
        }
    };
    debug!(pid, "reading state from {}", runtime.pid_dir(pid).display());

    Ok(StatusReader::new(&runtime, pid))
}

fn print_http(part: &HttpPart) -> Result<()> {
    let path = std::env::var_os(HTTP_ENV).ok_or(UsageError::MissingEnv(HTTP_ENV))?;
    let raw = fs::read(&path)
        .with_context(|| format!("failed to read {}", Path::new(&path).display()))?;
    let response = RawResponse::parse(&raw)?;

    let mut stdout = io::stdout().lock();
    match part {
        HttpPart::Status => writeln!(stdout, "{}", response.status)?,
        HttpPart::Header { name } => {
            stdout.write_all(response.header(name).unwrap_or_default())?;
            stdout.write_all(b"\n")?;
        }
        HttpPart::Body => stdout.write_all(&response.body)?,
    }
    stdout.flush()?;
    Ok(())
}

/// Map the error chain onto the documented exit codes.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() || cause.is::<UsageError>() {
            return EXIT_USAGE;
        }
        if let Some(daemon) = cause.downcast_ref::<DaemonError>() {
            return match daemon {
                DaemonError::Config(_) | DaemonError::Probe(ProbeError::Config(_)) => EXIT_USAGE,
                DaemonError::AlreadyRunning { .. }
                | DaemonError::PidInaccessible { .. }
                | DaemonError::PidFileIsDirectory(_)
                | DaemonError::PidFileMalformed { .. }
                | DaemonError::Io { .. }
                | DaemonError::Probe(ProbeError::Store(_)) => EXIT_INIT,
            };
        }
    }
    EXIT_FAILURE
}
