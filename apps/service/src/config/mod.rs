//! Daemon configuration: file loading, validation and resolution of each
//! configured target into a [`Target`] the probes can run.

mod duration;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use duration::{DurationError, parse_duration};

use crate::exec::ExecError;
use crate::monitoring::proxy::ProxyError;
use crate::runtime::RuntimeDir;

const DEFAULT_INTERVAL: &str = "5s";
const DEFAULT_TIMEOUT: &str = "30s";
const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {details}")]
    Parse { path: PathBuf, details: String },
    #[error("no config path available: neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,
    #[error("invalid target title \"{title}\": {reason}")]
    Title { title: String, reason: &'static str },
    #[error("duplicate target title \"{0}\"")]
    DuplicateTitle(String),
    #[error("target \"{title}\": invalid {field} \"{value}\": {source}")]
    Duration {
        title: String,
        field: &'static str,
        value: String,
        #[source]
        source: DurationError,
    },
    #[error("target \"{title}\": {field} must be greater than zero")]
    ZeroDuration { title: String, field: &'static str },
    #[error("target \"{title}\": invalid url \"{url}\": {reason}")]
    Url { title: String, url: String, reason: String },
    #[error("target \"{title}\": invalid check command: {source}")]
    Command {
        title: String,
        #[source]
        source: ExecError,
    },
    #[error("target \"{title}\": {source}")]
    Proxy {
        title: String,
        #[source]
        source: ProxyError,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Explicit PID file; defaults to `main.pid` under the runtime directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    /// Overrides the platform runtime directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<PathBuf>,

    #[serde(default, alias = "pings")]
    pub targets: Vec<TargetConfig>,
}

/// One monitored HTTP endpoint as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub title: String,
    pub url: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(default)]
    pub check: CheckConfig,
}

/// Check strategy selected by the `type` tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckConfig {
    /// Up when the status code is 2xx
    #[default]
    Status,
    /// Up when `command` exits with 0.
    ///
    /// Without `args`, `command` is split with shell quoting rules. With
    /// `args`, `command` is the program and `args` are passed verbatim.
    Exec {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,
    },
    /// Up when `shell` exits with 0 after reading `script` on stdin
    Shell {
        #[serde(default = "default_shell")]
        shell: String,
        script: String,
    },
}

/// A validated target, immutable once a probe is built from it.
#[derive(Debug, Clone)]
pub struct Target {
    pub title: String,
    pub url: Url,
    pub interval: Duration,
    pub timeout: Duration,
    pub proxy: Option<Url>,
    pub check: CheckConfig,
}

fn default_interval() -> String {
    DEFAULT_INTERVAL.to_string()
}

fn default_timeout() -> String {
    DEFAULT_TIMEOUT.to_string()
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

/// JSON when the file says so, TOML otherwise
fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Get default config path ($XDG_CONFIG_HOME/avail/config.toml or
/// $HOME/.config/...)
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let path = if let Some(config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("avail/config.toml"))
}

/// Titles name directories in the state store, so they must be a single
/// plain path component.
pub fn validate_title(title: &str) -> Result<(), ConfigError> {
    let reason = if title.trim().is_empty() {
        "title cannot be empty"
    } else if title == "." || title == ".." {
        "title cannot be a relative path component"
    } else if title.contains(['/', '\\', '\0']) {
        "title cannot contain path separators"
    } else {
        return Ok(());
    };

    Err(ConfigError::Title { title: title.to_string(), reason })
}

/// Validate an HTTP/HTTPS endpoint
fn parse_endpoint(title: &str, target: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Url {
        title: title.to_string(),
        url: target.to_string(),
        reason,
    };

    let url = Url::parse(target).map_err(|e| {
        if target.contains("://") {
            invalid(e.to_string())
        } else {
            invalid("URL must include scheme (http:// or https://)".to_string())
        }
    })?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(invalid(format!("invalid scheme '{scheme}', must be http or https")));
    }
    if url.host_str().is_none() {
        return Err(invalid("URL must have a valid host".to_string()));
    }

    Ok(url)
}

fn parse_positive(
    title: &str,
    field: &'static str,
    value: &str,
) -> Result<Duration, ConfigError> {
    let duration = parse_duration(value).map_err(|source| ConfigError::Duration {
        title: title.to_string(),
        field,
        value: value.to_string(),
        source,
    })?;
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration { title: title.to_string(), field });
    }
    Ok(duration)
}

impl TargetConfig {
    /// Parse durations and URLs into a [`Target`].
    pub fn resolve(&self) -> Result<Target, ConfigError> {
        validate_title(&self.title)?;

        let url = parse_endpoint(&self.title, &self.url)?;
        let interval = parse_positive(&self.title, "interval", &self.interval)?;
        let timeout = parse_positive(&self.title, "timeout", &self.timeout)?;
        let proxy = self
            .proxy
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| ConfigError::Proxy {
                    title: self.title.clone(),
                    source: ProxyError::InvalidUrl { url: raw.to_string(), reason: e.to_string() },
                })
            })
            .transpose()?;

        Ok(Target {
            title: self.title.clone(),
            url,
            interval,
            timeout,
            proxy,
            check: self.check.clone(),
        })
    }
}

impl fmt::Display for CheckConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Exec { command, args: None } => write!(f, "exec `{command}`"),
            Self::Exec { command, args: Some(args) } => {
                write!(f, "exec `{command}` {args:?}")
            }
            Self::Shell { shell, .. } => write!(f, "shell `{shell}` (script on stdin)"),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);
        let unset = "(default)";

        writeln!(f, "Current Configuration:")?;
        write_title_1(f, "Daemon")?;
        match &self.pid_file {
            Some(path) => write_1(f, "PID File", &path.display())?,
            None => write_1(f, "PID File", &unset)?,
        }
        match &self.runtime_dir {
            Some(path) => write_1(f, "Runtime Directory", &path.display())?,
            None => write_1(f, "Runtime Directory", &unset)?,
        }

        write_title_1(f, "Targets")?;
        if self.targets.is_empty() {
            write_1(f, "(none)", &"no targets configured")?;
        }
        for target in &self.targets {
            write_1(f, &target.title, &target.url)?;
            write_2(f, "Interval", &target.interval)?;
            write_2(f, "Timeout", &target.timeout)?;
            if let Some(proxy) = &target.proxy {
                write_2(f, "Proxy", proxy)?;
            }
            write_2(f, "Check", &target.check)?;
        }

        Ok(())
    }
}

impl Config {
    /// Load the config from `optional_path`, or from the default location.
    ///
    /// Files ending in `.json` are parsed as JSON, anything else as TOML.
    pub fn from_config(optional_path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        let config_path = match optional_path {
            Some(path) => path.as_ref().to_path_buf(),
            None => default_config_path()?,
        };

        let raw = fs::read_to_string(&config_path)
            .map_err(|source| ConfigError::Read { path: config_path.clone(), source })?;

        let config = Self::parse(&raw, is_json(&config_path))
            .map_err(|details| ConfigError::Parse { path: config_path.clone(), details })?;
        config.validate()?;

        Ok(config)
    }

    fn parse(raw: &str, json: bool) -> Result<Self, String> {
        if json {
            serde_json::from_str(raw).map_err(|e| e.to_string())
        } else {
            toml::from_str(raw).map_err(|e| e.to_string())
        }
    }

    /// Check that titles are valid directory names and unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            validate_title(&target.title)?;
            if !seen.insert(target.title.as_str()) {
                return Err(ConfigError::DuplicateTitle(target.title.clone()));
            }
        }
        Ok(())
    }

    /// Resolve every target; the first invalid one aborts.
    pub fn resolve_targets(&self) -> Result<Vec<Target>, ConfigError> {
        self.validate()?;
        self.targets.iter().map(TargetConfig::resolve).collect()
    }

    /// Runtime directory to use when no explicit override is given.
    pub fn runtime_dir(&self) -> RuntimeDir {
        match &self.runtime_dir {
            Some(path) => RuntimeDir::new(path),
            None => RuntimeDir::resolve(),
        }
    }

    pub fn pid_file(&self, runtime: &RuntimeDir) -> PathBuf {
        self.pid_file.clone().unwrap_or_else(|| runtime.default_pid_file())
    }
}
