//! Reads the state published by a running daemon, for `avail status`.

use std::fmt;

use crossterm::style::Stylize;

use crate::runtime::RuntimeDir;
use crate::store::{StateStore, StoreError, TargetStatus};

/// Read-only view of one daemon's state directory.
pub struct StatusReader {
    store: StateStore,
}

impl StatusReader {
    pub fn new(runtime: &RuntimeDir, pid: u32) -> Self {
        Self { store: StateStore::new(runtime, pid) }
    }

    pub fn titles(&self) -> Result<Vec<String>, StoreError> {
        self.store.titles()
    }

    pub fn status(&self, title: &str) -> Result<TargetStatus, StoreError> {
        self.store.read(title)
    }

    /// Statuses of `titles`, or of every published target when empty.
    pub fn statuses(&self, titles: &[String]) -> Result<SiteStatusList, StoreError> {
        let titles = if titles.is_empty() { self.titles()? } else { titles.to_vec() };
        let entries = titles
            .iter()
            .map(|title| self.status(title))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SiteStatusList { entries, color: false })
    }
}

/// Aligned, human readable report of several targets.
#[derive(Debug, Clone)]
pub struct SiteStatusList {
    entries: Vec<TargetStatus>,
    color: bool,
}

impl SiteStatusList {
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn entries(&self) -> &[TargetStatus] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for SiteStatusList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.entries.iter().map(|e| e.title.chars().count()).max().unwrap_or(0) + 1;

        for entry in &self.entries {
            let label = format!("{}:", entry.title);
            let health = match entry.healthy {
                Some(true) => "OK",
                Some(false) => "FAILED",
                None => "PENDING",
            };
            let latency = match entry.latency_ms {
                Some(ms) => format!("{ms} ms"),
                None => "-".to_string(),
            };

            if self.color {
                let health = match entry.healthy {
                    Some(true) => health.green().bold(),
                    Some(false) => health.red().bold(),
                    None => health.yellow().bold(),
                };
                writeln!(f, "{label:<width$} {health} (latency: {})", latency.cyan())?;
            } else {
                writeln!(f, "{label:<width$} {health} (latency: {latency})")?;
            }
        }

        Ok(())
    }
}
