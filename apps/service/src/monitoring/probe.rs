//! One probe per target: a sequential check loop that never overlaps checks.
//!
//! A cycle starts every `interval`, measured from the start of the previous
//! cycle. When a check overruns its interval the next one starts as soon as it
//! finishes, without catching up on missed cycles.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::checker::{Checker, checker_from_config};
use super::proxy::build_client;
use super::raw::RawResponse;
use super::types::{CheckOutcome, ProbeState};
use crate::config::{ConfigError, Target};
use crate::store::{StateStore, StoreError, TargetDir};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Probe {
    target: Target,
    client: reqwest::Client,
    checker: Box<dyn Checker>,
    dir: TargetDir,
    state: ProbeState,
}

fn elapsed_ms(since: Instant) -> i64 {
    i64::try_from(since.elapsed().as_millis()).unwrap_or(i64::MAX)
}

impl Probe {
    pub fn new(
        target: Target,
        client: reqwest::Client,
        checker: Box<dyn Checker>,
        dir: TargetDir,
    ) -> Self {
        Self { target, client, checker, dir, state: ProbeState::default() }
    }

    /// Wire the client, checker and state directory configured for `target`.
    pub fn from_target(target: Target, store: &StateStore) -> Result<Self, ProbeError> {
        let client = build_client(target.proxy.as_ref())
            .map_err(|source| ConfigError::Proxy { title: target.title.clone(), source })?;
        let checker = checker_from_config(&target.title, &target.check)?;
        let dir = store.create_target(&target.title)?;

        Ok(Self::new(target, client, checker, dir))
    }

    pub fn title(&self) -> &str {
        &self.target.title
    }

    pub fn state(&self) -> &ProbeState {
        &self.state
    }

    /// Check until `cancel` fires, then remove the target's state directory.
    pub async fn run(mut self, cancel: CancellationToken) {
        let span = info_span!("probe", title = %self.target.title);

        async move {
            info!(
                "running HTTP probe on \"{}\" (path: \"{}\")",
                self.target.url,
                self.dir.path().display()
            );

            loop {
                let cycle_start = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    outcome = self.check_once() => outcome,
                };
                self.report(&outcome);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep_until(cycle_start + self.target.interval) => {}
                }
            }

            self.dir.remove();
            info!("probe on \"{}\" stopped", self.target.url);
        }
        .instrument(span)
        .await
    }

    /// One request plus verdict, bounded by the target timeout.
    async fn check_once(&self) -> CheckOutcome {
        let timeout = self.target.timeout;
        let started = Instant::now();
        let deadline = started + timeout;

        let request = self.client.get(self.target.url.clone()).send();
        let response = match timeout_at(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return CheckOutcome::failure(elapsed_ms(started), format!("GET request failed: {e}"));
            }
            Err(_) => return CheckOutcome::failure(elapsed_ms(started), timed_out(timeout)),
        };
        let latency_ms = elapsed_ms(started);
        debug!(status = response.status().as_u16(), latency_ms, "received response");

        let capture = RawResponse::capture(response, self.checker.needs_body());
        let response = match timeout_at(deadline, capture).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return CheckOutcome::failure(latency_ms, format!("failed to read response: {e}"));
            }
            Err(_) => return CheckOutcome::failure(latency_ms, timed_out(timeout)),
        };

        match timeout_at(deadline, self.checker.is_up(&response)).await {
            Ok(Ok(is_up)) => CheckOutcome::verdict(latency_ms, is_up),
            Ok(Err(e)) => CheckOutcome::failure(latency_ms, format!("check failed: {e}")),
            Err(_) => CheckOutcome::failure(latency_ms, timed_out(timeout)),
        }
    }

    fn report(&mut self, outcome: &CheckOutcome) {
        let latency_ms = outcome.latency_ms;
        match (&outcome.error, outcome.is_up) {
            (_, true) => info!(latency_ms, "GET request succeeded"),
            (None, false) => warn!(latency_ms, "target reported down"),
            (Some(error), false) => warn!(latency_ms, "{}", error),
        }

        let health_changed = self.state.record(latency_ms, outcome.is_up);

        if let Err(e) = self.dir.write_latency(latency_ms) {
            warn!("failed to publish latency: {}", e);
        }
        if health_changed {
            info!(healthy = outcome.is_up, "health changed");
            if let Err(e) = self.dir.write_health(outcome.is_up) {
                warn!("failed to publish health: {}", e);
            }
        }
    }
}

fn timed_out(timeout: Duration) -> String {
    format!("no verdict within the {timeout:?} timeout")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckConfig;
    use crate::runtime::RuntimeDir;
    use crate::store::{HEALTH_FILE, LATENCY_FILE};
    use std::fs;
    use tempfile::tempdir;

    fn target(url: &str) -> Target {
        Target {
            title: "unit".to_string(),
            url: url.parse().unwrap(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(2),
            proxy: None,
            check: CheckConfig::Status,
        }
    }

    /// A port nothing listens on
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connection_failure_is_down_with_latency() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(&RuntimeDir::new(dir.path()), 1);
        let url = format!("http://127.0.0.1:{}/", closed_port());
        let mut probe = Probe::from_target(target(&url), &store).unwrap();

        let outcome = probe.check_once().await;
        assert!(!outcome.is_up);
        assert!(outcome.latency_ms >= 0);
        assert!(outcome.error.unwrap().starts_with("GET request failed"));

        probe.report(&CheckOutcome::failure(3, "refused"));
        assert!(probe.state().has_reported_once);
        let path = store.root().join("unit");
        assert_eq!(fs::read_to_string(path.join(LATENCY_FILE)).unwrap(), "3\n");
        assert_eq!(fs::read_to_string(path.join(HEALTH_FILE)).unwrap(), "0\n");
    }

    #[tokio::test]
    async fn test_health_file_only_rewritten_on_transition() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(&RuntimeDir::new(dir.path()), 1);
        let mut probe = Probe::from_target(target("http://127.0.0.1:1/"), &store).unwrap();
        let health = store.root().join("unit").join(HEALTH_FILE);

        probe.report(&CheckOutcome::verdict(1, true));
        assert_eq!(fs::read_to_string(&health).unwrap(), "1\n");

        // a health write now would resurrect the file
        fs::remove_file(&health).unwrap();
        probe.report(&CheckOutcome::verdict(2, true));
        assert!(!health.exists());

        probe.report(&CheckOutcome::verdict(3, false));
        assert_eq!(fs::read_to_string(&health).unwrap(), "0\n");
    }

    #[tokio::test]
    async fn test_cancelled_probe_removes_its_directory() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(&RuntimeDir::new(dir.path()), 1);
        let url = format!("http://127.0.0.1:{}/", closed_port());
        let probe = Probe::from_target(target(&url), &store).unwrap();
        let path = store.root().join("unit");

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(probe.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(path.join(LATENCY_FILE).exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_unsupported_proxy_fails_construction() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(&RuntimeDir::new(dir.path()), 1);
        let mut target = target("http://127.0.0.1:1/");
        target.proxy = Some("ftp://127.0.0.1:21".parse().unwrap());

        let result = Probe::from_target(target, &store);
        assert!(matches!(result, Err(ProbeError::Config(ConfigError::Proxy { .. }))));
    }
}
