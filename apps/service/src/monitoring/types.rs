/// Result of one probe cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Round-trip time of the request in milliseconds, measured even on failure
    pub latency_ms: i64,

    /// Verdict of the check strategy; false whenever the target could not be
    /// proven up
    pub is_up: bool,

    /// Why the cycle failed, if it did. A strategy that validly decides
    /// "down" leaves this empty.
    pub error: Option<String>,
}

impl CheckOutcome {
    /// The strategy reached a verdict
    pub fn verdict(latency_ms: i64, is_up: bool) -> Self {
        Self { latency_ms, is_up, error: None }
    }

    /// The request or the strategy failed
    pub fn failure(latency_ms: i64, error: impl Into<String>) -> Self {
        Self { latency_ms, is_up: false, error: Some(error.into()) }
    }
}

/// Last observed state of a target, owned by its probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeState {
    pub last_latency_ms: i64,
    pub last_health: bool,
    pub has_reported_once: bool,
}

impl ProbeState {
    /// Record a cycle. Returns true when the health value has to be persisted:
    /// on the first report and on every transition.
    pub fn record(&mut self, latency_ms: i64, is_up: bool) -> bool {
        let health_changed = !self.has_reported_once || self.last_health != is_up;

        self.last_latency_ms = latency_ms;
        self.last_health = is_up;
        self.has_reported_once = true;

        health_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_report_always_persists_health() {
        let mut up = ProbeState::default();
        assert!(up.record(10, true));

        // a first "down" must be written too, even though it equals the default
        let mut down = ProbeState::default();
        assert!(down.record(10, false));
        assert!(down.has_reported_once);
    }

    #[test]
    fn test_health_persisted_only_on_transitions() {
        let mut state = ProbeState::default();
        let sequence = [true, true, false, false, false, true, false, false];
        let expected = [true, false, true, false, false, true, true, false];

        for (i, (is_up, want)) in sequence.iter().zip(expected).enumerate() {
            assert_eq!(state.record(i as i64, *is_up), want, "cycle {i}");
            assert_eq!(state.last_latency_ms, i as i64);
            assert_eq!(state.last_health, *is_up);
        }
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(CheckOutcome::verdict(5, false).error, None);
        let failed = CheckOutcome::failure(7, "connection refused");
        assert!(!failed.is_up);
        assert_eq!(failed.latency_ms, 7);
        assert_eq!(failed.error.as_deref(), Some("connection refused"));
    }
}
