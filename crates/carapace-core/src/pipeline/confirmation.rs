//! Confirmation gate for stage 5 (spec.md §4.8, §9 open question).
//!
//! The pre-approval mechanism itself (a human-facing confirmation UI, its
//! time-to-live and revocation rules) lives outside the core; this module
//! only holds the per-correlation decision state the UI writes into and the
//! stage-5 query against it. Default window: 60s from request to decision.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Pending,
    Approved,
    Denied,
}

struct Entry {
    decision: Decision,
    requested_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    Timeout,
}

/// Registry the out-of-band confirmation UI writes into, and stage 5 reads
/// from. A correlation with no entry at all has never been requested and
/// is treated the same as an explicit denial.
pub struct ConfirmationGate {
    window: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl ConfirmationGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record that a confirmation has been requested for `correlation`,
    /// starting its timeout window.
    pub fn request(&self, correlation: &str) {
        self.entries.write().unwrap().insert(
            correlation.to_string(),
            Entry {
                decision: Decision::Pending,
                requested_at: Instant::now(),
            },
        );
    }

    pub fn approve(&self, correlation: &str) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(correlation) {
            entry.decision = Decision::Approved;
        }
    }

    pub fn deny(&self, correlation: &str) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(correlation) {
            entry.decision = Decision::Denied;
        }
    }

    /// Query the current decision for `correlation` against the timeout
    /// window. Total and synchronous: never blocks waiting for a decision.
    pub fn check(&self, correlation: &str) -> ConfirmationOutcome {
        let entries = self.entries.read().unwrap();
        match entries.get(correlation) {
            None => ConfirmationOutcome::Denied,
            Some(entry) => match entry.decision {
                Decision::Approved => ConfirmationOutcome::Approved,
                Decision::Denied => ConfirmationOutcome::Denied,
                Decision::Pending => {
                    if entry.requested_at.elapsed() > self.window {
                        ConfirmationOutcome::Timeout
                    } else {
                        ConfirmationOutcome::Denied
                    }
                }
            },
        }
    }

    pub fn clear(&self, correlation: &str) {
        self.entries.write().unwrap().remove(correlation);
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrequested_correlation_is_denied() {
        let gate = ConfirmationGate::default();
        assert_eq!(gate.check("c1"), ConfirmationOutcome::Denied);
    }

    #[test]
    fn approved_correlation_is_approved() {
        let gate = ConfirmationGate::default();
        gate.request("c1");
        gate.approve("c1");
        assert_eq!(gate.check("c1"), ConfirmationOutcome::Approved);
    }

    #[test]
    fn pending_within_window_is_denied_not_timeout() {
        let gate = ConfirmationGate::new(Duration::from_secs(60));
        gate.request("c1");
        assert_eq!(gate.check("c1"), ConfirmationOutcome::Denied);
    }

    #[test]
    fn pending_past_window_is_timeout() {
        let gate = ConfirmationGate::new(Duration::from_millis(1));
        gate.request("c1");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(gate.check("c1"), ConfirmationOutcome::Timeout);
    }

    #[test]
    fn explicit_denial_overrides_pending() {
        let gate = ConfirmationGate::default();
        gate.request("c1");
        gate.deny("c1");
        assert_eq!(gate.check("c1"), ConfirmationOutcome::Denied);
    }
}
