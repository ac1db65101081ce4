//! Retry supervisor: tracks consecutive failures per server and
//! decides when a reconnect attempt is allowed. Exhausting the budget (10
//! consecutive failures) requires an explicit `reset` — mirroring an
//! explicit re-register — rather than silently recovering on its own.

use std::time::SystemTime;

use dashmap::DashMap;
use mcp_protocol::RetryState;

#[derive(Default)]
pub struct RetrySupervisor {
    state: DashMap<String, RetryState>,
}

impl RetrySupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, id: &str) {
        self.state.insert(id.to_string(), RetryState::fresh());
    }

    pub fn may_attempt(&self, id: &str, now: SystemTime) -> bool {
        self.state
            .get(id)
            .map(|entry| entry.may_attempt(now))
            .unwrap_or(true)
    }

    pub fn next_allowed_at(&self, id: &str) -> Option<SystemTime> {
        self.state.get(id).map(|entry| entry.next_allowed_at)
    }

    /// Record a failed connection attempt. Returns `Err` once the budget is
    /// exhausted; the caller must surface `McpError::RetryExhausted` and
    /// require an explicit re-register before trying again.
    pub fn record_failure(&self, id: &str, now: SystemTime) -> Result<(), ()> {
        let mut entry = self.state.entry(id.to_string()).or_insert_with(RetryState::fresh);
        entry.record_failure(now)
    }

    pub fn record_success(&self, id: &str, now: SystemTime) {
        let mut entry = self.state.entry(id.to_string()).or_insert_with(RetryState::fresh);
        entry.record_success(now);
    }

    pub fn consecutive_failures(&self, id: &str) -> u32 {
        self.state.get(id).map(|entry| entry.consecutive_failures).unwrap_or(0)
    }

    pub fn forget(&self, id: &str) {
        self.state.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_server_may_attempt_immediately() {
        let supervisor = RetrySupervisor::new();
        assert!(supervisor.may_attempt("srv", SystemTime::now()));
    }

    #[test]
    fn failure_blocks_attempts_until_backoff_elapses() {
        let supervisor = RetrySupervisor::new();
        let t0 = SystemTime::now();
        supervisor.record_failure("srv", t0).unwrap();
        assert!(!supervisor.may_attempt("srv", t0));
        assert!(supervisor.may_attempt("srv", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn tenth_failure_is_reported_as_exhausted() {
        let supervisor = RetrySupervisor::new();
        let t0 = SystemTime::now();
        for _ in 0..9 {
            assert!(supervisor.record_failure("srv", t0).is_ok());
        }
        assert!(supervisor.record_failure("srv", t0).is_err());
    }

    #[test]
    fn reset_clears_the_failure_count() {
        let supervisor = RetrySupervisor::new();
        let t0 = SystemTime::now();
        supervisor.record_failure("srv", t0).unwrap();
        supervisor.reset("srv");
        assert_eq!(supervisor.consecutive_failures("srv"), 0);
    }
}
