//! Task drivers.
//!
//! Each task owns one socket (or one requester state machine), feeds what it
//! reads into the matching sans-IO component and executes the actions that
//! come back. Tasks talk through channels; the key cache and the listener's
//! key history are the only state behind a lock.
//!
//! Every loop selects on the shutdown signal first, so once shutdown is
//! requested no further packet is processed.
//!
//! Socket failures are counted per task by a [`FailureBudget`]. Each failure
//! is reported as `TransportError` and followed by a doubling pause; a
//! success resets the count. Once the count reaches the limit the task
//! reports `TransportFailed` and stops.

#[cfg(test)]
pub(crate) mod faulty;
pub(crate) mod listener;
pub(crate) mod receiver;
pub(crate) mod requester;
pub(crate) mod sender;

use std::{io, time::Duration};

use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::{NodeEvent, SocketRole, TransportError};

/// Broadcast `event`. Nobody listening is fine.
pub(crate) fn emit(events: &broadcast::Sender<NodeEvent>, event: NodeEvent) {
    let _ = events.send(event);
}

/// Consecutive socket failures one task tolerates.
#[derive(Debug)]
pub(crate) struct FailureBudget {
    role: SocketRole,
    limit: u32,
    base_delay: Duration,
    failures: u32,
}

impl FailureBudget {
    pub(crate) fn new(role: SocketRole, limit: u32, base_delay: Duration) -> Self {
        Self { role, limit: limit.max(1), base_delay, failures: 0 }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn succeeded(&mut self) {
        self.failures = 0;
    }

    /// Count a failed `operation`.
    ///
    /// Returns the pause before trying again, or `None` once the budget is
    /// spent, after `TransportFailed` went out.
    pub(crate) fn failed(
        &mut self,
        operation: &'static str,
        cause: &io::Error,
        events: &broadcast::Sender<NodeEvent>,
    ) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        let failures = self.failures;

        let transport_error = TransportError::new(self.role, operation, cause);
        warn!(role = %self.role, error = %transport_error, failures, "socket operation failed");
        emit(events, NodeEvent::TransportError(transport_error));

        if failures >= self.limit {
            error!(role = %self.role, failures, "giving up on socket");
            emit(events, NodeEvent::TransportFailed { role: self.role, failures });
            return None;
        }
        Some(backoff(self.base_delay, failures))
    }
}

/// `base * 2^(failures - 1)`.
fn backoff(base: Duration, failures: u32) -> Duration {
    base.saturating_mul(1 << failures.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionRefused)
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff(Duration::MAX, 30), Duration::MAX);
    }

    #[test]
    fn budget_reports_each_failure_then_gives_up() {
        let (events, mut rx) = broadcast::channel(16);
        let mut budget = FailureBudget::new(SocketRole::Listener, 3, Duration::from_millis(50));

        assert_eq!(budget.failed("receive", &refused(), &events), Some(Duration::from_millis(50)));
        assert_eq!(budget.failed("receive", &refused(), &events), Some(Duration::from_millis(100)));
        assert_eq!(budget.failed("receive", &refused(), &events), None);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 4);
        assert!(seen[..3].iter().all(|e| matches!(
            e,
            NodeEvent::TransportError(TransportError {
                role: SocketRole::Listener,
                operation: "receive",
                kind: io::ErrorKind::ConnectionRefused,
                ..
            })
        )));
        assert_eq!(seen[3], NodeEvent::TransportFailed { role: SocketRole::Listener, failures: 3 });
    }

    #[test]
    fn success_resets_the_count() {
        let (events, _rx) = broadcast::channel(16);
        let mut budget = FailureBudget::new(SocketRole::Requester, 2, Duration::from_millis(10));

        assert!(budget.failed("receive", &refused(), &events).is_some());
        budget.succeeded();
        assert_eq!(budget.failures(), 0);
        assert!(budget.failed("receive", &refused(), &events).is_some());
        assert!(budget.failed("receive", &refused(), &events).is_none());
    }
}
