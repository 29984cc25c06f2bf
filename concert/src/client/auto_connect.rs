//! Keeps the client joined to its default session.

use std::time::Duration;

use super::pending::{ConnectionFuture, ConnectionResultCode};

/// What the client should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutoConnectStep {
    Wait,
    Attempt,
    GiveUp,
}

/// Retry loop joining the default session whenever the client is
/// disconnected and idle.
#[derive(Debug)]
pub struct AutoConnection {
    poll_interval: Duration,
    last_attempt: Option<Duration>,
    attempts: u32,
    in_flight: Option<ConnectionFuture>,
}

impl AutoConnection {
    /// Retry at most once per `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            last_attempt: None,
            attempts: 0,
            in_flight: None,
        }
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether an attempt is still running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Decide the next step.
    ///
    /// `busy` is true while a session exists or another connection is
    /// pending. A rejection ends the loop unless `keep_after_rejection`.
    pub(crate) fn poll(
        &mut self,
        now: Duration,
        busy: bool,
        keep_after_rejection: bool,
    ) -> AutoConnectStep {
        if let Some(future) = self.in_flight.as_mut() {
            let Some(outcome) = future.try_outcome() else {
                return AutoConnectStep::Wait;
            };
            self.in_flight = None;
            if outcome.code == ConnectionResultCode::Rejected && !keep_after_rejection {
                tracing::warn!(reason = %outcome.reason, "auto-connect rejected, giving up");
                return AutoConnectStep::GiveUp;
            }
            if !outcome.is_success() {
                tracing::debug!(
                    code = %outcome.code,
                    reason = %outcome.reason,
                    "auto-connect attempt failed"
                );
            }
        }

        if busy {
            return AutoConnectStep::Wait;
        }
        match self.last_attempt {
            Some(last) if now.saturating_sub(last) < self.poll_interval => AutoConnectStep::Wait,
            _ => AutoConnectStep::Attempt,
        }
    }

    pub(crate) fn attempt_started(&mut self, now: Duration, future: ConnectionFuture) {
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.in_flight = Some(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pending::{
        BoxedConnectionTask, ConnectionOutcome, ConnectionTask, PendingConnection, TaskStatus,
    };

    struct Failing(ConnectionResultCode);

    impl ConnectionTask<()> for Failing {
        fn execute(&mut self, _ctx: &mut ()) {}
        fn tick(&mut self, _ctx: &mut (), _should_cancel: bool) {}
        fn abort(&mut self, _ctx: &mut ()) {}
        fn status(&self) -> TaskStatus {
            TaskStatus::Failed(ConnectionOutcome::new(self.0, "nope"))
        }
        fn description(&self) -> String {
            "failing".to_string()
        }
    }

    fn finished_future(code: ConnectionResultCode) -> ConnectionFuture {
        let tasks: Vec<BoxedConnectionTask<()>> = vec![Box::new(Failing(code))];
        let (mut pending, future) = PendingConnection::execute(tasks, &mut ());
        assert!(pending.tick(&mut ()));
        future
    }

    #[test]
    fn test_waits_for_poll_interval() {
        let mut auto = AutoConnection::new(Duration::from_secs(2));
        assert_eq!(auto.poll(Duration::ZERO, false, false), AutoConnectStep::Attempt);
        auto.attempt_started(Duration::ZERO, finished_future(ConnectionResultCode::TimedOut));
        assert_eq!(auto.poll(Duration::from_secs(1), false, false), AutoConnectStep::Wait);
        assert!(!auto.is_in_flight());
        assert_eq!(auto.poll(Duration::from_secs(2), false, false), AutoConnectStep::Attempt);
    }

    #[test]
    fn test_busy_client_is_not_retried() {
        let mut auto = AutoConnection::new(Duration::ZERO);
        assert_eq!(auto.poll(Duration::ZERO, true, false), AutoConnectStep::Wait);
    }

    #[test]
    fn test_rejection_gives_up_unless_configured() {
        let mut auto = AutoConnection::new(Duration::ZERO);
        auto.attempt_started(Duration::ZERO, finished_future(ConnectionResultCode::Rejected));
        assert_eq!(auto.poll(Duration::ZERO, false, false), AutoConnectStep::GiveUp);

        let mut auto = AutoConnection::new(Duration::ZERO);
        auto.attempt_started(Duration::ZERO, finished_future(ConnectionResultCode::Rejected));
        assert_eq!(auto.poll(Duration::ZERO, false, true), AutoConnectStep::Attempt);
        assert_eq!(auto.attempts(), 1);
    }
}
