//! Per-session reconnect loop for relay workers.
//!
//! A session cycles `Probing -> Backoff -> Probing ...` until the shared
//! deadline fires, then lands in `Stopped`. Setup failures are reported as
//! one error event per attempt; the fixed backoff bounds reconnection churn
//! against a failing server.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probe::{ErrorCode, EventSink};

/// Default wait between relay setup attempts.
pub const SETUP_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Probing,
    Backoff,
    Stopped,
}

/// Result of one probing attempt.
#[derive(Debug)]
pub enum Attempt {
    /// Steady state ran and ended (deadline or a send failure already
    /// reported by the attempt itself).
    Finished,
    /// Setup failed before steady state; the code is reported once.
    SetupFailed(ErrorCode),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: SETUP_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Next state after `current`, given whether the deadline has fired.
    pub fn next(&self, current: RetryState, cancelled: bool) -> RetryState {
        match (current, cancelled) {
            (_, true) | (RetryState::Stopped, _) => RetryState::Stopped,
            (RetryState::Probing, false) => RetryState::Backoff,
            (RetryState::Backoff, false) => RetryState::Probing,
        }
    }

    /// Drive `attempt` until `cancel` fires. Returns the number of attempts.
    pub async fn run<F, Fut>(&self, sink: &EventSink, cancel: &CancellationToken, mut attempt: F) -> u64
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let mut state = RetryState::Probing;
        let mut attempts = 0u64;

        loop {
            match state {
                RetryState::Probing => {
                    if cancel.is_cancelled() {
                        state = RetryState::Stopped;
                        continue;
                    }
                    attempts += 1;
                    if let Attempt::SetupFailed(code) = attempt().await {
                        debug!(
                            session = sink.session_id(),
                            code = code.code(),
                            attempt = attempts,
                            "relay setup failed, backing off"
                        );
                        sink.error(code).await;
                    }
                    state = self.next(state, cancel.is_cancelled());
                }
                RetryState::Backoff => {
                    let cancelled = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(self.backoff) => false,
                    };
                    state = self.next(state, cancelled);
                }
                RetryState::Stopped => return attempts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Outcome;
    use tokio::sync::mpsc;

    #[test]
    fn test_transitions() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next(RetryState::Probing, false), RetryState::Backoff);
        assert_eq!(policy.next(RetryState::Backoff, false), RetryState::Probing);
        assert_eq!(policy.next(RetryState::Probing, true), RetryState::Stopped);
        assert_eq!(policy.next(RetryState::Backoff, true), RetryState::Stopped);
        assert_eq!(policy.next(RetryState::Stopped, false), RetryState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_setup_retries_at_backoff_rate() {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = EventSink::new(2, tx);
        let cancel = CancellationToken::new();

        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            deadline.cancel();
        });

        let policy = RetryPolicy::default();
        let attempts = policy
            .run(&sink, &cancel, || async {
                Attempt::SetupFailed(ErrorCode::SingleHopAllocate)
            })
            .await;

        // t = 0, 100, 200, 300, 400 ms
        assert_eq!(attempts, 5);
        drop(sink);
        let mut errors = 0;
        while let Some(ev) = rx.recv().await {
            assert_eq!(ev.outcome, Outcome::Error(ErrorCode::SingleHopAllocate));
            errors += 1;
        }
        assert_eq!(errors, 5);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_probes() {
        let (tx, _rx) = mpsc::channel(4);
        let sink = EventSink::new(0, tx);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let attempts = RetryPolicy::default()
            .run(&sink, &cancel, || async { Attempt::Finished })
            .await;
        assert_eq!(attempts, 0);
    }
}
