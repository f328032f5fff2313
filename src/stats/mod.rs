//! Statistics aggregator: the single consumer of probe events.
//!
//! All mutation happens in [`Aggregator::run`]. Readers go through a
//! [`StatsHandle`], which shares the same lock; the lock is held for one
//! event or one report build, never while logging.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::probe::{Direction, Outcome, ProbeEvent};

pub mod report;

pub use report::RunSummary;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    #[error("session count must be positive")]
    InvalidSessionCount,

    #[error("report interval must be positive")]
    InvalidReportInterval,
}

// ---------------------------------------------------------------------------
// Per-session state
// ---------------------------------------------------------------------------

/// Whether the last processed event for a session was a success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    Up,
    #[default]
    Down,
}

impl SessionStatus {
    /// State after an event with the given success flag.
    pub fn after(self, success: bool) -> Self {
        if success {
            SessionStatus::Up
        } else {
            SessionStatus::Down
        }
    }

    pub fn is_up(self) -> bool {
        self == SessionStatus::Up
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sent_count: u64,
    pub sent_bytes: u64,
    pub recv_count: u64,
    pub recv_bytes: u64,
    pub error_count: u64,
    pub latency_sum: Duration,
    pub latency_count: u64,
    pub status: SessionStatus,
}

impl SessionStats {
    fn new(seen: DateTime<Utc>) -> Self {
        Self {
            first_seen: seen,
            last_seen: seen,
            sent_count: 0,
            sent_bytes: 0,
            recv_count: 0,
            recv_bytes: 0,
            error_count: 0,
            latency_sum: Duration::ZERO,
            latency_count: 0,
            status: SessionStatus::Down,
        }
    }

    pub fn elapsed(&self) -> Duration {
        report::span(self.first_seen, self.last_seen)
    }

    pub fn kbps(&self) -> f64 {
        report::kbps(self.recv_bytes, self.elapsed())
    }

    pub fn loss_percent(&self) -> f64 {
        report::loss_percent(self.sent_count, self.recv_count)
    }

    pub fn average_latency(&self) -> Duration {
        report::average_latency(self.latency_sum, self.latency_count)
    }
}

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GlobalStats {
    target_sessions: u64,
    sessions: BTreeMap<u64, SessionStats>,
    current_up: u64,
    max_up: u64,
    /// Periodic detail dumps produced so far.
    detail_reports: u64,
}

impl GlobalStats {
    pub fn new(target_sessions: u64) -> Self {
        Self {
            target_sessions,
            sessions: BTreeMap::new(),
            current_up: 0,
            max_up: 0,
            detail_reports: 0,
        }
    }

    pub fn target_sessions(&self) -> u64 {
        self.target_sessions
    }

    pub fn current_up(&self) -> u64 {
        self.current_up
    }

    pub fn max_up(&self) -> u64 {
        self.max_up
    }

    pub fn detail_reports(&self) -> u64 {
        self.detail_reports
    }

    pub fn session(&self, id: u64) -> Option<&SessionStats> {
        self.sessions.get(&id)
    }

    /// Sessions in id order.
    pub fn sessions(&self) -> impl Iterator<Item = (u64, &SessionStats)> {
        self.sessions.iter().map(|(id, s)| (*id, s))
    }

    /// Fold one event into the state. Returns `false` if it was ignored.
    pub fn apply(&mut self, event: &ProbeEvent) -> bool {
        if event.session_id >= self.target_sessions {
            debug!(session = event.session_id, target = self.target_sessions, "event for unknown session");
            return false;
        }
        if event.timestamp == DateTime::<Utc>::default() {
            debug!(session = event.session_id, "event without timestamp");
            return false;
        }

        let session = self
            .sessions
            .entry(event.session_id)
            .or_insert_with(|| SessionStats::new(event.timestamp));
        session.last_seen = event.timestamp;

        let success = matches!(event.outcome, Outcome::Success(_));
        let was = session.status;
        session.status = was.after(success);

        match (was.is_up(), session.status.is_up()) {
            (false, true) => self.current_up += 1,
            (true, false) => self.current_up -= 1,
            _ => {}
        }

        match event.outcome {
            Outcome::Error(_) => {
                session.error_count += 1;
            }
            Outcome::Success(direction) => {
                self.max_up = self.max_up.max(self.current_up);
                match direction {
                    Direction::Sent => {
                        session.sent_count += 1;
                        session.sent_bytes += event.bytes;
                    }
                    Direction::Received => {
                        session.recv_count += 1;
                        session.recv_bytes += event.bytes;
                        if event.latency > Duration::ZERO {
                            session.latency_sum += event.latency;
                            session.latency_count += 1;
                        }
                    }
                }
            }
        }
        true
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_stats(self)
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Concurrent read access to the aggregator's state.
#[derive(Clone)]
pub struct StatsHandle {
    state: Arc<Mutex<GlobalStats>>,
}

impl StatsHandle {
    /// Per-session detail table.
    pub async fn detail_report(&self) -> String {
        report::detail_table(&*self.state.lock().await)
    }

    pub async fn summary(&self) -> RunSummary {
        self.state.lock().await.summary()
    }

    /// Single-line health verdict over all sessions.
    pub async fn one_line(&self, prefix: &str) -> String {
        report::one_line(prefix, &self.summary().await)
    }
}

pub struct Aggregator {
    state: Arc<Mutex<GlobalStats>>,
    report_interval: Duration,
}

impl Aggregator {
    pub fn new(target_sessions: u64, report_interval: Duration) -> Result<Self, StatsError> {
        if target_sessions == 0 {
            return Err(StatsError::InvalidSessionCount);
        }
        if report_interval.is_zero() {
            return Err(StatsError::InvalidReportInterval);
        }
        Ok(Self {
            state: Arc::new(Mutex::new(GlobalStats::new(target_sessions))),
            report_interval,
        })
    }

    pub fn handle(&self) -> StatsHandle {
        StatsHandle {
            state: self.state.clone(),
        }
    }

    /// Consume events until `cancel` fires, then drain what is queued, log
    /// the final detail table and summary, and return the summary.
    pub async fn run(self, mut rx: mpsc::Receiver<ProbeEvent>, cancel: CancellationToken) -> RunSummary {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.report_interval,
            self.report_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut producers_gone = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (dumps, table) = {
                        let mut state = self.state.lock().await;
                        state.detail_reports += 1;
                        (state.detail_reports, report::detail_table(&state))
                    };
                    info!(report = dumps, "session detail\n{}", table);
                }
                event = rx.recv(), if !producers_gone => match event {
                    Some(event) => {
                        self.state.lock().await.apply(&event);
                    }
                    None => {
                        debug!("all producers gone, waiting for deadline");
                        producers_gone = true;
                    }
                },
            }
        }

        let mut drained = 0u64;
        {
            let mut state = self.state.lock().await;
            while let Ok(event) = rx.try_recv() {
                state.apply(&event);
                drained += 1;
            }
        }
        debug!(drained, "final drain complete");

        let (table, summary, periodic) = {
            let state = self.state.lock().await;
            (report::detail_table(&state), state.summary(), state.detail_reports())
        };
        info!(periodic, "final session detail\n{}", table);
        info!("run summary\n{}", summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ErrorCode;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::milliseconds(ms)
    }

    fn sent(id: u64, ms: i64) -> ProbeEvent {
        ProbeEvent::sent(id, at(ms), 1024)
    }

    fn received(id: u64, ms: i64, latency_ms: u64) -> ProbeEvent {
        ProbeEvent::received(id, at(ms), 1024, Duration::from_millis(latency_ms))
    }

    fn error(id: u64, ms: i64) -> ProbeEvent {
        ProbeEvent::error(id, at(ms), ErrorCode::PacketChecksum)
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(SessionStatus::Down.after(true), SessionStatus::Up);
        assert_eq!(SessionStatus::Up.after(true), SessionStatus::Up);
        assert_eq!(SessionStatus::Up.after(false), SessionStatus::Down);
        assert_eq!(SessionStatus::Down.after(false), SessionStatus::Down);
    }

    #[test]
    fn test_up_count_bounded_and_max_monotonic() {
        let mut stats = GlobalStats::new(3);
        let events = vec![
            sent(0, 0),
            sent(1, 1),
            error(0, 2),
            sent(2, 3),
            sent(0, 4),
            error(1, 5),
            error(2, 6),
            sent(1, 7),
            error(0, 8),
            received(2, 9, 3),
        ];

        let mut last_max = 0;
        for ev in &events {
            stats.apply(ev);
            assert!(stats.current_up() <= stats.target_sessions());
            assert!(stats.max_up() >= last_max);
            last_max = stats.max_up();
        }
        assert_eq!(stats.max_up(), 3);
        assert_eq!(stats.current_up(), 2);
    }

    #[test]
    fn test_repeated_success_counts_once() {
        let mut stats = GlobalStats::new(2);
        stats.apply(&sent(0, 0));
        stats.apply(&sent(0, 10));
        assert_eq!(stats.current_up(), 1);
        assert_eq!(stats.max_up(), 1);
    }

    #[test]
    fn test_alternating_outcomes_toggle_per_transition() {
        let mut stats = GlobalStats::new(1);
        let mut seen = Vec::new();
        for ev in [sent(0, 0), error(0, 1), sent(0, 2), error(0, 3)] {
            stats.apply(&ev);
            seen.push(stats.current_up());
        }
        assert_eq!(seen, vec![1, 0, 1, 0]);
        assert_eq!(stats.max_up(), 1);
    }

    #[test]
    fn test_out_of_range_and_zero_timestamp_ignored() {
        let mut stats = GlobalStats::new(2);
        assert!(!stats.apply(&sent(2, 0)));
        assert!(!stats.apply(&ProbeEvent::sent(0, DateTime::<Utc>::default(), 10)));
        assert!(stats.session(0).is_none());
        assert_eq!(stats.current_up(), 0);
    }

    #[test]
    fn test_error_skips_byte_accounting() {
        let mut stats = GlobalStats::new(1);
        let mut ev = error(0, 0);
        ev.bytes = 500;
        stats.apply(&ev);
        let s = stats.session(0).unwrap();
        assert_eq!(s.error_count, 1);
        assert_eq!(s.sent_bytes + s.recv_bytes, 0);
    }

    #[test]
    fn test_zero_latency_not_sampled() {
        let mut stats = GlobalStats::new(1);
        stats.apply(&received(0, 0, 0));
        let s = stats.session(0).unwrap();
        assert_eq!(s.recv_count, 1);
        assert_eq!(s.latency_count, 0);
        assert_eq!(s.average_latency(), Duration::ZERO);
    }

    #[test]
    fn test_session_zero_scenario() {
        let mut stats = GlobalStats::new(2);
        stats.apply(&sent(0, 0));
        stats.apply(&received(0, 10, 10));
        stats.apply(&sent(0, 1000));
        stats.apply(&received(0, 1010, 5));

        let s = stats.session(0).unwrap();
        assert_eq!(s.sent_count, 2);
        assert_eq!(s.recv_count, 2);
        assert_eq!(s.average_latency(), Duration::from_micros(7500));
        assert_eq!(s.loss_percent(), 0.0);
        assert_eq!(s.elapsed(), Duration::from_millis(1010));
    }

    #[test]
    fn test_session_one_scenario() {
        let mut stats = GlobalStats::new(2);
        let mut ups = Vec::new();
        stats.apply(&sent(1, 0));
        ups.push(stats.current_up());
        stats.apply(&sent(1, 1000));
        ups.push(stats.current_up());
        stats.apply(&error(1, 2000));
        ups.push(stats.current_up());

        let s = stats.session(1).unwrap();
        assert_eq!(s.sent_count, 2);
        assert_eq!(s.recv_count, 0);
        assert_eq!(s.error_count, 1);
        assert_eq!(s.loss_percent(), 100.0);
        assert_eq!(ups, vec![1, 1, 0]);
        assert_eq!(s.status, SessionStatus::Down);
    }

    #[test]
    fn test_aggregator_rejects_bad_requests() {
        assert_eq!(
            Aggregator::new(0, Duration::from_secs(5)).err(),
            Some(StatsError::InvalidSessionCount)
        );
        assert_eq!(
            Aggregator::new(1, Duration::ZERO).err(),
            Some(StatsError::InvalidReportInterval)
        );
    }

    #[tokio::test]
    async fn test_run_drains_queue_after_cancel() {
        let aggregator = Aggregator::new(2, Duration::from_secs(60)).unwrap();
        let handle = aggregator.handle();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        tx.send(sent(0, 0)).await.unwrap();
        tx.send(received(0, 10, 10)).await.unwrap();
        tx.send(sent(1, 20)).await.unwrap();
        cancel.cancel();

        let summary = aggregator.run(rx, cancel).await;
        assert_eq!(summary.totals.sent_count, 2);
        assert_eq!(summary.totals.recv_count, 1);
        assert_eq!(summary.observed_sessions, 2);
        assert_eq!(handle.summary().await, summary);
    }

    #[tokio::test]
    async fn test_run_outlives_producers_until_deadline() {
        let aggregator = Aggregator::new(1, Duration::from_secs(60)).unwrap();
        let handle = aggregator.handle();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(aggregator.run(rx, cancel.clone()));

        tx.send(sent(0, 0)).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert_eq!(handle.summary().await.totals.sent_count, 1);

        cancel.cancel();
        let summary = task.await.unwrap();
        assert_eq!(summary.max_up, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_detail_dump_keeps_consuming() {
        let aggregator = Aggregator::new(1, Duration::from_secs(5)).unwrap();
        let handle = aggregator.handle();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(aggregator.run(rx, cancel.clone()));

        tx.send(sent(0, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(handle.state.lock().await.detail_reports(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.state.lock().await.detail_reports(), 1);

        tx.send(received(0, 6000, 10)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        {
            let state = handle.state.lock().await;
            assert_eq!(state.detail_reports(), 2);
            assert_eq!(state.session(0).unwrap().recv_count, 1);
        }

        cancel.cancel();
        let summary = task.await.unwrap();
        assert_eq!(summary.totals.sent_count, 1);
        assert_eq!(summary.totals.recv_count, 1);
    }
}
