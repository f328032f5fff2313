//! Report formatting and derived metrics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::GlobalStats;

/// Time between two instants, zero when `last` is not after `first`.
pub fn span(first: DateTime<Utc>, last: DateTime<Utc>) -> Duration {
    (last - first).to_std().unwrap_or(Duration::ZERO)
}

/// Received throughput in kbit/s (1 kbit = 1024 bits).
pub fn kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    8.0 * bytes as f64 / secs / 1024.0
}

pub fn loss_percent(sent: u64, received: u64) -> f64 {
    if sent == 0 {
        return 0.0;
    }
    100.0 * sent.saturating_sub(received) as f64 / sent as f64
}

/// Mean latency; zero when there are no samples.
pub fn average_latency(sum: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((sum.as_nanos() / count as u128) as u64)
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Totals {
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub sent_count: u64,
    pub sent_bytes: u64,
    pub recv_count: u64,
    pub recv_bytes: u64,
    pub error_count: u64,
    #[serde(with = "humantime_serde")]
    pub latency_sum: Duration,
    pub latency_count: u64,
}

impl Totals {
    /// Earliest first-seen to latest last-seen across sessions.
    pub fn elapsed(&self) -> Duration {
        match (self.first_seen, self.last_seen) {
            (Some(first), Some(last)) => span(first, last),
            _ => Duration::ZERO,
        }
    }

    pub fn kbps(&self) -> f64 {
        kbps(self.recv_bytes, self.elapsed())
    }

    pub fn loss_percent(&self) -> f64 {
        loss_percent(self.sent_count, self.recv_count)
    }

    pub fn average_latency(&self) -> Duration {
        average_latency(self.latency_sum, self.latency_count)
    }
}

/// End-of-run result, also the value the orchestrator returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub target_sessions: u64,
    pub observed_sessions: u64,
    pub current_up: u64,
    pub max_up: u64,
    pub totals: Totals,
}

impl RunSummary {
    pub fn from_stats(stats: &GlobalStats) -> Self {
        let mut totals = Totals::default();
        for (_, s) in stats.sessions() {
            totals.first_seen = Some(totals.first_seen.map_or(s.first_seen, |t| t.min(s.first_seen)));
            totals.last_seen = Some(totals.last_seen.map_or(s.last_seen, |t| t.max(s.last_seen)));
            totals.sent_count += s.sent_count;
            totals.sent_bytes += s.sent_bytes;
            totals.recv_count += s.recv_count;
            totals.recv_bytes += s.recv_bytes;
            totals.error_count += s.error_count;
            totals.latency_sum += s.latency_sum;
            totals.latency_count += s.latency_count;
        }

        Self {
            target_sessions: stats.target_sessions(),
            observed_sessions: stats.sessions().count() as u64,
            current_up: stats.current_up(),
            max_up: stats.max_up(),
            totals,
        }
    }

    /// A run is a success if anything made it back.
    pub fn succeeded(&self) -> bool {
        self.totals.recv_count > 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        writeln!(f, "{:<20} : {}", "Target sessions", self.target_sessions)?;
        writeln!(f, "{:<20} : {}", "Observed sessions", self.observed_sessions)?;
        writeln!(f, "{:<20} : {}", "Max concurrent up", self.max_up)?;
        writeln!(f, "{:<20} : {}", "Up at end", self.current_up)?;
        writeln!(f, "{:<20} : {} ({} bytes)", "Sent", t.sent_count, t.sent_bytes)?;
        writeln!(f, "{:<20} : {} ({} bytes)", "Received", t.recv_count, t.recv_bytes)?;
        writeln!(f, "{:<20} : {}", "Errors", t.error_count)?;
        writeln!(f, "{:<20} : {:.1}s", "Elapsed", t.elapsed().as_secs_f64())?;
        writeln!(f, "{:<20} : {:.0}", "Throughput (kbps)", t.kbps())?;
        writeln!(f, "{:<20} : {:.2}%", "Loss", t.loss_percent())?;
        write!(f, "{:<20} : {:.2}ms", "Avg latency", millis(t.average_latency()))
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// One row per session.
pub fn detail_table(stats: &GlobalStats) -> String {
    let mut out = format!(
        "{:>7} | {:>8} | {:>8} | {:>12} | {:>12} | {:>8} | {:>7} | {:>6} | {:>9} | Status\n",
        "Session", "Sent", "Recv", "Sent bytes", "Recv bytes", "Kbps", "Loss %", "Errors", "Lat (ms)"
    );
    out.push_str(&format!(
        "{:-<7}-|-{:-<8}-|-{:-<8}-|-{:-<12}-|-{:-<12}-|-{:-<8}-|-{:-<7}-|-{:-<6}-|-{:-<9}-|-{:-<6}\n",
        "", "", "", "", "", "", "", "", "", ""
    ));

    for (id, s) in stats.sessions() {
        out.push_str(&format!(
            "{:>7} | {:>8} | {:>8} | {:>12} | {:>12} | {:>8.0} | {:>7.2} | {:>6} | {:>9.2} | {}\n",
            id,
            s.sent_count,
            s.recv_count,
            s.sent_bytes,
            s.recv_bytes,
            s.kbps(),
            s.loss_percent(),
            s.error_count,
            millis(s.average_latency()),
            if s.status.is_up() { "up" } else { "down" },
        ));
    }
    out
}

/// `"<prefix> from <first> to <last>(<secs> sec): success|failed, loss:..."`
pub fn one_line(prefix: &str, summary: &RunSummary) -> String {
    const STAMP: &str = "%Y-%m-%d %H:%M:%S";
    let t = &summary.totals;
    let first = t.first_seen.unwrap_or_default();
    let last = t.last_seen.unwrap_or_default();

    format!(
        "{} from {} to {}({} sec): {}, loss:{:.2}%, kbps:{}, latency:{}",
        prefix,
        first.format(STAMP),
        last.format(STAMP),
        t.elapsed().as_secs(),
        if summary.succeeded() { "success" } else { "failed" },
        t.loss_percent(),
        t.kbps() as u64,
        t.average_latency().as_millis(),
    )
}
