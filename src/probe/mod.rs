//! Probe sessions and the events they emit.
//!
//! Every worker owns one [`ProbeSession`] and reports through an
//! [`EventSink`] into the bounded queue drained by the statistics
//! aggregator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::{Method, Topology};

pub mod packet;
pub mod retry;
pub mod stun;
pub mod turn;

/// Whether a successful event counts toward sent or received traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Categorised probe failure. The numeric code is what gets logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    StunDial,
    StunSend,
    StunResponse,
    StunMappedAddress,
    StunTransactionMismatch,
    SingleHopAllocate,
    SingleHopSenderSocket,
    SingleHopBinding,
    SingleHopPermission,
    DoubleHopAllocateA,
    DoubleHopAllocateB,
    DoubleHopPermissionAtoB,
    DoubleHopPermissionBtoA,
    RelayRead,
    PacketSize,
    PacketSession,
    PacketTimestamp,
    PacketChecksum,
    DataSend,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::StunDial => 100,
            ErrorCode::StunSend => 101,
            ErrorCode::StunResponse => 200,
            ErrorCode::StunMappedAddress => 201,
            ErrorCode::StunTransactionMismatch => 202,
            ErrorCode::SingleHopAllocate => 300,
            ErrorCode::SingleHopSenderSocket => 301,
            ErrorCode::SingleHopBinding => 302,
            ErrorCode::SingleHopPermission => 303,
            ErrorCode::DoubleHopAllocateA => 400,
            ErrorCode::DoubleHopAllocateB => 401,
            ErrorCode::DoubleHopPermissionAtoB => 402,
            ErrorCode::DoubleHopPermissionBtoA => 403,
            ErrorCode::RelayRead => 1000,
            ErrorCode::PacketSize => 1001,
            ErrorCode::PacketSession => 1002,
            ErrorCode::PacketTimestamp => 1003,
            ErrorCode::PacketChecksum => 1004,
            ErrorCode::DataSend => 2000,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success(Direction),
    Error(ErrorCode),
}

/// One immutable observation flowing from a worker to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeEvent {
    pub session_id: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub bytes: u64,
    /// Only meaningful for a successful `Received` event.
    pub latency: Duration,
}

impl ProbeEvent {
    pub fn sent(session_id: u64, timestamp: DateTime<Utc>, bytes: u64) -> Self {
        Self {
            session_id,
            timestamp,
            outcome: Outcome::Success(Direction::Sent),
            bytes,
            latency: Duration::ZERO,
        }
    }

    pub fn received(
        session_id: u64,
        timestamp: DateTime<Utc>,
        bytes: u64,
        latency: Duration,
    ) -> Self {
        Self {
            session_id,
            timestamp,
            outcome: Outcome::Success(Direction::Received),
            bytes,
            latency,
        }
    }

    pub fn error(session_id: u64, timestamp: DateTime<Utc>, code: ErrorCode) -> Self {
        Self {
            session_id,
            timestamp,
            outcome: Outcome::Error(code),
            bytes: 0,
            latency: Duration::ZERO,
        }
    }
}

/// Server addresses and credentials a session connects with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayTarget {
    pub stun_addr: String,
    pub turn_addr: String,
    pub username: String,
    pub password: String,
}

/// One simulated connection under test.
#[derive(Debug, Clone)]
pub struct ProbeSession {
    pub id: u64,
    pub method: Method,
    pub topology: Topology,
    pub target: RelayTarget,
    pub packet_size: usize,
    pub send_interval: Duration,
}

/// Producer half of the probe event queue, stamped with one session id.
///
/// `emit` awaits queue capacity, so a slow aggregator throttles probing
/// instead of dropping events.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: u64,
    tx: mpsc::Sender<ProbeEvent>,
}

impl EventSink {
    pub fn new(session_id: u64, tx: mpsc::Sender<ProbeEvent>) -> Self {
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub async fn emit(&self, event: ProbeEvent) {
        // A closed queue means the run is over; nothing left to report to.
        let _ = self.tx.send(event).await;
    }

    pub async fn sent(&self, bytes: u64) {
        self.emit(ProbeEvent::sent(self.session_id, Utc::now(), bytes))
            .await
    }

    pub async fn received(&self, bytes: u64, latency: Duration) {
        self.emit(ProbeEvent::received(
            self.session_id,
            Utc::now(),
            bytes,
            latency,
        ))
        .await
    }

    pub async fn error(&self, code: ErrorCode) {
        self.emit(ProbeEvent::error(self.session_id, Utc::now(), code))
            .await
    }
}
