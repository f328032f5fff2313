//! STUN binding probe.
//!
//! Each iteration dials a fresh UDP socket, issues one binding request and
//! waits for the response, then sleeps the send interval. Both directions
//! are reported so the aggregator can compute loss.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stun::agent::TransactionId;
use stun::message::{Getter, Message, Setter, BINDING_REQUEST};
use stun::xoraddr::XorMappedAddress;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::config::MIN_SEND_INTERVAL;
use crate::probe::{ErrorCode, EventSink, ProbeSession};

/// Largest STUN response we expect to read.
const RESPONSE_BUF: usize = 1500;

pub struct StunProbe {
    session: ProbeSession,
    sink: EventSink,
    response_timeout: Duration,
}

impl StunProbe {
    pub fn new(session: ProbeSession, sink: EventSink, response_timeout: Duration) -> Self {
        Self {
            session,
            sink,
            response_timeout,
        }
    }

    /// Probe until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.session.send_interval.max(MIN_SEND_INTERVAL);

        loop {
            match self.probe_once().await {
                Ok(mapped) => {
                    trace!(session = self.session.id, %mapped, "binding succeeded");
                }
                Err(code) => {
                    self.sink.error(code).await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One binding transaction. Emits the `sent`/`received` events itself;
    /// the caller reports the returned error code.
    async fn probe_once(&self) -> Result<SocketAddr, ErrorCode> {
        let id = self.session.id;
        let server = self.session.target.stun_addr.as_str();

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            warn!(session = id, error = %e, "stun socket bind failed");
            ErrorCode::StunDial
        })?;
        socket.connect(server).await.map_err(|e| {
            warn!(session = id, %server, error = %e, "stun dial failed");
            ErrorCode::StunDial
        })?;

        let request = binding_request().map_err(|e| {
            warn!(session = id, error = %e, "stun request build failed");
            ErrorCode::StunSend
        })?;

        let start = Instant::now();
        socket.send(&request.raw).await.map_err(|e| {
            warn!(session = id, error = %e, "stun request send failed");
            ErrorCode::StunSend
        })?;
        self.sink.sent(request.raw.len() as u64).await;

        let mut buf = vec![0u8; RESPONSE_BUF];
        let n = match tokio::time::timeout(self.response_timeout, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!(session = id, error = %e, "stun response read failed");
                return Err(ErrorCode::StunResponse);
            }
            Err(_) => {
                warn!(session = id, timeout = ?self.response_timeout, "stun response timed out");
                return Err(ErrorCode::StunResponse);
            }
        };
        let latency = start.elapsed();

        let mut response = Message::new();
        response.raw = buf[..n].to_vec();
        response.decode().map_err(|e| {
            warn!(session = id, error = %e, "stun response undecodable");
            ErrorCode::StunResponse
        })?;

        if response.transaction_id != request.transaction_id {
            warn!(session = id, "stun transaction id differs");
            return Err(ErrorCode::StunTransactionMismatch);
        }

        let mut mapped = XorMappedAddress::default();
        mapped.get_from(&response).map_err(|e| {
            warn!(session = id, error = %e, "stun mapped address missing");
            ErrorCode::StunMappedAddress
        })?;

        self.sink.received(n as u64, latency).await;
        Ok(SocketAddr::new(mapped.ip, mapped.port))
    }
}

fn binding_request() -> Result<Message, stun::Error> {
    let mut request = Message::new();
    let setters: Vec<Box<dyn Setter>> =
        vec![Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)];
    request.build(&setters)?;
    Ok(request)
}
