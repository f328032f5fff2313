//! TURN relay probes.
//!
//! Single-hop: a plain UDP sender socket sends wire probe packets to this
//! session's relay allocation; the relay connection receives and verifies
//! them.
//!
//! Double-hop: relay A sends to relay B's relayed address and relay B
//! receives, so traffic crosses the server's relay function twice with no
//! direct path between the peers.
//!
//! In both topologies a send loop and a receive loop share the connections
//! through [`SharedConn`], and the whole attempt runs under the session's
//! [`RetryPolicy`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Topology, MIN_SEND_INTERVAL};
use crate::probe::packet::{self, PacketEncoder, SENTINEL};
use crate::probe::retry::{Attempt, RetryPolicy};
use crate::probe::{ErrorCode, EventSink, ProbeSession};
use crate::relay::{RelayAllocation, RelayConnector, RelayError, SharedConn};

/// Receive buffer slack beyond the packet size, so oversize datagrams are
/// seen as size mismatches instead of being truncated to a match.
const RECV_SLACK: usize = 32;

pub struct TurnProbe {
    session: ProbeSession,
    sink: EventSink,
    connector: Arc<dyn RelayConnector>,
    retry: RetryPolicy,
    rewrite_mapped_port: bool,
}

impl TurnProbe {
    pub fn new(
        session: ProbeSession,
        sink: EventSink,
        connector: Arc<dyn RelayConnector>,
        retry: RetryPolicy,
        rewrite_mapped_port: bool,
    ) -> Self {
        Self {
            session,
            sink,
            connector,
            retry,
            rewrite_mapped_port,
        }
    }

    /// Probe until `cancel` fires, reconnecting after every failed attempt.
    pub async fn run(self, cancel: CancellationToken) {
        let this = &self;
        let token = &cancel;
        let attempts = self
            .retry
            .run(&self.sink, &cancel, move || this.attempt(token))
            .await;
        debug!(session = self.session.id, attempts, "turn probe stopped");
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Attempt {
        match self.session.topology {
            Topology::SingleHop => self.single_hop(cancel).await,
            Topology::DoubleHop => self.double_hop(cancel).await,
        }
    }

    // -----------------------------------------------------------------------
    // Single hop
    // -----------------------------------------------------------------------

    async fn single_hop(&self, cancel: &CancellationToken) -> Attempt {
        let id = self.session.id;
        let relay = match until_cancelled(cancel, self.connector.allocate(&self.session.target)).await {
            None => return Attempt::Finished,
            Some(Ok(relay)) => relay,
            Some(Err(e)) => {
                warn!(session = id, error = %e, "relay allocation failed");
                return Attempt::SetupFailed(ErrorCode::SingleHopAllocate);
            }
        };

        let outcome = self.single_hop_with(relay.as_ref(), cancel).await;
        close_allocation(id, relay.as_ref()).await;
        outcome
    }

    async fn single_hop_with(&self, relay: &dyn RelayAllocation, cancel: &CancellationToken) -> Attempt {
        let id = self.session.id;

        let sender = match self.connector.bind_sender().await {
            Ok(sender) => SharedConn::new(sender),
            Err(e) => {
                warn!(session = id, error = %e, "sender socket failed");
                return Attempt::SetupFailed(ErrorCode::SingleHopSenderSocket);
            }
        };

        let mut mapped = match until_cancelled(cancel, relay.mapped_address()).await {
            None => return Attempt::Finished,
            Some(Ok(addr)) => addr,
            Some(Err(e)) => {
                warn!(session = id, error = %e, "binding request failed");
                return Attempt::SetupFailed(ErrorCode::SingleHopBinding);
            }
        };

        if self.rewrite_mapped_port {
            match sender.local_addr() {
                Ok(local) => mapped.set_port(local.port()),
                Err(e) => {
                    warn!(session = id, error = %e, "sender socket has no local address");
                    return Attempt::SetupFailed(ErrorCode::SingleHopSenderSocket);
                }
            }
        }

        let receiver = SharedConn::new(relay.conn());
        if let Err(e) = receiver.send_to(SENTINEL, mapped).await {
            warn!(session = id, error = %e, %mapped, "permission sentinel failed");
            return Attempt::SetupFailed(ErrorCode::SingleHopPermission);
        }

        info!(
            session = id,
            relayed = %relay.relayed_addr(),
            %mapped,
            "single-hop relay ready"
        );
        self.steady_state(sender, relay.relayed_addr(), receiver, cancel)
            .await;
        Attempt::Finished
    }

    // -----------------------------------------------------------------------
    // Double hop
    // -----------------------------------------------------------------------

    async fn double_hop(&self, cancel: &CancellationToken) -> Attempt {
        let id = self.session.id;
        let target = &self.session.target;

        let relay_a = match until_cancelled(cancel, self.connector.allocate(target)).await {
            None => return Attempt::Finished,
            Some(Ok(relay)) => relay,
            Some(Err(e)) => {
                warn!(session = id, error = %e, "relay A allocation failed");
                return Attempt::SetupFailed(ErrorCode::DoubleHopAllocateA);
            }
        };

        let relay_b = match until_cancelled(cancel, self.connector.allocate(target)).await {
            None => {
                close_allocation(id, relay_a.as_ref()).await;
                return Attempt::Finished;
            }
            Some(Ok(relay)) => relay,
            Some(Err(e)) => {
                warn!(session = id, error = %e, "relay B allocation failed");
                close_allocation(id, relay_a.as_ref()).await;
                return Attempt::SetupFailed(ErrorCode::DoubleHopAllocateB);
            }
        };

        let outcome = self
            .double_hop_with(relay_a.as_ref(), relay_b.as_ref(), cancel)
            .await;
        close_allocation(id, relay_a.as_ref()).await;
        close_allocation(id, relay_b.as_ref()).await;
        outcome
    }

    async fn double_hop_with(
        &self,
        relay_a: &dyn RelayAllocation,
        relay_b: &dyn RelayAllocation,
        cancel: &CancellationToken,
    ) -> Attempt {
        let id = self.session.id;
        let addr_a = relay_a.relayed_addr();
        let addr_b = relay_b.relayed_addr();
        let conn_a = SharedConn::new(relay_a.conn());
        let conn_b = SharedConn::new(relay_b.conn());

        if let Err(e) = conn_a.send_to(SENTINEL, addr_b).await {
            warn!(session = id, error = %e, "permission A->B failed");
            return Attempt::SetupFailed(ErrorCode::DoubleHopPermissionAtoB);
        }
        if let Err(e) = conn_b.send_to(SENTINEL, addr_a).await {
            warn!(session = id, error = %e, "permission B->A failed");
            return Attempt::SetupFailed(ErrorCode::DoubleHopPermissionBtoA);
        }

        info!(session = id, relay_a = %addr_a, relay_b = %addr_b, "double-hop relays ready");
        self.steady_state(conn_a, addr_b, conn_b, cancel).await;
        Attempt::Finished
    }

    // -----------------------------------------------------------------------
    // Steady state
    // -----------------------------------------------------------------------

    /// Run the receive loop in its own task and the send loop inline, then
    /// close both connections once the send loop ends.
    async fn steady_state(
        &self,
        sender: SharedConn,
        destination: SocketAddr,
        receiver: SharedConn,
        cancel: &CancellationToken,
    ) {
        let receive = tokio::spawn(receive_loop(
            receiver.clone(),
            self.sink.clone(),
            self.session.packet_size,
        ));

        self.send_loop(&sender, destination, cancel).await;

        for conn in [&receiver, &sender] {
            if let Err(e) = conn.close().await {
                debug!(session = self.session.id, error = %e, "close failed");
            }
        }
        if let Err(e) = receive.await {
            warn!(session = self.session.id, error = %e, "receive loop panicked");
        }
    }

    async fn send_loop(&self, conn: &SharedConn, destination: SocketAddr, cancel: &CancellationToken) {
        let id = self.session.id;
        let interval = self.session.send_interval.max(MIN_SEND_INTERVAL);
        let mut encoder = match PacketEncoder::new(id, self.session.packet_size) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!(session = id, error = %e, "cannot build probe packets");
                return;
            }
        };
        // Relayed conns report bytes including TURN framing; count the payload.
        let size = encoder.size() as u64;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let datagram = encoder.encode(Utc::now());
            match conn.send_to(datagram, destination).await {
                Ok(_) => self.sink.sent(size).await,
                Err(e) => {
                    warn!(session = id, error = %e, %destination, "data send failed");
                    self.sink.error(ErrorCode::DataSend).await;
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Read, verify and report probe packets until the connection fails or is
/// closed. Integrity failures are reported and skipped.
async fn receive_loop(conn: SharedConn, sink: EventSink, packet_size: usize) {
    let id = sink.session_id();
    let mut buf = vec![0u8; packet_size + RECV_SLACK];
    let started = std::time::Instant::now();
    let mut bytes_received = 0u64;

    loop {
        let (n, from) = match conn.recv_from(&mut buf).await {
            Ok(read) => read,
            Err(RelayError::Closed) => return,
            Err(e) => {
                warn!(session = id, error = %e, "relay read failed");
                sink.error(ErrorCode::RelayRead).await;
                return;
            }
        };
        let datagram = &buf[..n];

        if packet::is_sentinel(datagram) {
            trace!(session = id, %from, "sentinel discarded");
            continue;
        }

        match packet::decode(datagram, packet_size, id) {
            Ok(pkt) => {
                let latency = (Utc::now() - pkt.sent_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                bytes_received += n as u64;
                sink.received(n as u64, latency).await;

                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    trace!(
                        session = id,
                        kbps = (8.0 * bytes_received as f64 / elapsed / 1024.0) as u64,
                        latency_ms = latency.as_millis() as u64,
                        "probe packet received"
                    );
                }
            }
            Err(e) => {
                warn!(session = id, error = %e, "probe packet rejected");
                sink.error(e.code()).await;
            }
        }
    }
}

async fn close_allocation(session: u64, relay: &dyn RelayAllocation) {
    if let Err(e) = relay.close().await {
        debug!(session, error = %e, "relay close failed");
    }
}

/// Race `fut` against the deadline; `None` when the deadline won.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
