//! Transport seam between probe workers and the relay protocol client.
//!
//! Workers only see [`PacketConn`], [`RelayAllocation`] and
//! [`RelayConnector`]. The production connector lives in [`turn_client`];
//! tests plug in in-memory fabrics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::probe::RelayTarget;

pub mod turn_client;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("relay client error: {0}")]
    Client(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,
}

/// Datagram socket: a plain UDP socket or a relayed connection.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// For a relayed connection this is the relayed transport address.
    fn local_addr(&self) -> Result<SocketAddr, RelayError>;

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, RelayError>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), RelayError>;

    async fn close(&self) -> Result<(), RelayError>;
}

/// A relay allocation held by one session.
#[async_trait]
pub trait RelayAllocation: Send + Sync {
    /// Server-side address peers send to in order to reach this allocation.
    fn relayed_addr(&self) -> SocketAddr;

    /// Datagram connection through the relay.
    fn conn(&self) -> Arc<dyn PacketConn>;

    /// Binding request through the relay client: our server-reflexive address.
    async fn mapped_address(&self) -> Result<SocketAddr, RelayError>;

    /// Release the client side of the allocation.
    async fn close(&self) -> Result<(), RelayError>;
}

/// Factory for relay allocations and the plain sockets that talk to them.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn allocate(&self, target: &RelayTarget) -> Result<Box<dyn RelayAllocation>, RelayError>;

    /// Ordinary UDP socket used as the single-hop sender.
    async fn bind_sender(&self) -> Result<Arc<dyn PacketConn>, RelayError>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(UdpSocket::local_addr(self)?)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, RelayError> {
        Ok(UdpSocket::send_to(self, buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), RelayError> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }

    async fn close(&self) -> Result<(), RelayError> {
        // The descriptor is released when the last handle drops.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SharedConn
// ---------------------------------------------------------------------------

/// Reference-counted connection shared by a send loop and a receive loop.
///
/// `close` runs the underlying close exactly once no matter how many
/// clones call it; pending and future `recv_from`/`send_to` calls observe
/// the closure as [`RelayError::Closed`].
#[derive(Clone)]
pub struct SharedConn {
    inner: Arc<dyn PacketConn>,
    closed: CancellationToken,
    close_started: Arc<AtomicBool>,
}

impl SharedConn {
    pub fn new(inner: Arc<dyn PacketConn>) -> Self {
        Self {
            inner,
            closed: CancellationToken::new(),
            close_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.inner.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.inner.send_to(buf, target).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), RelayError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RelayError::Closed),
            res = self.inner.recv_from(buf) => res,
        }
    }

    /// Close the connection. Returns `false` if another handle got there first.
    pub async fn close(&self) -> Result<bool, RelayError> {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.closed.cancel();
        self.inner.close().await?;
        Ok(true)
    }
}
