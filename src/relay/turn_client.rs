//! [`RelayConnector`] backed by the webrtc-rs `turn` client.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;
use turn::client::{Client, ClientConfig};
use webrtc_util::Conn;

use super::{PacketConn, RelayAllocation, RelayConnector, RelayError};
use crate::probe::RelayTarget;

/// Retransmission timeout for TURN transactions, in milliseconds.
const TURN_RTO_MS: u16 = 1000;

/// Allocates relays on a real TURN server, one UDP socket per allocation.
pub struct TurnConnector {
    realm: String,
}

impl TurnConnector {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }
}

#[async_trait]
impl RelayConnector for TurnConnector {
    async fn allocate(&self, target: &RelayTarget) -> Result<Box<dyn RelayAllocation>, RelayError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        let config = ClientConfig {
            stun_serv_addr: target.stun_addr.clone(),
            turn_serv_addr: target.turn_addr.clone(),
            username: target.username.clone(),
            password: target.password.clone(),
            realm: self.realm.clone(),
            software: String::new(),
            rto_in_ms: TURN_RTO_MS,
            conn: Arc::new(socket),
            vnet: None,
        };

        let client = Client::new(config)
            .await
            .map_err(|e| RelayError::Client(e.to_string()))?;
        client
            .listen()
            .await
            .map_err(|e| RelayError::Client(e.to_string()))?;

        let relay_conn = match client.allocate().await {
            Ok(conn) => conn,
            Err(e) => {
                if let Err(close) = client.close().await {
                    debug!(turn = %target.turn_addr, error = %close, "client close failed");
                }
                return Err(RelayError::Client(e.to_string()));
            }
        };
        let conn = relayed(relay_conn);
        let relayed_addr = conn.local_addr()?;

        debug!(turn = %target.turn_addr, relayed = %relayed_addr, "relay allocated");

        Ok(Box::new(TurnAllocation {
            client,
            conn,
            relayed_addr,
        }))
    }

    async fn bind_sender(&self) -> Result<Arc<dyn PacketConn>, RelayError> {
        Ok(Arc::new(UdpSocket::bind("0.0.0.0:0").await?))
    }
}

fn relayed<C>(conn: C) -> Arc<dyn PacketConn>
where
    C: Conn + Send + Sync + 'static,
{
    Arc::new(RelayedConn { conn })
}

/// Adapts a `webrtc_util::Conn` relay connection to [`PacketConn`].
struct RelayedConn<C> {
    conn: C,
}

#[async_trait]
impl<C> PacketConn for RelayedConn<C>
where
    C: Conn + Send + Sync + 'static,
{
    fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Conn::local_addr(&self.conn).map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, RelayError> {
        Conn::send_to(&self.conn, buf, target)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), RelayError> {
        Conn::recv_from(&self.conn, buf)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn close(&self) -> Result<(), RelayError> {
        Conn::close(&self.conn)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

struct TurnAllocation {
    client: Client,
    conn: Arc<dyn PacketConn>,
    relayed_addr: SocketAddr,
}

#[async_trait]
impl RelayAllocation for TurnAllocation {
    fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    fn conn(&self) -> Arc<dyn PacketConn> {
        self.conn.clone()
    }

    async fn mapped_address(&self) -> Result<SocketAddr, RelayError> {
        self.client
            .send_binding_request()
            .await
            .map_err(|e| RelayError::Client(e.to_string()))
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.client
            .close()
            .await
            .map_err(|e| RelayError::Client(e.to_string()))
    }
}
