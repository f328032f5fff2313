#![allow(dead_code)]

//! In-memory relay fabric implementing the public relay traits.
//!
//! Every connection gets a fabric address; datagrams are routed through a
//! shared table. A severed fabric accepts sends and delivers nothing.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use turnstress::probe::RelayTarget;
use turnstress::relay::{PacketConn, RelayAllocation, RelayConnector, RelayError};

const RELAY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
/// ChannelData header a relayed send carries on the wire.
const RELAY_FRAMING: usize = 4;

type Datagram = (Vec<u8>, SocketAddr);

pub struct Fabric {
    routes: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    next_port: AtomicU16,
    severed: bool,
    refuse_allocations: bool,
    pub allocations: AtomicUsize,
    pub delivered: AtomicUsize,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Self::build(false, false)
    }

    /// Relays allocate fine but never receive anything.
    pub fn severed() -> Arc<Self> {
        Self::build(true, false)
    }

    /// Every allocation is refused.
    pub fn refusing() -> Arc<Self> {
        Self::build(false, true)
    }

    fn build(severed: bool, refuse_allocations: bool) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
            severed,
            refuse_allocations,
            allocations: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        })
    }

    fn attach(self: &Arc<Self>, ip: IpAddr, framing: usize) -> Arc<MemConn> {
        let addr = SocketAddr::new(ip, self.next_port.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().unwrap().insert(addr, tx);
        Arc::new(MemConn {
            addr,
            framing,
            fabric: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn route(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        if self.severed {
            return;
        }
        let routes = self.routes.lock().unwrap();
        if let Some(tx) = routes.get(&to) {
            if tx.send((buf.to_vec(), from)).is_ok() {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn detach(&self, addr: SocketAddr) {
        self.routes.lock().unwrap().remove(&addr);
    }
}

pub struct MemConn {
    addr: SocketAddr,
    /// Extra bytes reported by `send_to`, like a TURN client's framed write.
    framing: usize,
    fabric: Arc<Fabric>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl PacketConn for MemConn {
    fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.addr)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, RelayError> {
        self.fabric.route(self.addr, target, buf);
        Ok(buf.len() + self.framing)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), RelayError> {
        let mut rx = self.rx.lock().await;
        let (data, from) = rx.recv().await.ok_or(RelayError::Closed)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.fabric.detach(self.addr);
        Ok(())
    }
}

struct MemAllocation {
    conn: Arc<MemConn>,
}

#[async_trait]
impl RelayAllocation for MemAllocation {
    fn relayed_addr(&self) -> SocketAddr {
        self.conn.addr
    }

    fn conn(&self) -> Arc<dyn PacketConn> {
        self.conn.clone()
    }

    async fn mapped_address(&self) -> Result<SocketAddr, RelayError> {
        // The client's reflexive IP; the port is rewritten by the probe.
        Ok(SocketAddr::new(CLIENT_IP, 9))
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.conn.close().await
    }
}

/// Relay connector backed by a [`Fabric`].
pub struct FabricConnector(pub Arc<Fabric>);

#[async_trait]
impl RelayConnector for FabricConnector {
    async fn allocate(&self, _target: &RelayTarget) -> Result<Box<dyn RelayAllocation>, RelayError> {
        self.0.allocations.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse_allocations {
            return Err(RelayError::Client("allocation quota reached".into()));
        }
        Ok(Box::new(MemAllocation {
            conn: self.0.attach(RELAY_IP, RELAY_FRAMING),
        }))
    }

    async fn bind_sender(&self) -> Result<Arc<dyn PacketConn>, RelayError> {
        Ok(self.0.attach(CLIENT_IP, 0))
    }
}
