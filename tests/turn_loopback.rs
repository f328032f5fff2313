//! Full runs through the production TURN connector against an in-process
//! webrtc-rs TURN server on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use turn::auth::{generate_auth_key, AuthHandler};
use turn::relay::relay_static::RelayAddressGeneratorStatic;
use turn::server::config::{ConnConfig, ServerConfig};
use turn::server::Server;
use webrtc_util::vnet::net::Net;

use turnstress::config::{CredentialSource, Method, StaticCredentials, Topology};
use turnstress::{Orchestrator, RunConfig, RunSummary};

const REALM: &str = "turnstress";
const USERNAME: &str = "load";
const PASSWORD: &str = "test";
const PACKET_SIZE: usize = 256;

struct StaticAuth {
    key: Vec<u8>,
}

impl AuthHandler for StaticAuth {
    fn auth_handle(
        &self,
        username: &str,
        _realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, turn::Error> {
        if username == USERNAME {
            Ok(self.key.clone())
        } else {
            Err(turn::Error::Other(format!("unknown user {}", username)))
        }
    }
}

async fn start_server() -> (Server, SocketAddr) {
    let conn = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = conn.local_addr().unwrap();

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                address: "127.0.0.1".to_owned(),
                net: Arc::new(Net::new(None)),
            }),
        }],
        realm: REALM.to_owned(),
        auth_handler: Arc::new(StaticAuth {
            key: generate_auth_key(USERNAME, REALM, PASSWORD),
        }),
        channel_bind_timeout: Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await
    .unwrap();

    (server, addr)
}

fn turn_config(server: SocketAddr, topology: Topology, password: &str) -> RunConfig {
    RunConfig {
        sessions: 2,
        method: Method::Turn,
        topology,
        duration: Duration::from_millis(1500),
        packet_size: PACKET_SIZE,
        send_interval: Duration::from_millis(20),
        credentials: CredentialSource::Static(StaticCredentials {
            turn_server: server.to_string(),
            username: USERNAME.into(),
            password: password.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn run(config: RunConfig) -> RunSummary {
    let orchestrator = Orchestrator::new(config).unwrap();
    tokio::time::timeout(Duration::from_secs(20), orchestrator.run())
        .await
        .expect("run should stop at its deadline")
        .expect("run should produce a summary")
}

fn assert_payload_accounting(summary: &RunSummary) {
    let t = &summary.totals;
    assert!(t.sent_count > 0);
    assert!(t.recv_count > 0, "nothing relayed: {}", summary);
    assert_eq!(t.sent_bytes, t.sent_count * PACKET_SIZE as u64);
    assert_eq!(t.recv_bytes, t.recv_count * PACKET_SIZE as u64);
    assert!(summary.max_up >= 1);
}

#[tokio::test]
async fn test_single_hop_through_turn_server() {
    let (server, addr) = start_server().await;

    let summary = run(turn_config(addr, Topology::SingleHop, PASSWORD)).await;
    assert_eq!(summary.observed_sessions, 2);
    assert_payload_accounting(&summary);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_double_hop_through_turn_server() {
    let (server, addr) = start_server().await;

    let summary = run(turn_config(addr, Topology::DoubleHop, PASSWORD)).await;
    assert_eq!(summary.observed_sessions, 2);
    assert_payload_accounting(&summary);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_reports_failed_setup() {
    let (server, addr) = start_server().await;

    let summary = run(turn_config(addr, Topology::SingleHop, "wrong")).await;
    let t = &summary.totals;
    assert_eq!(t.sent_count + t.recv_count, 0);
    assert!(t.error_count > 0);
    assert_eq!(summary.max_up, 0);
    assert!(!summary.succeeded());

    server.close().await.unwrap();
}
