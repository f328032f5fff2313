//! Remote credential provisioning and the rotating credential pool.
//!
//! The allocation service hands out a STUN address plus a batch of
//! short-lived TURN credentials. Sessions consume them in order; when the
//! batch is used up the pool asks for a new one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RemoteCredentials;
use crate::probe::RelayTarget;

const PROVISION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("provisioning request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provisioning service returned HTTP {0}")]
    Status(u16),

    #[error("provisioning rejected (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("malformed provisioning response: {0}")]
    Malformed(String),

    #[error("provisioning returned no relay servers")]
    NoRelays,
}

/// One relay server with its own credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredential {
    pub turn_addr: String,
    pub username: String,
    pub password: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedServers {
    pub stun_addr: String,
    pub relays: Vec<RelayCredential>,
}

/// Source of rotating relay credentials.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> Result<ProvisionedServers, ProvisioningError>;
}

// ---------------------------------------------------------------------------
// HTTP provisioner
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvisionRequest<'a> {
    device_id: &'a str,
    token: &'a str,
}

#[derive(Deserialize)]
struct ProvisionResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: ProvisionData,
}

#[derive(Deserialize, Default)]
struct ProvisionData {
    #[serde(rename = "sessionId", default)]
    session_id: String,
    #[serde(rename = "AppIceServers", default)]
    app_ice_servers: Vec<IceServer>,
}

#[derive(Deserialize)]
struct IceServer {
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    expired: i64,
}

/// POSTs `{"deviceId", "token"}` to the allocation service.
pub struct HttpProvisioner {
    client: Client,
    endpoint: String,
    device_id: String,
    token: String,
}

impl HttpProvisioner {
    pub fn new(remote: &RemoteCredentials) -> Result<Self, ProvisioningError> {
        let client = Client::builder().timeout(PROVISION_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: remote.endpoint.clone(),
            device_id: remote.device_id.clone(),
            token: remote.token.clone(),
        })
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self) -> Result<ProvisionedServers, ProvisioningError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ProvisionRequest {
                device_id: &self.device_id,
                token: &self.token,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisioningError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let servers = parse_response(&body)?;
        info!(
            endpoint = %self.endpoint,
            stun = %servers.stun_addr,
            relays = servers.relays.len(),
            "credentials provisioned"
        );
        Ok(servers)
    }
}

/// Decode the service's JSON body into server addresses.
pub fn parse_response(body: &str) -> Result<ProvisionedServers, ProvisioningError> {
    let response: ProvisionResponse =
        serde_json::from_str(body).map_err(|e| ProvisioningError::Malformed(e.to_string()))?;

    if response.code != 0 {
        return Err(ProvisioningError::Rejected {
            code: response.code,
            message: response.message,
        });
    }
    debug!(session = %response.data.session_id, "provisioning session");

    let mut stun_addr = String::new();
    let mut relays = Vec::new();

    for server in &response.data.app_ice_servers {
        for url in &server.urls {
            match parse_ice_url(url) {
                Some(IceUrl::Turn(addr)) => relays.push(RelayCredential {
                    turn_addr: addr,
                    username: server.username.clone(),
                    password: server.password.clone(),
                    expires_at: DateTime::<Utc>::from_timestamp(server.expired, 0)
                        .filter(|_| server.expired > 0),
                }),
                Some(IceUrl::Stun(addr)) => stun_addr = addr,
                None => warn!(%url, "ignoring unsupported ICE url"),
            }
        }
    }

    let first_relay = relays.first().ok_or(ProvisioningError::NoRelays)?;
    if stun_addr.is_empty() {
        stun_addr = first_relay.turn_addr.clone();
    }

    Ok(ProvisionedServers { stun_addr, relays })
}

#[derive(Debug, PartialEq, Eq)]
enum IceUrl {
    Stun(String),
    Turn(String),
}

/// `turn:host:port?transport=udp` -> `Turn("host:port")`.
fn parse_ice_url(url: &str) -> Option<IceUrl> {
    let (scheme, rest) = url.split_once(':')?;
    let addr = rest.split('?').next().unwrap_or_default().trim_start_matches("//");
    if addr.is_empty() {
        return None;
    }
    match scheme.to_ascii_lowercase().as_str() {
        "turn" | "turns" => Some(IceUrl::Turn(addr.to_string())),
        "stun" | "stuns" => Some(IceUrl::Stun(addr.to_string())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Hands out provisioned relay credentials in order, refilling from the
/// provisioner once every entry has been used.
///
/// Only the dispatch path touches the pool, so it needs no locking.
pub struct CredentialPool {
    provisioner: Arc<dyn Provisioner>,
    servers: Option<ProvisionedServers>,
    cursor: usize,
    refills: u64,
}

impl CredentialPool {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            servers: None,
            cursor: 0,
            refills: 0,
        }
    }

    /// Number of provisioning calls made so far.
    pub fn refills(&self) -> u64 {
        self.refills
    }

    /// Next relay target, refilling first if the batch is exhausted.
    pub async fn next_relay(&mut self) -> Result<RelayTarget, ProvisioningError> {
        let exhausted = match &self.servers {
            Some(servers) => self.cursor >= servers.relays.len(),
            None => true,
        };
        if exhausted {
            self.refill().await?;
        }

        let servers = self.servers.as_ref().ok_or(ProvisioningError::NoRelays)?;
        let relay = servers
            .relays
            .get(self.cursor)
            .ok_or(ProvisioningError::NoRelays)?;
        self.cursor += 1;

        Ok(RelayTarget {
            stun_addr: servers.stun_addr.clone(),
            turn_addr: relay.turn_addr.clone(),
            username: relay.username.clone(),
            password: relay.password.clone(),
        })
    }

    /// STUN-only target. Provisions once and reuses the address after.
    pub async fn stun_target(&mut self) -> Result<RelayTarget, ProvisioningError> {
        if self.servers.is_none() {
            self.refill().await?;
        }
        let servers = self.servers.as_ref().ok_or(ProvisioningError::NoRelays)?;
        Ok(RelayTarget {
            stun_addr: servers.stun_addr.clone(),
            ..Default::default()
        })
    }

    async fn refill(&mut self) -> Result<(), ProvisioningError> {
        let servers = self.provisioner.provision().await?;
        if servers.relays.is_empty() {
            return Err(ProvisioningError::NoRelays);
        }
        self.refills += 1;
        debug!(relays = servers.relays.len(), refills = self.refills, "credential pool refilled");
        self.servers = Some(servers);
        self.cursor = 0;
        Ok(())
    }
}
