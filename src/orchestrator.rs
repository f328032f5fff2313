//! Run orchestration: one shared deadline, one aggregator, N staggered
//! probe workers.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, CredentialSource, Method, RunConfig};
use crate::credentials::{CredentialPool, HttpProvisioner, Provisioner, ProvisioningError};
use crate::probe::retry::RetryPolicy;
use crate::probe::stun::StunProbe;
use crate::probe::turn::TurnProbe;
use crate::probe::{EventSink, ProbeSession, RelayTarget};
use crate::relay::turn_client::TurnConnector;
use crate::relay::RelayConnector;
use crate::stats::{Aggregator, RunSummary, StatsError, StatsHandle};

/// How long workers get to wind down after the deadline before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("credential provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("statistics: {0}")]
    Stats(#[from] StatsError),

    #[error("aggregator task failed: {0}")]
    Aggregator(#[from] tokio::task::JoinError),
}

/// Where each dispatched session gets its server and credentials.
enum Targets {
    Fixed(RelayTarget),
    Pool(CredentialPool),
}

impl Targets {
    async fn next(&mut self, method: Method) -> Result<RelayTarget, ProvisioningError> {
        match self {
            Targets::Fixed(target) => Ok(target.clone()),
            Targets::Pool(pool) => match method {
                Method::Stun => pool.stun_target().await,
                Method::Turn => pool.next_relay().await,
            },
        }
    }
}

pub struct Orchestrator {
    config: RunConfig,
    connector: Arc<dyn RelayConnector>,
    provisioner: Option<Arc<dyn Provisioner>>,
    aggregator: Aggregator,
}

impl Orchestrator {
    /// Validate `config` and prepare a run. Nothing is started yet.
    pub fn new(mut config: RunConfig) -> Result<Self, RunError> {
        config.validate_and_default()?;
        let aggregator = Aggregator::new(config.sessions, config.tuning.report_interval)?;
        let connector = Arc::new(TurnConnector::new(config.tuning.realm.clone()));

        Ok(Self {
            config,
            connector,
            provisioner: None,
            aggregator,
        })
    }

    /// Replace the relay client, e.g. with an in-memory fabric.
    pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replace the HTTP provisioner used for remote credentials.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Reader for live statistics while the run is in progress.
    pub fn stats(&self) -> StatsHandle {
        self.aggregator.handle()
    }

    /// Run until the configured duration elapses.
    pub async fn run(self) -> Result<RunSummary, RunError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Run until the configured duration elapses or `cancel` fires.
    pub async fn run_until(self, cancel: CancellationToken) -> Result<RunSummary, RunError> {
        let Orchestrator {
            config,
            connector,
            provisioner,
            aggregator,
        } = self;

        let mut targets = match &config.credentials {
            CredentialSource::Static(creds) => Targets::Fixed(RelayTarget {
                stun_addr: creds.stun_server.clone(),
                turn_addr: creds.turn_server.clone(),
                username: creds.username.clone(),
                password: creds.password.clone(),
            }),
            CredentialSource::Remote(remote) => {
                let provisioner: Arc<dyn Provisioner> = match provisioner {
                    Some(p) => p,
                    None => Arc::new(HttpProvisioner::new(remote)?),
                };
                Targets::Pool(CredentialPool::new(provisioner))
            }
        };

        info!(
            sessions = config.sessions,
            method = %config.method,
            topology = %config.topology,
            target = %config.target_description(),
            duration = %humantime::format_duration(config.duration),
            packet_size = config.packet_size,
            interval = %humantime::format_duration(config.send_interval),
            "starting load test"
        );

        let deadline = {
            let cancel = cancel.clone();
            let duration = config.duration;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => {
                        debug!("run deadline reached");
                        cancel.cancel();
                    }
                }
            })
        };

        let (tx, rx) = mpsc::channel(config.tuning.event_queue_capacity);
        let aggregator = tokio::spawn(aggregator.run(rx, cancel.clone()));

        let retry = RetryPolicy {
            backoff: config.tuning.setup_backoff,
        };
        let mut workers = JoinSet::new();
        let mut provisioning_error = None;

        for id in 0..config.sessions {
            if cancel.is_cancelled() {
                break;
            }

            let target = match targets.next(config.method).await {
                Ok(target) => target,
                Err(e) => {
                    error!(session = id, error = %e, "credential provisioning failed, aborting run");
                    cancel.cancel();
                    provisioning_error = Some(e);
                    break;
                }
            };

            let session = ProbeSession {
                id,
                method: config.method,
                topology: config.topology,
                target,
                packet_size: config.packet_size,
                send_interval: config.send_interval,
            };
            let sink = EventSink::new(id, tx.clone());

            match session.method {
                Method::Stun => {
                    let probe = StunProbe::new(session, sink, config.tuning.stun_timeout);
                    workers.spawn(probe.run(cancel.clone()));
                }
                Method::Turn => {
                    let probe = TurnProbe::new(
                        session,
                        sink,
                        connector.clone(),
                        retry,
                        config.tuning.rewrite_mapped_port,
                    );
                    workers.spawn(probe.run(cancel.clone()));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.tuning.stagger) => {}
            }
        }
        drop(tx);
        info!(dispatched = workers.len(), "sessions dispatched");

        let summary = aggregator.await?;
        deadline.abort();

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "probe worker failed");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(remaining = workers.len(), "aborting workers that outlived the deadline");
            workers.abort_all();
        }

        match provisioning_error {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }
}
