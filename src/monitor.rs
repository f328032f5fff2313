//! Periodic relay health monitor.
//!
//! Every cycle runs one double-hop session through the orchestrator and
//! reports a single verdict line. While a cycle runs, a poller reads the
//! live statistics through [`StatsHandle::one_line`](crate::stats::StatsHandle::one_line).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Method, RunConfig, Topology};
use crate::credentials::Provisioner;
use crate::orchestrator::{Orchestrator, RunError};
use crate::relay::RelayConnector;

/// Default pause between monitor cycles.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default gap between data packets in a monitor cycle.
pub const DEFAULT_MONITOR_SEND_INTERVAL: Duration = Duration::from_millis(7);

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Pause between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Stop after this many cycles; `None` runs until cancelled.
    pub cycles: Option<u64>,
    /// Leading word of every verdict line.
    pub prefix: String,
    /// How often live progress is logged during a cycle.
    pub poll: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_MONITOR_INTERVAL,
            cycles: None,
            prefix: "Calling".to_string(),
            poll: Duration::from_secs(5),
        }
    }
}

pub struct Monitor {
    base: RunConfig,
    settings: MonitorSettings,
    connector: Option<Arc<dyn RelayConnector>>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl Monitor {
    /// Force the run shape to one double-hop TURN session and validate it.
    pub fn new(mut base: RunConfig, settings: MonitorSettings) -> Result<Self, RunError> {
        base.sessions = 1;
        base.method = Method::Turn;
        base.topology = Topology::DoubleHop;
        base.validate_and_default()?;

        Ok(Self {
            base,
            settings,
            connector: None,
            provisioner: None,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Run cycles until `cancel` fires or the cycle budget is spent,
    /// handing each verdict line to `report`. Returns the cycle count.
    pub async fn run<F>(self, cancel: CancellationToken, mut report: F) -> Result<u64, RunError>
    where
        F: FnMut(&str),
    {
        info!(
            interval = %humantime::format_duration(self.settings.interval),
            duration = %humantime::format_duration(self.base.duration),
            target = %self.base.target_description(),
            "monitor started"
        );

        let mut cycle = 0u64;
        while !cancel.is_cancelled() {
            if self.settings.cycles.is_some_and(|max| cycle >= max) {
                break;
            }
            cycle += 1;

            let line = self.cycle(cycle, &cancel).await?;
            report(&line);

            if self.settings.cycles.is_some_and(|max| cycle >= max) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!(cycles = cycle, "monitor stopped");
        Ok(cycle)
    }

    async fn cycle(&self, cycle: u64, cancel: &CancellationToken) -> Result<String, RunError> {
        let mut orchestrator = Orchestrator::new(self.base.clone())?;
        if let Some(connector) = &self.connector {
            orchestrator = orchestrator.with_connector(connector.clone());
        }
        if let Some(provisioner) = &self.provisioner {
            orchestrator = orchestrator.with_provisioner(provisioner.clone());
        }

        let stats = orchestrator.stats();
        let run_cancel = cancel.child_token();

        let poller = {
            let stats = stats.clone();
            let stop = run_cancel.clone();
            let prefix = self.settings.prefix.clone();
            let poll = self.settings.poll.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = ticker.tick() => {
                            let progress = stats.one_line(&prefix).await;
                            info!(cycle, %progress, "monitor progress");
                        }
                    }
                }
            })
        };

        let outcome = orchestrator.run_until(run_cancel.clone()).await;
        run_cancel.cancel();
        if let Err(e) = poller.await {
            debug!(error = %e, "progress poller ended abnormally");
        }

        match outcome {
            Ok(_) => {}
            // Counts as a failed cycle.
            Err(RunError::Provisioning(e)) => {
                warn!(cycle, error = %e, "monitor cycle could not provision credentials");
            }
            Err(e) => return Err(e),
        }

        Ok(stats.one_line(&self.settings.prefix).await)
    }
}
