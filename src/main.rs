use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use turnstress::config::{
    CredentialSource, LoggingConfig, Method, RemoteCredentials, RunConfig,
    StaticCredentials, Topology,
};
use turnstress::monitor::{Monitor, MonitorSettings, DEFAULT_MONITOR_SEND_INTERVAL};
use turnstress::Orchestrator;

#[derive(Parser)]
#[command(
    name = "turnstress",
    about = "Concurrent STUN/TURN relay load tester",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive concurrent probe sessions against a relay server
    Run {
        /// Number of concurrent sessions
        #[arg(short = 'c', long)]
        sessions: Option<u64>,

        /// Probe method
        #[arg(short = 'm', long, value_enum)]
        method: Option<MethodArg>,

        /// Relay between two allocations instead of client -> relay
        #[arg(long)]
        double_hop: bool,

        /// Print the final summary as JSON instead of tables
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Periodically run one double-hop session and print a verdict line
    Monitor {
        /// Pause between cycles
        #[arg(long, default_value = "5m")]
        interval: String,

        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,

        /// Leading word of each verdict line
        #[arg(long, default_value = "Calling")]
        prefix: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Stun,
    Turn,
}

impl From<MethodArg> for Method {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Stun => Method::Stun,
            MethodArg::Turn => Method::Turn,
        }
    }
}

#[derive(Args)]
struct CommonArgs {
    /// TOML run configuration; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total run duration (e.g. 30s, 1m30s)
    #[arg(short = 'd', long)]
    duration: Option<String>,

    /// Probe packet size in bytes (minimum 128)
    #[arg(short = 's', long)]
    packet_size: Option<usize>,

    /// Gap between probe packets (e.g. 1s, 10ms, 100us)
    #[arg(short = 'w', long)]
    send_interval: Option<String>,

    /// STUN server address (host:port)
    #[arg(long)]
    stun: Option<String>,

    /// TURN server address (host:port)
    #[arg(long)]
    turn: Option<String>,

    /// TURN username
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// TURN password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Fetch rotating credentials from a provisioning service
    #[arg(long, conflicts_with_all = ["stun", "turn", "username", "password"])]
    remote: bool,

    /// Provisioning endpoint URL
    #[arg(long, conflicts_with_all = ["stun", "turn", "username", "password"])]
    endpoint: Option<String>,

    /// Device id sent to the provisioning service
    #[arg(long, env = "TURNSTRESS_DEVICE_ID")]
    device_id: Option<String>,

    /// Access token sent to the provisioning service
    #[arg(long, env = "TURNSTRESS_TOKEN")]
    token: Option<String>,

    /// Level of the statistics log stream
    #[arg(long)]
    stats_log: Option<String>,

    /// Level of the per-session probe log stream
    #[arg(long)]
    probe_log: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl CommonArgs {
    /// Load the config file (if any) and layer flags on top.
    fn build_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };

        if let Some(d) = &self.duration {
            config.duration =
                humantime::parse_duration(d).context("invalid --duration")?;
        }
        if let Some(size) = self.packet_size {
            config.packet_size = size;
        }
        if let Some(w) = &self.send_interval {
            config.send_interval =
                humantime::parse_duration(w).context("invalid --send-interval")?;
        }

        let wants_remote = self.remote
            || self.endpoint.is_some()
            || matches!(config.credentials, CredentialSource::Remote(_));
        if wants_remote {
            let mut remote = match &config.credentials {
                CredentialSource::Remote(r) => r.clone(),
                CredentialSource::Static(_) => RemoteCredentials::default(),
            };
            override_with(&mut remote.endpoint, &self.endpoint);
            override_with(&mut remote.device_id, &self.device_id);
            override_with(&mut remote.token, &self.token);
            config.credentials = CredentialSource::Remote(remote);
        } else {
            let mut creds = match &config.credentials {
                CredentialSource::Static(s) => s.clone(),
                CredentialSource::Remote(_) => StaticCredentials::default(),
            };
            override_with(&mut creds.stun_server, &self.stun);
            override_with(&mut creds.turn_server, &self.turn);
            override_with(&mut creds.username, &self.username);
            override_with(&mut creds.password, &self.password);
            config.credentials = CredentialSource::Static(creds);
        }

        override_with(&mut config.logging.stats_level, &self.stats_log);
        override_with(&mut config.logging.probe_level, &self.probe_log);
        if self.log_json {
            config.logging.json = true;
        }

        Ok(config)
    }
}

fn override_with(field: &mut String, value: &Option<String>) {
    if let Some(v) = value {
        *field = v.clone();
    }
}

/// `RUST_LOG` wins over the configured stream levels. Logs go to stderr so
/// stdout carries only reports.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directives()));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping run");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            sessions,
            method,
            double_hop,
            json,
            common,
        } => {
            let mut config = common.build_config()?;
            if let Some(n) = sessions {
                config.sessions = n;
            }
            if let Some(m) = method {
                config.method = m.into();
            }
            if double_hop {
                config.topology = Topology::DoubleHop;
            }
            init_tracing(&config.logging);

            let orchestrator = Orchestrator::new(config)?;
            let stats = orchestrator.stats();
            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());

            let summary = orchestrator.run_until(cancel).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\n=== turnstress session detail ===");
                print!("{}", stats.detail_report().await);
                println!("\n=== turnstress summary ===");
                println!("{}", summary);
            }
        }
        Commands::Monitor {
            interval,
            cycles,
            prefix,
            common,
        } => {
            let mut config = common.build_config()?;
            if common.send_interval.is_none() && common.config.is_none() {
                config.send_interval = DEFAULT_MONITOR_SEND_INTERVAL;
            }
            init_tracing(&config.logging);

            let settings = MonitorSettings {
                interval: humantime::parse_duration(&interval)
                    .context("invalid --interval")?,
                cycles,
                prefix,
                ..Default::default()
            };
            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());

            Monitor::new(config, settings)?
                .run(cancel, |line| println!("{}", line))
                .await?;
        }
    }

    Ok(())
}
