//! nodd: permission broker daemon.
//!
//! Launches the agent, scrapes its approval prompts, relays them to
//! WebSocket observers and answers the agent with their decisions.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nod_broker::config::DEFAULT_CONFIG_FILE;
use nod_broker::journal::DEFAULT_JOURNAL_KEY;
use nod_broker::{load_file_config, resolve, Broker, CliOverrides, FileConfig, JournalVerifier};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
const SERVER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nodd", version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Permission broker for supervised CLI agents")]
struct Cli {
    /// Path to the broker configuration (nod.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Observer endpoint address (or NOD_LISTEN)
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Seconds to wait for a decision before denying (or NOD_DECISION_TIMEOUT)
    #[arg(long = "timeout-secs", value_name = "SECS")]
    timeout_secs: Option<u64>,

    /// Agent program to launch (or NOD_AGENT)
    #[arg(long, value_name = "PROGRAM")]
    agent: Option<String>,

    /// Working directory for the agent
    #[arg(long = "working-dir", value_name = "PATH")]
    working_dir: Option<PathBuf>,

    /// Append an HMAC-chained decision journal here (or NOD_JOURNAL)
    #[arg(long, value_name = "FILE")]
    journal: Option<PathBuf>,

    /// Check a journal's chain and exit
    #[arg(long = "verify-journal", value_name = "FILE")]
    verify_journal: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log filter (e.g. info, nod_broker=debug); overrides RUST_LOG
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Arguments passed to the agent
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "AGENT_ARGS")]
    agent_args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli);
    info!("{}", nod_build_info::formatted_banner("nodd", DAEMON_VERSION));

    let overrides = cli_overrides(&cli)?;
    let config_path = cli
        .config
        .clone()
        .or_else(|| env::var("NOD_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file = load_file_config(Some(&config_path)).context("failed to load configuration")?;

    if let Some(path) = &cli.verify_journal {
        return verify_journal(path, &overrides, file.as_ref());
    }

    let config = resolve(&overrides, file.as_ref()).context("invalid configuration")?;
    let broker = Broker::new(config).context("failed to initialise broker")?;

    let server = broker
        .bind()
        .await
        .context("cannot start observer endpoint")?;
    let agent = broker.launch_agent().context("cannot launch agent")?;
    if agent.is_none() {
        info!("No agent configured; serving observers only");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_handlers(shutdown_tx.clone());

    let mut server_stop = shutdown_rx.clone();
    let mut server_task = tokio::spawn(server.serve(async move {
        let _ = server_stop.wait_for(|stop| *stop).await;
    }));

    let mut stop = shutdown_rx;
    let finished_early = tokio::select! {
        _ = stop.wait_for(|stop| *stop) => None,
        result = &mut server_task => Some(result),
    };

    let _ = shutdown_tx.send(true);
    broker.shutdown(agent).await;

    let served = match finished_early {
        Some(result) => result,
        None => match tokio::time::timeout(SERVER_DRAIN, server_task).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Observer endpoint did not drain in time");
                return Ok(());
            }
        },
    };

    match served {
        Ok(Ok(())) => {
            info!("Broker stopped");
            Ok(())
        }
        Ok(Err(err)) => {
            error!("Observer endpoint failed: {}", err);
            Err(err).context("observer endpoint failed")
        }
        Err(join) => Err(anyhow!("observer endpoint task aborted: {join}")),
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None if cli.debug => EnvFilter::new("debug"),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Command-line values with their environment fallbacks folded in.
fn cli_overrides(cli: &Cli) -> Result<CliOverrides> {
    let timeout_secs = match cli.timeout_secs {
        Some(secs) => Some(secs),
        None => match env::var("NOD_DECISION_TIMEOUT") {
            Ok(raw) => Some(
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("NOD_DECISION_TIMEOUT is not a number: {raw}"))?,
            ),
            Err(_) => None,
        },
    };

    Ok(CliOverrides {
        listen: cli.listen.clone().or_else(|| env::var("NOD_LISTEN").ok()),
        timeout_secs,
        agent_program: cli.agent.clone().or_else(|| env::var("NOD_AGENT").ok()),
        agent_args: cli.agent_args.clone(),
        working_dir: cli.working_dir.clone(),
        journal: cli
            .journal
            .clone()
            .or_else(|| env::var("NOD_JOURNAL").ok().map(PathBuf::from)),
        journal_key: env::var("NOD_JOURNAL_KEY").ok(),
    })
}

fn verify_journal(
    path: &Path,
    overrides: &CliOverrides,
    file: Option<&FileConfig>,
) -> Result<()> {
    let key = overrides
        .journal_key
        .clone()
        .or_else(|| file.and_then(|f| f.journal.key.clone()))
        .unwrap_or_else(|| DEFAULT_JOURNAL_KEY.to_string());

    let valid = JournalVerifier::new(key.as_bytes())
        .verify_file(path)
        .with_context(|| format!("failed to read journal {}", path.display()))?;

    if valid {
        info!(path = %path.display(), "Journal chain intact");
        Ok(())
    } else {
        Err(anyhow!("journal {} failed verification", path.display()))
    }
}

fn spawn_signal_handlers(shutdown: Arc<watch::Sender<bool>>) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down broker");
            let _ = ctrl_c.send(true);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down broker");
                let _ = shutdown.send(true);
            }
        });
    }
}
