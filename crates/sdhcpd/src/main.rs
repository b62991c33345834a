use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use sd_dhcp::server::{self, ServerStats};
use sd_dhcp::{DhcpConfig, DhcpState, SharedDhcpState, unix_now};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::{RwLock, watch};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sdhcpd", about = "Simple DHCP daemon", version)]
struct Cli {
    /// Configuration file (.json, .yaml/.yml, or .toml)
    #[arg(short, long, default_value = "/etc/sdhcpd/sdhcpd.json")]
    config: PathBuf,

    /// Override the configured log file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the process id to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Stay attached to the terminal instead of relying on a supervisor
    #[arg(short, long)]
    foreground: bool,
}

/// Load and parse the configuration, picking the format by extension.
fn load_config(path: &Path) -> Result<DhcpConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
    let config = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&content).context("invalid YAML config")?,
        "toml" => toml::from_str(&content).context("invalid TOML config")?,
        _ => serde_json::from_str(&content).context("invalid JSON config")?,
    };
    Ok(config)
}

fn init_logging(cli: &Cli, config: &DhcpConfig) -> Result<()> {
    let level = match cli.verbose {
        0 => config.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| config.log_file.as_ref().map(PathBuf::from));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn wait_server(task: &mut tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(anyhow!("server task panicked: {e}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    init_logging(&cli, &config)?;
    info!(
        "sdhcpd starting ({}, {} mode)",
        cli.config.display(),
        if cli.foreground { "foreground" } else { "supervised" }
    );

    let mut inner = DhcpState::new(config).map_err(|e| anyhow!("invalid configuration: {e}"))?;
    if let Err(e) = inner.lease_store.load_from_file(unix_now()) {
        warn!("could not load lease database: {e:#}");
    }
    let state: SharedDhcpState = Arc::new(RwLock::new(inner));

    if let Some(ref pid_file) = cli.pid_file {
        std::fs::write(pid_file, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", pid_file.display()))?;
    }

    let stats = Arc::new(ServerStats::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task =
        tokio::spawn(server::run_dhcp_server(state.clone(), stats.clone(), shutdown_rx));

    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGINT])?;
    let signals_handle = signals.handle();

    let outcome = loop {
        tokio::select! {
            maybe_signal = signals.next() => match maybe_signal {
                Some(SIGHUP) => {
                    info!("SIGHUP received, reloading configuration");
                    match load_config(&cli.config) {
                        Ok(new_config) => {
                            if let Err(e) = server::apply_config(&state, new_config).await {
                                error!("reload rejected, keeping previous configuration: {e}");
                            }
                        }
                        Err(e) => error!("reload failed, keeping previous configuration: {e:#}"),
                    }
                }
                Some(signal) => {
                    info!("signal {} received, shutting down", signal);
                    let _ = shutdown_tx.send(true);
                    break wait_server(&mut server_task).await;
                }
                None => {
                    let _ = shutdown_tx.send(true);
                    break wait_server(&mut server_task).await;
                }
            },
            // the server returning on its own means a startup failure
            result = &mut server_task => {
                break match result {
                    Ok(r) => r,
                    Err(e) => Err(anyhow!("server task panicked: {e}")),
                };
            }
        }
    };

    signals_handle.close();

    if let Some(ref pid_file) = cli.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    match outcome {
        Ok(()) => {
            info!(
                "sdhcpd stopped ({} received, {} sent, {} denied)",
                stats.received(),
                stats.sent(),
                stats.denied()
            );
            Ok(())
        }
        Err(e) => {
            error!("sdhcpd exiting on error: {e:#}");
            Err(e)
        }
    }
}
