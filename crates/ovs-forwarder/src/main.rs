//! OVS Forwarder Entry Point

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ovs_forwarder::tables::DEFAULT_CONFIG_PATH;
use ovs_forwarder::{CrossConnectRequest, Forwarder, ForwarderConfig, Primitives};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// OVS/SR-IOV cross-connect forwarder
#[derive(Parser, Debug)]
#[command(name = "ovs-forwarder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Integration bridge (overrides the configuration file)
    #[arg(short = 'b', long)]
    bridge: Option<String>,

    /// Local VXLAN endpoint address (overrides the configuration file)
    #[arg(long)]
    egress_ip: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the bridge and wait for requests until interrupted
    Serve,
    /// Run a single request or close read from a JSON file
    Apply {
        /// Cross-connect request in JSON
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Print the advertised mechanisms as JSON
    Mechanisms,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

fn load_config(args: &Args) -> Result<ForwarderConfig> {
    let mut config = ForwarderConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(bridge) = &args.bridge {
        config.bridge = bridge.clone();
    }
    if let Some(ip) = &args.egress_ip {
        config.egress_ip = Some(ip.clone());
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(target_os = "linux")]
fn host_primitives(config: &ForwarderConfig) -> Result<Primitives> {
    use nsm_fwd_common::{IpLink, LinuxNetns, OvsSwitch};

    Ok(Primitives {
        netns: Arc::new(LinuxNetns::new()),
        links: Arc::new(IpLink::with_sysfs_root(&config.sysfs_root)),
        switch: Arc::new(OvsSwitch::new()),
    })
}

#[cfg(not(target_os = "linux"))]
fn host_primitives(_config: &ForwarderConfig) -> Result<Primitives> {
    anyhow::bail!("network namespaces are only available on Linux")
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    info!(bridge = %config.bridge, egress_ip = ?config.egress_ip, "Starting ovs-forwarder");

    let prims = host_primitives(&config)?;
    let forwarder = Forwarder::new(config, prims).context("failed to set up forwarder")?;

    match args.command {
        Command::Serve => serve(&forwarder).await,
        Command::Apply { file } => apply(&forwarder, &file).await,
        Command::Mechanisms => {
            println!("{}", serde_json::to_string_pretty(&forwarder.mechanisms())?);
            Ok(())
        }
    }
}

async fn serve(forwarder: &Forwarder) -> Result<()> {
    forwarder.init().await.context("failed to initialize bridge")?;

    let mechanisms = forwarder.mechanisms();
    info!(
        local = mechanisms.local.len(),
        remote = mechanisms.remote.len(),
        "ovs-forwarder ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("Received shutdown signal, exiting");
    Ok(())
}

async fn apply(forwarder: &Forwarder, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let req: CrossConnectRequest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    let devices = forwarder
        .apply(&req)
        .await
        .with_context(|| format!("cross-connect {} failed", req.id))?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}
