use clap::Parser;
use ddx_core::config::DdxConfig;
use ddx_core::device::DeviceRoles;
use ddx_daemon::{logging, server};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ddx-daemon", about = "DDX daemon", version)]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on every interface instead of loopback only
    #[arg(long)]
    allow_external: bool,

    /// Refuse unencrypted connections from other hosts
    #[arg(long)]
    require_encryption: bool,

    /// Name asserted during registration
    #[arg(short, long)]
    name: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose);
    info!("Starting DDX daemon");

    // Load config from file or use defaults
    let loaded = match &args.config {
        Some(path) => DdxConfig::load_from_file(path),
        None => DdxConfig::load_from_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(anyhow::anyhow!("Configuration error: {}", e));
        }
    };

    // Update config from CLI args
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if args.allow_external {
        config.network.allow_external = true;
    }
    if args.require_encryption {
        config.network.require_encryption = true;
    }
    if let Some(name) = args.name {
        config.device.name = name;
    }
    if !config.device.roles.contains(DeviceRoles::DAEMON) {
        config.device.roles |= DeviceRoles::DAEMON;
    }

    if let Err(e) = server::run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
