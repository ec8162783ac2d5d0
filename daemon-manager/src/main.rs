use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ddx_core::device::DeviceRoles;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

mod config;
mod session;

use session::Session;

/// DDX Manager CLI
///
/// Connects to a running DDX daemon, registers as a manager and issues calls
#[derive(Parser, Debug)]
#[command(name = "ddx-manager", author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Daemon host
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Daemon port (defaults to the configured port)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Name to register under
    #[arg(short, long, global = true, default_value = "ddx-manager")]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the daemon answers
    Ping,

    /// List the daemon's connections
    Devices,

    /// Call an arbitrary method
    Call {
        /// Method name
        #[arg(required = true)]
        method: String,

        /// Parameters as JSON
        #[arg(long)]
        params: Option<String>,
    },

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file location
    Path,
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(cli: &Cli) -> Result<Session> {
    let path = config::get_config_path(cli.config.as_deref())?;
    let mut config = config::load(&path)?;
    config.device.name = cli.name.clone();
    config.device.roles = DeviceRoles::MANAGER;
    let port = cli.port.unwrap_or(config.network.port);

    Session::open(&config, &cli.host, port)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", cli.host, port))
}

async fn call(session: &Session, method: &str, params: Option<Value>) -> Result<Value> {
    let response = session.call(method, params).await?;
    if response.successful {
        return Ok(response.main_val);
    }
    match response.error() {
        Some(error) => Err(anyhow!("{} failed: {}", method, error)),
        None => Err(anyhow!("{} failed: {}", method, response.main_val)),
    }
}

fn print_devices(devices: &Value) -> Result<()> {
    let devices = devices
        .as_array()
        .ok_or_else(|| anyhow!("Unexpected listDevices result: {}", devices))?;
    let width = devices
        .iter()
        .filter_map(|d| d["cid"].as_str())
        .map(str::len)
        .max()
        .unwrap_or(10);

    let role_names = |bits: u64| {
        let roles = DeviceRoles::from_bits_truncate(u8::try_from(bits).unwrap_or(0));
        roles
            .iter_names()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join("|")
    };

    println!("{}", "=== DDX Devices ===".bold());
    for device in devices {
        let cid = device["cid"].as_str().unwrap_or("?");
        let state = if device["registered"].as_bool() == Some(true) {
            "registered".green()
        } else {
            "pending".yellow()
        };
        let direction = if device["inbound"].as_bool() == Some(true) {
            "inbound"
        } else {
            "outbound"
        };
        let transport = if device["encrypted"].as_bool() == Some(true) {
            "tls".green()
        } else {
            "plain".normal()
        };
        println!(
            "  {} : {} {} {} [{}] since {}",
            format!("{:<width$}", cid, width = width).bold(),
            state,
            direction,
            transport,
            role_names(device["roles"].as_u64().unwrap_or(0)),
            device["connected_since"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    debug!("Starting ddx-manager with arguments: {:#?}", cli);

    match &cli.command {
        Commands::Ping => {
            let session = connect(&cli).await?;
            let started = Instant::now();
            call(&session, "ping", None).await?;
            println!(
                "{} answered in {:.1} ms",
                session.peer().green(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            session.close().await;
        }
        Commands::Devices => {
            let session = connect(&cli).await?;
            let devices = call(&session, "listDevices", None).await?;
            session.close().await;
            print_devices(&devices)?;
        }
        Commands::Call { method, params } => {
            let params = params
                .as_deref()
                .map(|p| serde_json::from_str::<Value>(p))
                .transpose()
                .context("--params is not valid JSON")?;
            let session = connect(&cli).await?;
            let result = call(&session, method, params).await;
            session.close().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
        }
        Commands::Config(cmd) => {
            let path = config::get_config_path(cli.config.as_deref())?;
            match cmd {
                ConfigCommands::Show => {
                    println!("{}", config::show_config(&path)?);
                }
                ConfigCommands::Init { force } => {
                    config::init_config(&path, *force)?;
                    println!("Wrote default configuration to {}", path.display().to_string().green());
                }
                ConfigCommands::Path => {
                    println!("{}", path.display());
                }
            }
        }
    }

    Ok(())
}
