//! Outline Bridge command-line tool
//!
//! Validates client configurations and probes a proxy's TCP and UDP
//! reachability without a TUN device.
//!
//! ```text
//! outline-bridge-cli [--config <path> | --url <socks5-url>] [-v] [check|validate|template]
//! ```

use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use outline_bridge::{check_connectivity, new_client, BridgeError, ClientConfig, Result};
use std::path::Path;
use std::process;

#[derive(Parser)]
#[command(name = "outline-bridge-cli")]
#[command(about = "Outline Bridge - validate proxy configurations and probe reachability")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Outline Bridge Team")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Proxy URL (socks5://[user:pass@]host[:port]) used instead of a file
    #[arg(short, long, conflicts_with = "config")]
    url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Probe TCP and UDP reachability through the proxy (default)
    Check,
    /// Validate the configuration and exit
    Validate,
    /// Print a configuration template
    Template,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Check);

    if let Command::Template = command {
        match ClientConfig::new("proxy.example.com", 1080)
            .with_password("user", "change-me")
            .to_toml()
        {
            Ok(toml) => print!("{toml}"),
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
        return;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    match &cli.url {
        Some(_) => info!("Using proxy URL configuration"),
        None => info!("Loaded configuration from: {}", cli.config),
    }

    match command {
        Command::Validate => match config.validate() {
            Ok(()) => info!("Configuration for {} is valid", config.proxy_endpoint()),
            Err(e) => {
                error!("{e}");
                process::exit(1);
            }
        },
        Command::Check => {
            if let Err(e) = run_check(config).await {
                error!("{e}");
                process::exit(1);
            }
        }
        Command::Template => {}
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    if let Some(url) = &cli.url {
        return ClientConfig::from_url(url);
    }
    let path = &cli.config;
    if !Path::new(path).exists() {
        return Err(BridgeError::Config(format!(
            "Config file '{path}' not found (run 'template' to create one)"
        )));
    }
    ClientConfig::from_file(path)
}

async fn run_check(config: ClientConfig) -> Result<()> {
    let endpoint = config.proxy_endpoint();
    let client = new_client(config)?;
    debug!("Client {} created for {endpoint}", client.id());

    info!("Probing {endpoint}...");
    let result = check_connectivity(&client).await;

    match &result.tcp {
        None => info!("TCP: reachable"),
        Some(e) => warn!("TCP: {e}"),
    }
    match &result.udp {
        None => info!("UDP: reachable"),
        Some(e) => warn!("UDP: {e}"),
    }

    if let Some(e) = result.tcp {
        return Err(BridgeError::Network(e.to_string()));
    }
    if !result.is_fully_reachable() {
        warn!("Tunnels through {endpoint} should be opened with UDP disabled");
    }
    Ok(())
}
