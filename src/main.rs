use anyhow::{bail, Context, Result};
use beacon_core::{BeaconConfig, BeaconError, Event, LogFormat, LoggingConfig, ServiceDescriptor};
use beacon_discovery::Beacon;
use beacon_mdns::MdnsBackend;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Beacon - browse and announce mDNS/DNS-SD services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print services of a type as they appear and disappear
    Browse {
        /// Service type, e.g. _http._tcp
        service_type: String,

        /// Print one JSON object per event
        #[arg(long)]
        json: bool,
    },

    /// Announce a service until interrupted
    Announce {
        /// Instance name
        name: String,

        /// Service type, e.g. _http._tcp
        service_type: String,

        /// Service port
        port: u16,

        /// TXT record as key=value (repeatable)
        #[arg(long = "txt", value_parser = parse_txt)]
        txt: Vec<(String, String)>,

        /// Address to announce (repeatable; detected automatically when omitted)
        #[arg(long = "address")]
        addresses: Vec<IpAddr>,
    },
}

fn parse_txt(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected key=value, got '{}'", value)),
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.tracing_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match logging.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration: optional file, then BEACON__* overrides
    let mut config = BeaconConfig::from_config_builder(args.config.as_deref())
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging)?;

    let backend = Arc::new(MdnsBackend::new(&config.discovery));
    let beacon = Beacon::new(backend, &config.discovery);

    match args.command {
        Command::Browse { service_type, json } => browse(&beacon, &service_type, json).await,
        Command::Announce {
            name,
            service_type,
            port,
            txt,
            addresses,
        } => {
            let service = txt
                .into_iter()
                .fold(
                    ServiceDescriptor::builder(name, service_type)
                        .port(port)
                        .addresses(addresses),
                    |builder, (key, value)| builder.txt(key, value),
                )
                .build()
                .context("Invalid service")?;
            announce(&beacon, &service).await
        }
    }
}

async fn browse(beacon: &Beacon<MdnsBackend>, service_type: &str, json: bool) -> Result<()> {
    let mut events = beacon
        .browse(service_type)
        .with_context(|| format!("Failed to browse {}", service_type))?;
    info!(service_type = events.service_type(), "Browsing, press Ctrl-C to stop");

    loop {
        tokio::select! {
            item = events.next() => match item {
                Some(Ok(event)) => print_event(&event, json)?,
                Some(Err(e)) => {
                    print_error(&e, json)?;
                    error!(error = %e, "Discovery failed");
                    return Err(e.into());
                }
                None => {
                    warn!("Discovery ended");
                    return Ok(());
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, stopping discovery...");
                return Ok(());
            }
        }
    }
}

async fn announce(beacon: &Beacon<MdnsBackend>, service: &ServiceDescriptor) -> Result<()> {
    let registered = beacon
        .register(service)
        .with_context(|| format!("Failed to register {}", service.identity()))?
        .outcome()
        .await
        .context("Registration failed")?;
    print_event(&registered, false)?;

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, withdrawing service...");

    let withdrawn = beacon
        .unregister(service)
        .with_context(|| format!("Failed to unregister {}", service.identity()))?
        .outcome()
        .await;
    match withdrawn {
        Ok(event) => print_event(&event, false),
        Err(e @ BeaconError::UnregistrationFailed { .. }) => {
            bail!("Service may still be announced: {}", e)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_event(event: &Event, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event).context("Failed to encode event")?);
        return Ok(());
    }

    let service = event.service();
    let txt: Vec<String> = service
        .txt_records()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    println!(
        "{:<12} {:<32} {:<16} {:>5} {}",
        format!("{:?}", event.kind()).to_lowercase(),
        service.name(),
        service
            .primary_address()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string()),
        service.port(),
        txt.join(" ")
    );
    Ok(())
}

fn print_error(error: &BeaconError, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::json!({ "kind": "error", "error": error })
        );
    }
    Ok(())
}
