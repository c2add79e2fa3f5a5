//! LoRa adapter
//!
//! Usage:
//!   lora-adapter [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   --lora-url <URL>          LoRa Server broker (default: tcp://localhost:1884)
//!   --platform-url <URL>      Platform broker (default: tcp://localhost:1883)
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lora_adapter::adapter::{Adapter, LoraSource, PlatformTarget};
use lora_adapter::config::Config;
use lora_adapter::relay::Relay;
use lora_adapter::supervisor::{termination_signal, Supervisor};
use lora_adapter::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Relay LoRa Server uplinks to the IoT platform broker
#[derive(Parser, Debug)]
#[command(name = "lora-adapter")]
#[command(version)]
#[command(about = "Relay LoRa Server uplinks to the IoT platform broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// LoRa Server broker URL
    #[arg(long)]
    lora_url: Option<String>,

    /// Platform broker URL
    #[arg(long)]
    platform_url: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG takes over when set
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file and environment
    if let Some(url) = args.lora_url {
        config.lora.url = url;
    }
    if let Some(url) = args.platform_url {
        config.platform.url = url;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));
    init_logging(log_level)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting LoRa adapter");
    // Addresses print without URL credentials
    let lora_address = config.lora.address()?;
    let platform_address = config.platform.address()?;
    info!("  LoRa Server broker: {}", lora_address);
    info!("  Platform broker: {}", platform_address);
    info!(
        "  Relay: {} -> {}",
        config.relay.uplink_topic, config.relay.relay_topic
    );

    let metrics = Arc::new(Metrics::new());

    // Platform first so the relay has somewhere to publish
    let platform = match PlatformTarget::connect(&config.platform, metrics.clone()).await {
        Ok(target) => Arc::new(target),
        Err(e) => {
            error!(
                "Failed to connect to platform broker {}: {}",
                platform_address, e
            );
            std::process::exit(1);
        }
    };

    let relay = Arc::new(Relay::new(
        platform.clone(),
        config.relay.relay_topic.clone(),
        metrics.clone(),
    ));

    let lora = match LoraSource::connect(
        &config.lora,
        config.relay.uplink_topic.clone(),
        relay,
        config.relay.dispatch_capacity,
        metrics.clone(),
    )
    .await
    {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!(
                "Failed to connect to LoRa Server broker {}: {}",
                lora_address, e
            );
            platform.close().await;
            std::process::exit(1);
        }
    };

    let supervisor = Supervisor::new(lora, platform);

    if config.metrics.enabled {
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        let metrics_server = MetricsServer::new(metrics, config.metrics.bind);
        let shutdown = supervisor.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    let cause = supervisor.run(termination_signal()).await;
    if cause.is_error() {
        error!("LoRa adapter stopped: {}", cause);
        std::process::exit(1);
    }

    info!("LoRa adapter stopped: {}", cause);
    Ok(())
}
