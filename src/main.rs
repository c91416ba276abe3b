//! Relay forwarder.
//!
//! Main entry point. Consumes the configured broker queue and forwards each
//! message to the selected REST backend until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::SecretCipher;
use relay_service::{Config, ForwarderService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DEFAULT_PASSPHRASE: &str = "my.shortest.password";

/// Forwards a durable RabbitMQ queue to a REST backend
#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the forwarder (default)
    Run,

    /// Encrypt a secret for use in the configuration file
    Encrypt {
        /// Plaintext value
        value: String,

        /// Passphrase the service decrypts with
        #[arg(long, env = "RELAY_SECRET_PASSPHRASE", default_value = DEFAULT_PASSPHRASE)]
        passphrase: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config).await,
        Command::Encrypt { value, passphrase } => {
            let encrypted = SecretCipher::new()
                .encrypt(&value, &passphrase)
                .context("Failed to encrypt value")?;
            println!("{encrypted}");
            Ok(())
        },
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from(&config_path)
        .with_context(|| format!("Invalid configuration ({})", config_path.display()))?;

    init_tracing(&config.rust_log)?;

    info!("Starting relay forwarder");
    info!(
        broker = %config.broker_endpoint_masked(),
        queue = %config.broker.queue_name,
        config_file = %config_path.display(),
        "Configuration loaded"
    );

    let service = ForwarderService::from_config(&config)?;

    let cancel = CancellationToken::new();
    let signal = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping consumer");
            cancel.cancel();
        }
    });

    service.run(cancel).await;
    signal.abort();

    info!("Relay shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(configured: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
