//! Vigil alerting service
//!
//! Provisions per-cluster health conditions from lifecycle events and
//! evaluates them against the agent health stream. Control lines (watch
//! events and health payloads) are read from stdin; see [`vigil_alerting::ingest`].

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vigil_alerting::{
    alerts::AlertLog,
    clock::{Clock, SystemClock},
    config::{AlertingConfig, LogFormat},
    ingest,
    provisioner::ClusterLifecycle,
    server::{serve_admin, AdminState},
    storage::KvClientSet,
    stream::{InMemoryStream, StreamBackbone},
};

#[derive(Parser)]
#[command(name = "vigil-alerting")]
#[command(about = "Vigil alerting service", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<String>,

    /// Admin HTTP listen address (overrides the config file)
    #[arg(long)]
    admin_addr: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AlertingConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(addr) = args.admin_addr {
        config.admin_addr = addr;
    }
    config.validate().context("Invalid configuration")?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(args.verbose, config.log_format);
    info!(
        "Starting Vigil alerting (interval {:?}, disconnect threshold {:?}, capability threshold {:?})",
        config.evaluation.evaluate_interval,
        config.evaluation.disconnect_threshold,
        config.evaluation.capability_threshold
    );

    let root = CancellationToken::new();
    let stream: Arc<dyn StreamBackbone> = Arc::new(InMemoryStream::new());
    let clients = Arc::new(KvClientSet::in_memory(config.evaluation.state_tolerance));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alerts = Arc::new(AlertLog::with_clock(clock.clone()));

    let lifecycle = ClusterLifecycle::new(
        Arc::clone(&stream),
        clients,
        alerts.clone(),
        clock,
        &config,
    )
    .await
    .context("Failed to create ingress stream")?;
    let lifecycle = Arc::new(lifecycle);
    let router = Arc::new(lifecycle.router(root.clone()));

    let addr: SocketAddr = config
        .admin_addr
        .parse()
        .context("Invalid admin address")?;
    let admin_state = AdminState {
        lifecycle: lifecycle.clone(),
        alerts,
        shutdown: root.clone(),
    };
    let admin = tokio::spawn(async move {
        if let Err(e) = serve_admin(addr, admin_state).await {
            error!("Admin HTTP server error: {}", e);
        }
    });

    let ingest_token = root.clone();
    let control = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        match ingest::run(stdin, router, stream, ingest_token).await {
            Ok(applied) => info!("Control input closed after {} lines", applied),
            Err(e) => error!("Control input failed: {:#}", e),
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    root.cancel();
    lifecycle.shutdown().await;
    // a pending stdin read never observes the token
    control.abort();
    let _ = admin.await;
    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}
