//! regbridge: serves ingested telemetry to a Modbus RTU master.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use regbridge_common::{DeviceRegistry, DisplayCache, IngestionGateway, LoggingConfig};
use regbridge_rtu::{ProtocolResponder, open_serial};
use regbridge_server::{BridgeConfig, HttpServer};

/// Modbus RTU register bridge.
#[derive(Parser, Debug)]
#[command(name = "regbridge")]
#[command(about = "Serves ingested telemetry to a Modbus RTU master")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "regbridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(listen) = args.listen {
        config.http.listen = listen;
        config.validate().context("Invalid --listen address")?;
    }

    if args.check {
        println!(
            "{}: ok ({} device(s))",
            args.config.display(),
            config.devices.len()
        );
        return Ok(());
    }

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    regbridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting regbridge");
    info!("Loaded configuration from {:?}", args.config);

    let registry = Arc::new(
        DeviceRegistry::new(&config.devices, config.ingest.display_precision)
            .context("Failed to build device registry")?,
    );

    // The responder cannot serve without its port.
    let transport = open_serial(&config.serial)
        .with_context(|| format!("Failed to open serial port {}", config.serial.port))?;
    info!(
        port = %config.serial.port,
        baud_rate = config.serial.baud_rate,
        devices = ?registry.device_ids().collect::<Vec<_>>(),
        "Serial port opened"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = IngestionGateway::new(Arc::clone(&registry), config.ingest)
        .with_shutdown(shutdown_rx.clone());
    let cache = DisplayCache::new(Arc::clone(&registry));

    let listen_addr = config.http.listen_addr()?;
    let http_server = HttpServer::new(gateway, cache, listen_addr).bind().await?;

    // Responder runs on its own task and owns the port.
    let responder = ProtocolResponder::new(
        transport,
        Arc::clone(&registry),
        &config.registers,
        config.serial.timeout(),
    );
    let responder_task = tokio::spawn(responder.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    info!(
        devices = config.devices.len(),
        http = %listen_addr,
        "regbridge running"
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let stats = responder_task.await;
        let _ = http_task.await;
        stats
    })
    .await;

    match stopped {
        Ok(Ok(stats)) => info!(
            frames_received = stats.frames_received,
            replies_sent = stats.replies_sent,
            exceptions_sent = stats.exceptions_sent,
            malformed_frames = stats.malformed_frames,
            ignored_frames = stats.ignored_frames,
            timeouts = stats.timeouts,
            transport_errors = stats.transport_errors,
            "Final responder statistics"
        ),
        Ok(Err(e)) => error!("Responder task failed: {}", e),
        Err(_) => error!("Timed out waiting for tasks to stop"),
    }

    info!("regbridge stopped");
    Ok(())
}
