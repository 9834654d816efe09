//! TCE Server
//!
//! Main entry point for the transaction coordination engine.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tce_server::{build_engine, init_logging, load_config, router, AppState, Overrides};
use tce_server::{WorkerConfig, WorkerManager};
use tracing::{error, info, warn};

/// Transaction coordination engine: OCC, locks, sagas and two-phase commit
#[derive(Parser, Debug)]
#[command(name = "tce-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tce.toml")]
    config: PathBuf,

    /// Override listen address
    #[arg(long)]
    listen: Option<String>,

    /// Override HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the saga action endpoint
    #[arg(long)]
    action_endpoint: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let overrides = Overrides {
        listen_addr: args.listen.clone(),
        http_port: args.port,
        log_level: None,
        action_endpoint: args.action_endpoint.clone(),
    };
    let config = load_config(&args.config, &overrides)?;

    init_logging(&config.logging, args.verbose);

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Configuration error: {}", e);
        }
        anyhow::bail!("invalid configuration ({} problems)", errors.len());
    }
    if args.check_config {
        info!("Configuration at {:?} is valid", args.config);
        return Ok(());
    }

    print_banner();

    let addr: SocketAddr = format!("{}:{}", config.server.listen_addr, config.server.http_port).parse()?;
    let worker_config = WorkerConfig::from_engine(&config);
    let engine = build_engine(config)?;

    let (sagas, txns) = engine.recover();
    if sagas + txns > 0 {
        info!(sagas, transactions = txns, "recovering in-flight work");
    }

    let workers = WorkerManager::new(engine.clone(), worker_config);
    let handles = workers.start();
    let worker_token = workers.cancel_token();

    let app = router(AppState::new(engine.clone()));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker_token.cancel();
    engine.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Worker exited abnormally: {}", e);
        }
    }

    info!("TCE server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

fn print_banner() {
    println!(
        r#"
  _____ ____ _____
 |_   _/ ___| ____|
   | || |   |  _|
   | || |___| |___
   |_| \____|_____|

  Transaction Coordination Engine
  Version: {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
