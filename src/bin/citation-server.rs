//! Citation Server - long-running service for the citation platform
//!
//! This server provides:
//! - REST API for uploads, processing status and library sync
//! - WebSocket suggestion sessions
//! - Background ingestion of queued papers
//!
//! Usage:
//!   citation-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Path to configuration file (default: config.toml)
//!   --host <HOST>        API server host (overrides config)
//!   --port <PORT>        API server port (overrides config)

use citation_engine::api::{router, AppState};
use citation_engine::config::AppConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug)]
struct ServerArgs {
    config_path: PathBuf,
    host: Option<String>,
    port: Option<u16>,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            host: None,
            port: None,
        }
    }
}

fn parse_args() -> ServerArgs {
    let mut parsed = ServerArgs::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    parsed.config_path = PathBuf::from(path);
                }
            }
            "--host" => {
                parsed.host = args.next();
            }
            "--port" => {
                if let Some(port) = args.next() {
                    if let Ok(p) = port.parse() {
                        parsed.port = Some(p);
                    }
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    parsed
}

fn print_help() {
    println!("Citation Server - real-time citation suggestion service");
    println!();
    println!("USAGE:");
    println!("    citation-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>      Path to configuration file (default: config.toml)");
    println!("    --host <HOST>        API server host (overrides config)");
    println!("    --port <PORT>        API server port (overrides config)");
    println!("    --help, -h           Print this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();

    let mut config = if args.config_path.exists() {
        AppConfig::from_file(&args.config_path)?
    } else {
        info!(
            "No configuration file at {}, using defaults",
            args.config_path.display()
        );
        AppConfig::default()
    };
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    config.validate()?;

    let bind_address = format!("{}:{}", config.api.host, config.api.port);
    let state = AppState::new(config).await?;

    // The ingestion worker runs for the whole process lifetime
    state.worker.start().await;

    let worker = state.worker.clone();
    let app = router(state);

    info!("Citation server listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the worker before the store goes away; unfinished papers are
    // left for the next run
    worker.stop().await;

    if let Err(e) = serve_result {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Citation server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install shutdown handler: {}", e);
    }
    info!("Shutdown signal received");
}
