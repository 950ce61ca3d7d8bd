// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TINC Server
//!
//! Standalone state-sharing hub for distributed TINC applications:
//! - Registers parameters, spaces, processors, buffers and pools
//! - Relays mutations between connected clients
//! - Coordinates barrier rounds across peers
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (34450)
//! tinc-server
//!
//! # Custom port and config
//! tinc-server --port 34460 --config tinc_server_config.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use tinc::protocol::DEFAULT_PORT;
use tinc::{ServerConfig, TincServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// TINC Server - Shared parameter state for distributed applications
#[derive(Parser, Debug)]
#[command(name = "tinc-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::load_default()?
    };
    if let Some(bind) = args.bind {
        config.host = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("+----------------------------------------------------+");
    info!(
        "|       TINC Server v{:<32} |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:     {:38} |", config.listen_address());
    info!(
        "|  Path map: {:38} |",
        format!("{} host(s)", config.root_path_map.len())
    );
    info!("+----------------------------------------------------+");

    if config.port == 0 {
        config.port = DEFAULT_PORT;
    }

    let server = TincServer::new(config);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");
    server.shutdown();

    info!("TINC server stopped");
    Ok(())
}
