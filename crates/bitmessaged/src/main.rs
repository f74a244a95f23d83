//! bitmessaged - Bitmessage protocol engine daemon
//!
//! Runs the store-and-forward node: holds identities, tracks contacts and
//! subscriptions, drives the send/receive pipeline, and gossips objects
//! with peers over plain TCP.

use bitmessaged::config::Config;
use bitmessaged::server::Server;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("bitmessaged=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    info!("bitmessaged v{}", env!("CARGO_PKG_VERSION"));

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_server.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
