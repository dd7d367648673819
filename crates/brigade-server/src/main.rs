//! # `brigade-server`
//!
//! Line-delimited JSON job router built on [`brigade`].
//!
//! ## Highlights
//! - **Capability routing**: jobs go to workers declaring the requested tag.
//! - **Fair rotation**: strict round-robin per tag.
//! - **Graceful shutdown**: Ctrl+C or SIGTERM ends the session and drains
//!   open connections.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin brigade-server --release -- --server-addr 127.0.0.1:7070
//! ```

use brigade_server::server::{
    TcpDispatcher,
    config::{CliArgs, ServerConfig},
    serve,
    telemetry::init_tracing,
};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();

    let args = CliArgs::try_parse()?;
    let config = ServerConfig::try_from(args)?;

    init_tracing(config.log_format);

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&listener, &config);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    serve(listener, TcpDispatcher::new(), config, shutdown).await?;

    tracing::info!("Server shut down successfully");
    Ok(())
}

fn log_startup_info(listener: &TcpListener, config: &ServerConfig) {
    let addr = listener
        .local_addr()
        .map_or_else(|_| config.server_addr.clone(), |addr| addr.to_string());
    if cfg!(debug_assertions) {
        tracing::info!("Starting dispatcher on {} with full config: {:#?}", addr, config);
    } else {
        tracing::info!("Starting dispatcher on {}", addr);
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    shutdown.cancel();
}
