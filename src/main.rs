//! Bulb server
//!
//! Opens the Sled store and serves the REST API until Ctrl-C.
//!
//! Usage:
//!   cargo run --bin load_data     # seed a demo user and collection
//!   JWT_SECRET=... cargo run --bin bulb_server

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bulb_server::auth::TokenCodec;
use bulb_server::config::ServerConfig;
use bulb_server::rest::{create_router, AppState};
use bulb_server::storage::Storage;

/// Console logging, plus a daily rolling file when `LOG_DIR` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(config: &ServerConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "bulb_server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, text_layer) = if config.log_json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real environment variables win.
    dotenvy::dotenv().ok();
    let config = ServerConfig::parse();
    let _guard = init_tracing(&config);

    let tokens = Arc::new(TokenCodec::new(&config.token_config())?);
    let storage = Storage::open(&config.data_dir)?;
    info!(data_dir = %config.data_dir.display(), "storage opened");

    let state = AppState::new(storage.clone(), tokens).with_hash_cost(config.bcrypt_cost);
    let app = create_router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "REST server listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.flush()?;
    info!("storage flushed, bye");
    Ok(())
}
