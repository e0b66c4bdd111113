//! # Voice Gateway - Main Application Entry Point
//!
//! Streaming transcription gateway in front of a cloud speech provider.
//! Browsers stream microphone audio over a WebSocket; the gateway relays it
//! over the provider's binary frame protocol and streams transcripts back.
//! Whole clips can also be posted for one-shot recognition, with a REST
//! fallback when streaming fails.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every socket and HTTP call is asynchronous
//! - **Actors**: each client WebSocket is an actix actor owning its connection
//! - **Result<T, E>**: startup fails fast with `anyhow`; request paths use typed errors
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared ASR client and stream capacity
//! - **audio**: PCM extraction from inline uploads
//! - **transcription**: frame codec, upstream session, REST client, orchestrator
//! - **websocket**: client-facing streaming bridge
//! - **handlers**: HTTP recognition endpoint and token resolution
//! - **health**: liveness and recognition counters
//! - **error**: HTTP error responses

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::AsrClient;

/// Start the gateway.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** with `tracing`
/// 3. **Builds the shared ASR client** and application state
/// 4. **Runs the HTTP server** until SIGINT or SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "ASR provider: rest={} stream={} model={}",
        config.asr.rest_base(),
        config.asr.websocket_base(),
        config.asr.model
    );
    if config.asr.api_key.trim().is_empty() {
        info!("No ASR api key configured; clients must supply their own token");
    }

    let asr = AsrClient::new(config.asr.clone())?;
    let app_state = AppState::new(config.clone(), asr);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(32 * 1024 * 1024))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/audio/asr", web::post().to(handlers::recognize))
                    .route("/audio/asr/stream", web::get().to(websocket::asr_websocket)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/asr", web::get().to(websocket::asr_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                error!("Signal handler error: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls what gets logged; the default is
/// `voice_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve when SIGTERM or SIGINT arrives.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
