//! # Voice Relay - Main Application Entry Point
//!
//! A real-time voice relay: browsers stream microphone audio over a WebSocket,
//! the server forwards it to a realtime voice agent, plays the agent's answers
//! back gaplessly and lets the user interrupt (barge in) at any time. Each
//! finished conversation is mixed down into a WAV recording.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection is a cheap task, not a thread
//! - **channels**: the WebSocket actor, the relay loops and the upstream
//!   connection only talk through bounded `tokio::sync::mpsc` queues
//! - **trait objects**: `Arc<dyn UpstreamConnector>` hides the upstream transport
//!
//! ## Application Architecture:
//! - **audio**: PCM16 codecs, barge-in detection, playback scheduling, WAV mixdown
//! - **relay**: session lifecycle, upstream adapter and the session registry
//! - **recordings**: bounded in-memory store of finished conversations
//! - **config / state / error**: configuration, shared state, HTTP errors
//! - **health / handlers / middleware / websocket**: the HTTP and WebSocket surface

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod recordings;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use relay::realtime::RealtimeConnector;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from config.toml and environment variables
/// 2. **Sets up logging** with `tracing`
/// 3. **Creates shared application state** (config, metrics, sessions, recordings)
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Shuts down gracefully**: live sessions are stopped so each one still
///    produces its recording
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.upstream.endpoint.is_empty() || config.upstream.api_key.is_empty() {
        warn!("Upstream endpoint or API key not set; voice sessions will fail to connect");
    }

    let connector = Arc::new(RealtimeConnector::new(&config.upstream));
    let app_state = AppState::new(config.clone(), connector);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let data = web::Data::new(app_state.clone());
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            // Middleware executes in reverse order of registration for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route("/sessions/{session_id}", web::delete().to(handlers::stop_session))
                    .route("/recordings", web::get().to(handlers::list_recordings))
                    .route(
                        "/recordings/{session_id}",
                        web::get().to(handlers::download_recording),
                    ),
            )
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            let stopping = app_state.sessions.stop_all();
            info!(sessions = stopping, "Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls what gets logged; if unset, defaults to
/// "voice_relay=debug,actix_web=info".
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on Ctrl+C, or on SIGTERM where the platform has it.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
