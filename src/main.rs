//! # Agent Voice Backend - Main Application Entry Point
//!
//! Runs one real-time voice session between the local microphone/speaker and a
//! remote conversational agent, and exposes it to a local dashboard.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **audio**: frame codec, capture encoder, playback scheduler, output timeline
//! - **device**: audio hardware boundary (virtual and cpal backends)
//! - **transport**: the persistent channel to the remote agent
//! - **session**: the voice session controller actor, its states and transcript
//! - **handlers**, **health**, **websocket**: the HTTP/WebSocket control surface
//! - **state**, **error**: shared handler state and error responses
//!
//! ## Shutdown:
//! On SIGINT/SIGTERM the voice session is torn down first (microphone released,
//! channel closed), then the HTTP server stops.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod session;
mod state;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::{AppConfig, SharedConfig};
use device::DeviceManager;
use parking_lot::RwLock;
use session::VoiceSessionController;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::live::LiveAgentConnector;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting agent-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.agent.api_key.is_empty() {
        warn!("No agent API key configured (set GEMINI_API_KEY); sessions will fail to connect");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let backend = Arc::new(DeviceManager::from_config(&config.audio));
    let shared: SharedConfig = Arc::new(RwLock::new(config));
    let connector = Arc::new(LiveAgentConnector::new(shared.clone()));
    let voice = VoiceSessionController::spawn(shared.clone(), backend, connector);
    let app_state = AppState::new(shared, voice.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session))
                    .route("/session/acknowledge", web::post().to(handlers::acknowledge_error)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/session", web::get().to(websocket::session_websocket))
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
        signal = wait_for_shutdown() => {
            signal?;
            info!("Shutdown signal received, ending voice session...");
            if let Err(e) = voice.shutdown().await {
                warn!("Voice session controller already stopped: {}", e);
            }
            info!("Stopping HTTP server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls filtering; defaults to `agent_voice_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
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
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}
