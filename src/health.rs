use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let snapshot = state.session_snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "agent-voice-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "state": snapshot.state.as_str(),
            "session_id": snapshot.session_id,
            "is_speaking": snapshot.is_speaking,
            "last_error": snapshot.last_error.as_ref().map(|e| e.message.clone())
        },
        "agent": {
            "model": config.agent.model,
            "voice": config.agent.voice,
            "credentials_configured": !config.agent.api_key.is_empty()
        },
        "audio": {
            "backend": config.audio.backend,
            "capture_sample_rate": config.audio.capture_sample_rate,
            "playback_sample_rate": config.audio.playback_sample_rate
        }
    }))
}
