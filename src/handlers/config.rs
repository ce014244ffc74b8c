use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_view(&config)
    })))
}

/// Partial update, e.g. `{"agent": {"voice": "Puck"}, "session": {"auto_retry": false}}`.
/// Changes apply from the next session start.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated, effective from the next session",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_view(&current_config)
    })))
}

/// The configuration as shown to clients. The API key is never included.
fn config_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "agent": {
            "endpoint": config.agent.endpoint,
            "api_key_configured": !config.agent.api_key.is_empty(),
            "model": config.agent.model,
            "voice": config.agent.voice,
            "system_instruction": config.agent.system_instruction,
            "input_transcription": config.agent.input_transcription,
            "output_transcription": config.agent.output_transcription
        },
        "audio": {
            "backend": config.audio.backend,
            "capture_sample_rate": config.audio.capture_sample_rate,
            "playback_sample_rate": config.audio.playback_sample_rate,
            "channels": config.audio.channels,
            "chunk_size": config.audio.chunk_size,
            "send_queue_capacity": config.audio.send_queue_capacity,
            "send_horizon_ms": config.audio.send_horizon_ms
        },
        "session": {
            "auto_retry": config.session.auto_retry,
            "max_auto_retries": config.session.max_auto_retries,
            "retry_delay_ms": config.session.retry_delay_ms,
            "error_display_ms": config.session.error_display_ms,
            "turn_grace_ms": config.session.turn_grace_ms
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_redacted() {
        let mut config = AppConfig::default();
        config.agent.api_key = "secret-key-123".to_string();

        let view = config_view(&config);
        assert!(!view.to_string().contains("secret-key-123"));
        assert_eq!(view["agent"]["api_key_configured"], json!(true));
        assert_eq!(view["audio"]["chunk_size"], json!(4096));
    }
}
