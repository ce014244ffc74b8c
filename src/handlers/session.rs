use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(state.session_snapshot()))
}

/// Commands are queued to the controller; progress shows up in the snapshot.
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.voice.start()?;
    Ok(accepted("start"))
}

pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.voice.stop()?;
    Ok(accepted("stop"))
}

pub async fn acknowledge_error(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.voice.acknowledge()?;
    Ok(accepted("acknowledge"))
}

fn accepted(command: &str) -> HttpResponse {
    HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "command": command,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
