//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Domain errors** (`DeviceError`, `DecodeError`, `VoiceError`) describe what can
//!   go wrong inside a voice session. They are classified by cause so the controller
//!   can decide between "drop this frame", "tear the session down" and "retry once".
//! - **HTTP errors** (`AppError`) are what the local control surface returns to the
//!   dashboard. Every domain error converts into one of them.
//!
//! ## Error policy:
//! - **DecodeError**: isolated per frame. Logged, the frame is dropped, the session
//!   keeps running.
//! - **DeviceError**: surfaced to the user with a cause-specific message. Never retried.
//! - **Transport**: terminal for the current session, may trigger one automatic retry.
//! - **TransportClosed**: graceful remote close. Terminal, never retried.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures at the audio device boundary.
///
/// The first three variants are the acquisition outcomes the dashboard
/// distinguishes; `Fault` covers runtime failures (stream errors, release
/// problems) after a device was acquired.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no capture device available")]
    NoDevice,

    #[error("permission to use the capture device was denied")]
    PermissionDenied,

    #[error("audio device unsupported: {0}")]
    Unsupported(String),

    #[error("audio device fault: {0}")]
    Fault(String),
}

/// A malformed inbound audio payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("payload contains no audio data")]
    Empty,

    #[error("channel count must be at least 1")]
    ZeroChannels,

    #[error("payload length {len} is not a whole number of {channels}-channel 16-bit frames")]
    Misaligned { len: usize, channels: u16 },

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("sample rate mismatch: expected {expected} Hz, got {actual} Hz")]
    FormatMismatch { expected: u32, actual: u32 },
}

/// Umbrella error for everything a voice session can report.
#[derive(Debug, Clone, Error)]
pub enum VoiceError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("the remote agent closed the session")]
    TransportClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("voice session controller is not running")]
    ControllerUnavailable,
}

impl VoiceError {
    /// Whether an automatic reconnect is worth attempting after this error.
    ///
    /// Only channel-level failures qualify. A device that is missing or denied
    /// will still be missing or denied a second later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoiceError::Transport(_))
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

/// Errors returned by the HTTP control surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: A config update failed validation (400)
/// - **Unavailable**: The voice session controller is gone (503)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Server port cannot be 0",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<VoiceError> for AppError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::ControllerUnavailable => AppError::Unavailable(err.to_string()),
            VoiceError::Decode(_) | VoiceError::Protocol(_) => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}
