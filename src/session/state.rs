//! # Session State
//!
//! The observable side of a voice session. `SessionState` is owned by the
//! controller; everyone else sees `SessionSnapshot` copies.
//!
//! ## Lifecycle:
//! ```text
//! Idle → AcquiringDevice → Connecting → Active(Listening ⇄ Speaking) → Closing → Idle
//!              ↓               ↓                  ↓
//!           Error ←────────────┴──────────────────┘
//!              ↓
//!            Idle (acknowledged, expired) or AcquiringDevice (one automatic retry)
//! ```

use crate::error::{DeviceError, VoiceError};
use crate::session::transcript::TranscriptTurn;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What the agent side of an active session is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveMode {
    Listening,
    Speaking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AcquiringDevice,
    Connecting,
    Active(ActiveMode),
    Closing,
    Error(ErrorReason),
}

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringDevice => "acquiring_device",
            SessionState::Connecting => "connecting",
            SessionState::Active(ActiveMode::Listening) => "listening",
            SessionState::Active(ActiveMode::Speaking) => "speaking",
            SessionState::Closing => "closing",
            SessionState::Error(_) => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active(_))
    }

    /// States that hold devices or a channel and need teardown to leave.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SessionState::AcquiringDevice | SessionState::Connecting | SessionState::Active(_)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause classification for the user-visible status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoDevice,
    PermissionDenied,
    Unsupported,
    DeviceFault,
    Transport,
    TransportClosed,
    Internal,
}

impl ErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NoDevice => "No microphone found. Please check your hardware.",
            ErrorKind::PermissionDenied => "Microphone access denied.",
            ErrorKind::Unsupported => "Microphone unavailable",
            ErrorKind::DeviceFault => "Audio device stopped working.",
            ErrorKind::Transport => "AI Connection Error",
            ErrorKind::TransportClosed => "The assistant ended the session.",
            ErrorKind::Internal => "Voice session failed.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReason {
    pub kind: ErrorKind,
    /// Short text for the dashboard.
    pub message: String,
    /// Technical detail for logs and debugging.
    pub detail: String,
    pub retryable: bool,
}

impl From<&VoiceError> for ErrorReason {
    fn from(err: &VoiceError) -> Self {
        let kind = match err {
            VoiceError::Device(DeviceError::NoDevice) => ErrorKind::NoDevice,
            VoiceError::Device(DeviceError::PermissionDenied) => ErrorKind::PermissionDenied,
            VoiceError::Device(DeviceError::Unsupported(_)) => ErrorKind::Unsupported,
            VoiceError::Device(DeviceError::Fault(_)) => ErrorKind::DeviceFault,
            VoiceError::Transport(_) | VoiceError::Protocol(_) => ErrorKind::Transport,
            VoiceError::TransportClosed => ErrorKind::TransportClosed,
            VoiceError::Decode(_) | VoiceError::ControllerUnavailable => ErrorKind::Internal,
        };
        ErrorReason {
            kind,
            message: kind.user_message().to_string(),
            detail: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PlaybackStatus {
    pub active_units: usize,
    pub clock: f64,
}

/// Per-session counters, reset at every start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
    pub frames_dropped: u64,
}

/// What the dashboard sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub is_speaking: bool,
    pub transcript: TranscriptTurn,
    pub last_error: Option<ErrorReason>,
    pub playback: PlaybackStatus,
    pub stats: SessionStats,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            is_speaking: false,
            transcript: TranscriptTurn::default(),
            last_error: None,
            playback: PlaybackStatus::default(),
            stats: SessionStats::default(),
        }
    }
}
