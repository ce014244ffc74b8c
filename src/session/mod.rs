//! # Voice Session
//!
//! The state machine that ties capture, transport and playback together.
//!
//! ## Key Components:
//! - **VoiceSessionController**: actor task that owns the session lifecycle
//! - **VoiceSessionHandle**: cloneable front door used by HTTP and WebSocket handlers
//! - **TranscriptAggregator**: partial text per speaker for the current turn
//! - **SessionSnapshot**: read-only view published on every change

pub mod controller;
pub mod state;
pub mod transcript;

pub use controller::{CleanupReport, SessionEvent, VoiceSessionController, VoiceSessionHandle};
pub use state::{SessionSnapshot, SessionState};
