//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket connection.
//!
//! ## What lives here:
//! - **config**: the runtime configuration behind `Arc<parking_lot::RwLock<_>>`.
//!   Handlers read and update it; the voice controller snapshots it at every session start.
//! - **voice**: the handle to the voice session controller task. It is cheap to clone
//!   and all access goes through message passing, so no lock is needed around it.
//! - **start_time**: for uptime reporting.

use crate::config::{AppConfig, SharedConfig};
use crate::session::{SessionSnapshot, VoiceSessionHandle};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub voice: VoiceSessionHandle,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: SharedConfig, voice: VoiceSessionHandle) -> Self {
        Self {
            config,
            voice,
            start_time: Instant::now(),
        }
    }

    /// A copy of the current configuration. The lock is released before returning.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Validate and install a new configuration.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.voice.snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
