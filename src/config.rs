//! # Configuration Management
//!
//! Server address, agent credentials and voice, audio framing and session timing,
//! layered from built-in defaults, an optional `config.toml` and the environment.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY, API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_AGENT__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Sections are nested with a double underscore so that field names containing a
//! single underscore (`system_instruction`, `chunk_size`) survive the mapping.

use crate::audio::codec::FrameFormat;
use crate::transport::SessionSetup;
use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared between the HTTP handlers, the controller and the connector.
///
/// Readers take a snapshot (`config.read().clone()`) and act on the copy, so a
/// runtime update never changes a session that is already running.
pub type SharedConfig = Arc<RwLock<AppConfig>>;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, agent, audio, session)
/// keeps each concern small and lets the dashboard update one group at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Where the local control surface listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The remote conversational agent and the fixed session configuration sent at connect time.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional agent channel (`ws://` or `wss://`)
/// - `api_key`: appended to the endpoint as the `key` query parameter, never echoed back
/// - `model`: model resource name requested in the setup message
/// - `voice`: prebuilt synthesized voice
/// - `system_instruction`: instruction text for the agent
/// - `input_transcription` / `output_transcription`: stream user / agent transcript deltas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Audio device and framing settings.
///
/// ## Fields:
/// - `backend`: "auto", "virtual" or "cpal" (see `device::BackendPreference`)
/// - `capture_sample_rate`: microphone rate sent upstream (16 kHz)
/// - `playback_sample_rate`: rate of synthesized speech coming back (24 kHz)
/// - `channels`: channel count for both directions (mono)
/// - `chunk_size`: samples per outbound frame (4096 = 256 ms at 16 kHz)
/// - `send_queue_capacity`: outbound frames that may wait for the socket
/// - `send_horizon_ms`: queued frames older than this are dropped instead of sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub backend: String,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub channels: u16,
    pub chunk_size: usize,
    pub send_queue_capacity: usize,
    pub send_horizon_ms: u64,
}

/// Lifecycle tuning for the voice session controller.
///
/// ## Fields:
/// - `auto_retry`: reconnect once after a transient transport error
/// - `max_auto_retries`: retries allowed per user-initiated start (0 or 1)
/// - `retry_delay_ms`: wait before the automatic retry
/// - `error_display_ms`: how long an error stays visible before expiring to Idle
/// - `turn_grace_ms`: quiet period after agent audio drains before the transcript resets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub auto_retry: bool,
    pub max_auto_retries: u32,
    pub retry_delay_ms: u64,
    pub error_display_ms: u64,
    pub turn_grace_ms: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// The service starts with no configuration file at all; only the API key has to
/// come from the environment before a session can connect.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            agent: AgentConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "You are a helpful voice assistant. Keep responses concise as they are delivered via voice.".to_string(),
                input_transcription: true,
                output_transcription: true,
            },
            audio: AudioConfig {
                backend: "auto".to_string(),
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                channels: 1,
                chunk_size: 4096,
                send_queue_capacity: 32,
                send_horizon_ms: 2000,
            },
            session: SessionConfig {
                auto_retry: true,
                max_auto_retries: 1,
                retry_delay_ms: 1500,
                error_display_ms: 8000,
                turn_grace_ms: 1200,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AGENT__VOICE=Puck`: Override the synthesized voice
    /// - `APP_AUDIO__BACKEND=virtual`: Run without real audio hardware
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY` / `API_KEY`: Credentials for the agent endpoint
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")) {
            settings = settings.set_override("agent.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The agent endpoint is a WebSocket URL
    /// - Sample rates, channel count, chunk size and queue capacity are non-zero
    /// - At most one automatic retry is configured (no reconnect storms)
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let endpoint = &self.agent.endpoint;
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Agent endpoint must be a ws:// or wss:// URL"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }

        if self.audio.chunk_size == 0 {
            return Err(anyhow::anyhow!("Capture chunk size must be greater than 0"));
        }

        if self.audio.send_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Send queue capacity must be greater than 0"));
        }

        if self.session.max_auto_retries > 1 {
            return Err(anyhow::anyhow!("At most one automatic retry is allowed"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON change, e.g. `{"agent": {"voice": "Puck"}}`.
    /// Server address and audio framing are fixed for the process lifetime and are
    /// ignored here. Updates apply from the next session start.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(agent) = partial_config.get("agent") {
            if let Some(model) = agent.get("model").and_then(|v| v.as_str()) {
                updated.agent.model = model.to_string();
            }
            if let Some(voice) = agent.get("voice").and_then(|v| v.as_str()) {
                updated.agent.voice = voice.to_string();
            }
            if let Some(instruction) = agent.get("system_instruction").and_then(|v| v.as_str()) {
                updated.agent.system_instruction = instruction.to_string();
            }
            if let Some(flag) = agent.get("input_transcription").and_then(|v| v.as_bool()) {
                updated.agent.input_transcription = flag;
            }
            if let Some(flag) = agent.get("output_transcription").and_then(|v| v.as_bool()) {
                updated.agent.output_transcription = flag;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(flag) = session.get("auto_retry").and_then(|v| v.as_bool()) {
                updated.session.auto_retry = flag;
            }
            if let Some(retries) = session.get("max_auto_retries").and_then(|v| v.as_u64()) {
                updated.session.max_auto_retries = u32::try_from(retries).unwrap_or(u32::MAX);
            }
            if let Some(ms) = session.get("retry_delay_ms").and_then(|v| v.as_u64()) {
                updated.session.retry_delay_ms = ms;
            }
            if let Some(ms) = session.get("error_display_ms").and_then(|v| v.as_u64()) {
                updated.session.error_display_ms = ms;
            }
            if let Some(ms) = session.get("turn_grace_ms").and_then(|v| v.as_u64()) {
                updated.session.turn_grace_ms = ms;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Format of the frames the microphone produces and the agent receives.
    pub fn capture_format(&self) -> FrameFormat {
        FrameFormat::pcm16(self.audio.capture_sample_rate, self.audio.channels)
    }

    /// Format of the synthesized speech the agent sends back.
    pub fn playback_format(&self) -> FrameFormat {
        FrameFormat::pcm16(self.audio.playback_sample_rate, self.audio.channels)
    }

    /// The transport-agnostic session configuration sent at connect time.
    pub fn session_setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.agent.model.clone(),
            voice: self.agent.voice.clone(),
            system_instruction: self.agent.system_instruction.clone(),
            input_transcription: self.agent.input_transcription,
            output_transcription: self.agent.output_transcription,
        }
    }

    pub fn send_horizon(&self) -> Duration {
        Duration::from_millis(self.audio.send_horizon_ms)
    }
}
