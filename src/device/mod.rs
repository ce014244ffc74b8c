//! # Audio Device Management
//!
//! The boundary between a voice session and the machine's audio hardware.
//! A backend hands out one capture device and one playback sink per session;
//! acquisition failures are classified as `NoDevice`, `PermissionDenied` or
//! `Unsupported`.
//!
//! ## Backends:
//! - **virtual**: software devices, always available (silence in, timeline clock out)
//! - **cpal**: the default host input/output devices (cargo feature `device-cpal`)
//! - **auto**: cpal when compiled in, virtual otherwise

#[cfg(feature = "device-cpal")]
pub mod cpal_backend;
pub mod virtual_device;

use crate::audio::capture::CaptureEncoder;
use crate::audio::codec::FrameFormat;
use crate::audio::playback::{PlaybackEvent, PlaybackSink};
use crate::config::AudioConfig;
use crate::error::DeviceError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use virtual_device::VirtualBackend;

/// Which backend to use, from `audio.backend` in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// Real hardware when available, software devices otherwise
    #[default]
    Auto,
    /// Software devices only
    Virtual,
    /// Real hardware only (fails with `Unsupported` when not compiled in)
    Cpal,
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(BackendPreference::Auto),
            "virtual" | "null" | "none" => Ok(BackendPreference::Virtual),
            "cpal" | "hardware" | "system" => Ok(BackendPreference::Cpal),
            _ => Err(format!("Unknown audio backend: {}", s)),
        }
    }
}

/// A microphone acquired for one session.
///
/// Acquisition happens when the device is opened; `start` only begins delivering
/// samples to the encoder.
pub trait CaptureDevice: Send {
    fn start(&mut self, encoder: CaptureEncoder) -> Result<(), DeviceError>;

    /// Stop delivering samples. Safe to call more than once.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Give the device back to the system. Safe to call more than once.
    fn release(&mut self) -> Result<(), DeviceError>;
}

/// Source of capture devices and playback sinks.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_capture(&self, format: FrameFormat) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    fn open_playback(
        &self,
        format: FrameFormat,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Arc<dyn PlaybackSink>, DeviceError>;
}

/// Dispatches to the configured backend.
pub struct DeviceManager {
    preference: BackendPreference,
    virtual_backend: VirtualBackend,
}

impl DeviceManager {
    pub fn new(preference: BackendPreference) -> Self {
        Self {
            preference,
            virtual_backend: VirtualBackend::realtime(),
        }
    }

    /// Build from configuration, falling back to `auto` on an unknown name.
    pub fn from_config(config: &AudioConfig) -> Self {
        let preference = match config.backend.parse::<BackendPreference>() {
            Ok(preference) => preference,
            Err(_) => {
                warn!("Invalid audio backend '{}', using auto", config.backend);
                BackendPreference::Auto
            }
        };
        let manager = Self::new(preference);
        info!(preference = ?preference, backend = manager.name(), "Audio backend selected");
        manager
    }

    pub fn preference(&self) -> BackendPreference {
        self.preference
    }

    fn uses_hardware(&self) -> bool {
        match self.preference {
            BackendPreference::Virtual => false,
            BackendPreference::Cpal => true,
            BackendPreference::Auto => cfg!(feature = "device-cpal"),
        }
    }
}

impl AudioBackend for DeviceManager {
    fn name(&self) -> &'static str {
        if self.uses_hardware() {
            "cpal"
        } else {
            self.virtual_backend.name()
        }
    }

    fn open_capture(&self, format: FrameFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if !self.uses_hardware() {
            return self.virtual_backend.open_capture(format);
        }

        #[cfg(feature = "device-cpal")]
        {
            cpal_backend::CpalBackend.open_capture(format)
        }
        #[cfg(not(feature = "device-cpal"))]
        {
            Err(hardware_not_compiled())
        }
    }

    fn open_playback(
        &self,
        format: FrameFormat,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Arc<dyn PlaybackSink>, DeviceError> {
        if !self.uses_hardware() {
            return self.virtual_backend.open_playback(format, events);
        }

        #[cfg(feature = "device-cpal")]
        {
            cpal_backend::CpalBackend.open_playback(format, events)
        }
        #[cfg(not(feature = "device-cpal"))]
        {
            let _ = events;
            Err(hardware_not_compiled())
        }
    }
}

#[cfg(not(feature = "device-cpal"))]
fn hardware_not_compiled() -> DeviceError {
    DeviceError::Unsupported("built without the device-cpal feature".to_string())
}
