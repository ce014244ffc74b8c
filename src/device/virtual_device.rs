//! # Virtual Audio Devices
//!
//! Software stand-ins for a microphone and a speaker.
//!
//! Capture delivers silence every 20 ms; playback renders the timeline against the
//! wall clock. Used on machines without audio hardware.
//!
//! Test builds add a manual mode where nothing moves on its own: a `VirtualRig`
//! feeds capture samples, advances the playback clock and can make the next
//! acquisition fail.

use crate::audio::capture::CaptureEncoder;
use crate::audio::codec::{AudioFrame, FrameFormat};
use crate::audio::playback::{PlaybackEvent, PlaybackSink, UnitId};
use crate::audio::timeline::TimelineMixer;
use crate::device::{AudioBackend, CaptureDevice};
use crate::error::DeviceError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const TICK: Duration = Duration::from_millis(20);
const TICKS_PER_SECOND: u32 = 50;

pub struct VirtualBackend {
    #[cfg(test)]
    rig: Option<VirtualRig>,
}

impl VirtualBackend {
    pub fn realtime() -> Self {
        Self {
            #[cfg(test)]
            rig: None,
        }
    }

    /// A backend whose devices are driven by the returned rig.
    #[cfg(test)]
    pub fn manual() -> (Self, VirtualRig) {
        let rig = VirtualRig::default();
        (Self { rig: Some(rig.clone()) }, rig)
    }
}

impl AudioBackend for VirtualBackend {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn open_capture(&self, format: FrameFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        #[cfg(test)]
        if let Some(rig) = &self.rig {
            rig.open_capture()?;
        }

        debug!(format = %format, "Virtual capture device opened");
        Ok(Box::new(VirtualCapture {
            format,
            #[cfg(test)]
            rig: self.rig.clone(),
            ticker: None,
            released: false,
        }))
    }

    fn open_playback(
        &self,
        format: FrameFormat,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Arc<dyn PlaybackSink>, DeviceError> {
        #[cfg(test)]
        let fault_events = events.clone();
        let mixer = Arc::new(Mutex::new(TimelineMixer::new(format.sample_rate, events)));

        #[cfg(test)]
        if let Some(rig) = &self.rig {
            rig.open_playback(&mixer, fault_events)?;
        }
        let ticker = if self.is_manual() {
            None
        } else {
            Some(spawn_renderer(mixer.clone(), format)?)
        };

        debug!(format = %format, "Virtual playback device opened");
        Ok(Arc::new(VirtualOutput {
            mixer,
            #[cfg(test)]
            rig: self.rig.clone(),
            ticker: Mutex::new(ticker),
            released: AtomicBool::new(false),
        }))
    }
}

impl VirtualBackend {
    #[cfg(test)]
    fn is_manual(&self) -> bool {
        self.rig.is_some()
    }

    #[cfg(not(test))]
    fn is_manual(&self) -> bool {
        false
    }
}

fn runtime() -> Result<tokio::runtime::Handle, DeviceError> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| DeviceError::Fault(format!("virtual device needs an async runtime: {}", e)))
}

fn spawn_renderer(
    mixer: Arc<Mutex<TimelineMixer>>,
    format: FrameFormat,
) -> Result<JoinHandle<()>, DeviceError> {
    let channels = format.channels.max(1) as usize;
    let frames = (format.sample_rate / TICKS_PER_SECOND).max(1) as usize;

    Ok(runtime()?.spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        let mut block = vec![0.0f32; frames * channels];
        loop {
            interval.tick().await;
            mixer.lock().render(&mut block, channels);
        }
    }))
}

struct VirtualCapture {
    format: FrameFormat,
    #[cfg(test)]
    rig: Option<VirtualRig>,
    ticker: Option<JoinHandle<()>>,
    released: bool,
}

impl CaptureDevice for VirtualCapture {
    fn start(&mut self, mut encoder: CaptureEncoder) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::Fault("capture device already released".to_string()));
        }

        #[cfg(test)]
        if let Some(rig) = &self.rig {
            rig.state.lock().encoder = Some(encoder);
            return Ok(());
        }

        let samples = (self.format.sample_rate / TICKS_PER_SECOND).max(1) as usize
            * self.format.channels.max(1) as usize;
        self.ticker = Some(runtime()?.spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            let silence = vec![0.0f32; samples];
            loop {
                interval.tick().await;
                if !encoder.is_active() {
                    break;
                }
                encoder.push_samples(&silence);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        #[cfg(test)]
        if let Some(rig) = &self.rig {
            rig.state.lock().encoder = None;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.stop()?;
        if !self.released {
            self.released = true;
            #[cfg(test)]
            if let Some(rig) = &self.rig {
                rig.state.lock().captures_released += 1;
            }
            debug!("Virtual capture device released");
        }
        Ok(())
    }
}

struct VirtualOutput {
    mixer: Arc<Mutex<TimelineMixer>>,
    #[cfg(test)]
    rig: Option<VirtualRig>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl PlaybackSink for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn schedule(&self, unit: UnitId, start_at: f64, frame: AudioFrame) -> Result<(), DeviceError> {
        if self.released.load(Ordering::Acquire) {
            return Err(DeviceError::Fault("playback device already released".to_string()));
        }
        self.mixer.lock().schedule(unit, start_at, frame);
        Ok(())
    }

    fn cancel(&self, unit: UnitId) {
        self.mixer.lock().cancel(unit);
    }

    fn release(&self) -> Result<(), DeviceError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        self.mixer.lock().clear();
        #[cfg(test)]
        if let Some(rig) = &self.rig {
            let mut state = rig.state.lock();
            state.playbacks_released += 1;
            state.mixer = None;
            state.playback_events = None;
        }
        debug!("Virtual playback device released");
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
struct RigState {
    encoder: Option<CaptureEncoder>,
    mixer: Option<Arc<Mutex<TimelineMixer>>>,
    playback_events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
    capture_failure: Option<DeviceError>,
    playback_failure: Option<DeviceError>,
    captures_opened: usize,
    captures_released: usize,
    playbacks_released: usize,
}

/// Drives the devices of a manual `VirtualBackend`.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct VirtualRig {
    state: Arc<Mutex<RigState>>,
}

#[cfg(test)]
impl VirtualRig {
    fn open_capture(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.capture_failure.take() {
            return Err(err);
        }
        state.captures_opened += 1;
        Ok(())
    }

    fn open_playback(
        &self,
        mixer: &Arc<Mutex<TimelineMixer>>,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.playback_failure.take() {
            return Err(err);
        }
        state.mixer = Some(mixer.clone());
        state.playback_events = Some(events);
        Ok(())
    }

    /// Deliver samples to the running capture encoder, as a device callback would.
    /// Returns how many frames the encoder emitted.
    pub fn feed(&self, samples: &[f32]) -> usize {
        match self.state.lock().encoder.as_mut() {
            Some(encoder) => encoder.push_samples(samples),
            None => 0,
        }
    }

    /// Move the playback clock forward, completing units whose audio has played.
    pub fn advance(&self, secs: f64) {
        let mixer = self.state.lock().mixer.clone();
        if let Some(mixer) = mixer {
            let mut mixer = mixer.lock();
            let frames = (secs.max(0.0) * mixer.sample_rate() as f64).round() as u64;
            mixer.advance(frames);
        }
    }

    /// Make the next capture acquisition fail with `err`.
    pub fn fail_next_capture(&self, err: DeviceError) {
        self.state.lock().capture_failure = Some(err);
    }

    pub fn fail_next_playback(&self, err: DeviceError) {
        self.state.lock().playback_failure = Some(err);
    }

    /// Report an output stream failure, as a device error callback would.
    pub fn fault_playback(&self, message: &str) {
        if let Some(events) = &self.state.lock().playback_events {
            let _ = events.send(PlaybackEvent::DeviceFault(message.to_string()));
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.state
            .lock()
            .encoder
            .as_ref()
            .map(CaptureEncoder::is_active)
            .unwrap_or(false)
    }

    pub fn captures_opened(&self) -> usize {
        self.state.lock().captures_opened
    }

    pub fn captures_released(&self) -> usize {
        self.state.lock().captures_released
    }

    pub fn playbacks_released(&self) -> usize {
        self.state.lock().playbacks_released
    }
}
