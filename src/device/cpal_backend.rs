//! # Hardware Audio (cpal)
//!
//! Default host input and output devices as f32 streams at the session rates.
//! No resampling happens here: a device that cannot run at the requested rate is
//! reported as `Unsupported`.
//!
//! cpal streams are not `Send`, so each stream is built, played and dropped on a
//! dedicated thread that parks until it is told to stop. The build result is sent
//! back so acquisition errors surface synchronously.

use crate::audio::capture::CaptureEncoder;
use crate::audio::codec::{AudioFrame, FrameFormat};
use crate::audio::playback::{PlaybackEvent, PlaybackSink, UnitId};
use crate::audio::timeline::TimelineMixer;
use crate::device::{AudioBackend, CaptureDevice};
use crate::error::DeviceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, PlayStreamError, StreamConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open_capture(&self, format: FrameFormat) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let slot: Arc<Mutex<Option<CaptureEncoder>>> = Arc::new(Mutex::new(None));
        let callback_slot = slot.clone();

        let stream = StreamThread::spawn("voice-capture", move || {
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
            info!(device = %device.name().unwrap_or_default(), "Opening input device");

            device
                .build_input_stream(
                    &stream_config(format),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if let Some(encoder) = callback_slot.lock().as_mut() {
                            encoder.push_samples(data);
                        }
                    },
                    |err| warn!("Audio capture error: {}", err),
                    None,
                )
                .map_err(map_build_error)
        })?;

        Ok(Box::new(CpalCapture {
            slot,
            stream: Some(stream),
        }))
    }

    fn open_playback(
        &self,
        format: FrameFormat,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Arc<dyn PlaybackSink>, DeviceError> {
        let mixer = Arc::new(Mutex::new(TimelineMixer::new(format.sample_rate, events.clone())));
        let callback_mixer = mixer.clone();
        let channels = format.channels.max(1) as usize;

        let stream = StreamThread::spawn("voice-playback", move || {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or(DeviceError::NoDevice)?;
            info!(device = %device.name().unwrap_or_default(), "Opening output device");

            device
                .build_output_stream(
                    &stream_config(format),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        callback_mixer.lock().render(data, channels);
                    },
                    move |err| {
                        let _ = events.send(PlaybackEvent::DeviceFault(err.to_string()));
                    },
                    None,
                )
                .map_err(map_build_error)
        })?;

        Ok(Arc::new(CpalOutput {
            mixer,
            stream: Mutex::new(Some(stream)),
            released: AtomicBool::new(false),
        }))
    }
}

fn stream_config(format: FrameFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn map_build_error(err: BuildStreamError) -> DeviceError {
    match err {
        BuildStreamError::DeviceNotAvailable => DeviceError::NoDevice,
        BuildStreamError::StreamConfigNotSupported => {
            DeviceError::Unsupported("stream configuration not supported by the device".to_string())
        }
        BuildStreamError::InvalidArgument => {
            DeviceError::Unsupported("invalid stream argument".to_string())
        }
        BuildStreamError::BackendSpecific { err } => classify_backend_error(err.description),
        other => DeviceError::Fault(other.to_string()),
    }
}

fn map_play_error(err: PlayStreamError) -> DeviceError {
    match err {
        PlayStreamError::DeviceNotAvailable => DeviceError::NoDevice,
        PlayStreamError::BackendSpecific { err } => classify_backend_error(err.description),
        #[allow(unreachable_patterns)]
        other => DeviceError::Fault(other.to_string()),
    }
}

/// Host APIs report a refused microphone as a free-form backend error.
fn classify_backend_error(description: String) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        DeviceError::PermissionDenied
    } else {
        DeviceError::Fault(description)
    }
}

/// A cpal stream parked on its own thread.
struct StreamThread {
    stop: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let started = build().and_then(|stream| {
                    stream.play().map_err(map_play_error)?;
                    Ok(stream)
                });
                let stream = match started {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Either an explicit stop or the owner being dropped ends the stream.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Fault(format!("failed to spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Fault("audio thread exited during setup".to_string())),
        }
    }

    fn shutdown(&mut self) -> Result<(), DeviceError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DeviceError::Fault("audio thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

struct CpalCapture {
    slot: Arc<Mutex<Option<CaptureEncoder>>>,
    stream: Option<StreamThread>,
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, encoder: CaptureEncoder) -> Result<(), DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Fault("capture device already released".to_string()));
        }
        *self.slot.lock() = Some(encoder);
        debug!("Capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.slot.lock().take();
        Ok(())
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.stop()?;
        match self.stream.take() {
            Some(mut stream) => {
                stream.shutdown()?;
                debug!("Input device released");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

struct CpalOutput {
    mixer: Arc<Mutex<TimelineMixer>>,
    stream: Mutex<Option<StreamThread>>,
    released: AtomicBool,
}

impl PlaybackSink for CpalOutput {
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
        self.mixer.lock().clear();
        let stream = self.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.shutdown()?;
            debug!("Output device released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_errors_are_recognized() {
        assert_eq!(
            classify_backend_error("Access denied by the operating system".into()),
            DeviceError::PermissionDenied
        );
        assert_eq!(
            classify_backend_error("ALSA function 'snd_pcm_open' failed".into()),
            DeviceError::Fault("ALSA function 'snd_pcm_open' failed".into())
        );
    }

    #[test]
    fn test_build_error_mapping() {
        assert_eq!(map_build_error(BuildStreamError::DeviceNotAvailable), DeviceError::NoDevice);
        assert!(matches!(
            map_build_error(BuildStreamError::StreamConfigNotSupported),
            DeviceError::Unsupported(_)
        ));
    }
}
