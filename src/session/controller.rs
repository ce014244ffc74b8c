//! # Voice Session Controller
//!
//! An actor task that owns the `SessionState` and every per-session resource.
//! Commands come in over an mpsc channel, snapshots go out over a watch channel,
//! lifecycle events over a broadcast channel.
//!
//! ## Event sources (one `select!` loop):
//! - user commands (`Start`, `Stop`, `Acknowledge`, `Shutdown`)
//! - the outcome of a pending connect
//! - inbound transport events
//! - playback completions and device faults
//! - timers: automatic retry, error expiry, turn grace
//!
//! Per-session channels live in `Option`s and are dropped at teardown, so an event
//! that a finished session emitted late is never applied to the next one.
//!
//! ## Closing order:
//! 1. stop capture
//! 2. flush playback
//! 3. close the transport
//! 4. release the devices
//!
//! Every step runs even if an earlier one failed. Failures are logged and reported
//! in the `CleanupReport`, never propagated.

use crate::audio::capture::{CaptureControl, CaptureEncoder};
use crate::audio::codec::{AudioFrame, FrameCodec, FrameFormat, WireFrame};
use crate::audio::playback::{PlaybackEvent, PlaybackScheduler};
use crate::config::{AppConfig, SharedConfig};
use crate::device::{AudioBackend, CaptureDevice};
use crate::error::{DecodeError, DeviceError, VoiceError};
use crate::session::state::{
    ActiveMode, ErrorReason, PlaybackStatus, SessionSnapshot, SessionState, SessionStats,
};
use crate::session::transcript::{TranscriptAggregator, TranscriptTurn};
use crate::transport::{AgentConnector, SessionHandle, Speaker, TransportEvent};
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for observers (dashboard sockets, tests).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    TranscriptUpdated(TranscriptTurn),
    CleanupCompleted(CleanupReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    StopCapture,
    FlushPlayback,
    CloseTransport,
    ReleaseDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    /// Nothing to do, e.g. capture never started.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStep {
    pub action: CleanupAction,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub session_id: Option<Uuid>,
    pub steps: Vec<CleanupStep>,
}

impl CleanupReport {
    #[cfg(test)]
    pub fn actions(&self) -> Vec<CleanupAction> {
        self.steps.iter().map(|step| step.action).collect()
    }

    pub fn is_clean(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|step| matches!(step.outcome, StepOutcome::Failed(_)))
    }

    fn record(&mut self, action: CleanupAction, result: Result<StepOutcome, String>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(message) => {
                warn!(step = ?action, error = %message, "Cleanup step failed");
                StepOutcome::Failed(message)
            }
        };
        self.steps.push(CleanupStep { action, outcome });
    }
}

enum Command {
    Start,
    Stop,
    Acknowledge,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to the controller task.
#[derive(Clone)]
pub struct VoiceSessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl VoiceSessionHandle {
    pub fn start(&self) -> Result<(), VoiceError> {
        self.send(Command::Start)
    }

    pub fn stop(&self) -> Result<(), VoiceError> {
        self.send(Command::Stop)
    }

    /// Dismiss an error and return to `Idle`.
    pub fn acknowledge(&self) -> Result<(), VoiceError> {
        self.send(Command::Acknowledge)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tear down any running session and stop the controller task.
    pub async fn shutdown(&self) -> Result<(), VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| VoiceError::ControllerUnavailable)
    }

    fn send(&self, command: Command) -> Result<(), VoiceError> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::ControllerUnavailable)
    }
}

/// Everything that exists only while a session runs.
struct ActiveSession {
    id: Uuid,
    settings: AppConfig,
    capture_device: Option<Box<dyn CaptureDevice>>,
    capture: Option<CaptureControl>,
    playback: PlaybackScheduler,
    transport: Option<SessionHandle>,
    /// `Open` arrived before the connect call returned its handle.
    open_pending: bool,
}

type ConnectOutcome = Result<SessionHandle, VoiceError>;

pub struct VoiceSessionController {
    config: SharedConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn AgentConnector>,

    state: SessionState,
    session_id: Option<Uuid>,
    transcript: TranscriptAggregator,
    last_error: Option<ErrorReason>,
    stats: SessionStats,
    retries_left: u32,
    session: Option<ActiveSession>,

    commands: mpsc::UnboundedReceiver<Command>,
    pending_connect: Option<oneshot::Receiver<ConnectOutcome>>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    playback_events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,

    retry_at: Option<Instant>,
    error_expires_at: Option<Instant>,
    turn_grace_at: Option<Instant>,

    snapshots: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl VoiceSessionController {
    /// Start the controller task and return its handle.
    pub fn spawn(
        config: SharedConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn AgentConnector>,
    ) -> VoiceSessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let controller = VoiceSessionController {
            config,
            backend,
            connector,
            state: SessionState::Idle,
            session_id: None,
            transcript: TranscriptAggregator::new(),
            last_error: None,
            stats: SessionStats::default(),
            retries_left: 0,
            session: None,
            commands: command_rx,
            pending_connect: None,
            transport_events: None,
            playback_events: None,
            retry_at: None,
            error_expires_at: None,
            turn_grace_at: None,
            snapshots: snapshot_tx,
            events: event_tx.clone(),
        };
        tokio::spawn(controller.run());

        VoiceSessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            events: event_tx,
        }
    }

    async fn run(mut self) {
        info!(backend = self.backend.name(), "Voice session controller started");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.commands.close();
                        self.handle_stop();
                        self.publish();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.handle_stop();
                        break;
                    }
                },
                outcome = connect_outcome(&mut self.pending_connect) => {
                    self.pending_connect = None;
                    self.handle_connect_outcome(outcome);
                }
                event = next_event(&mut self.transport_events) => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => self.transport_events = None,
                },
                event = next_event(&mut self.playback_events) => match event {
                    Some(event) => self.handle_playback_event(event),
                    None => self.playback_events = None,
                },
                _ = sleep_until_deadline(deadline) => self.handle_timers(),
            }

            self.publish();
        }

        info!("Voice session controller stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.handle_start(),
            Command::Stop => self.handle_stop(),
            Command::Acknowledge => self.handle_acknowledge(),
            Command::Shutdown(_) => {}
        }
    }

    fn handle_start(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Error(_) => {
                let session = self.config.read().session.clone();
                self.retries_left = if session.auto_retry {
                    session.max_auto_retries
                } else {
                    0
                };
                self.retry_at = None;
                self.error_expires_at = None;
                self.begin_attempt();
            }
            _ => debug!(state = %self.state, "Start ignored, session already running"),
        }
    }

    fn handle_stop(&mut self) {
        if self.state.is_running() {
            self.transition(SessionState::Closing);
            self.teardown();
            self.transition(SessionState::Idle);
        } else if let SessionState::Error(_) = self.state {
            self.retry_at = None;
            self.error_expires_at = None;
            self.transition(SessionState::Idle);
        }
    }

    fn handle_acknowledge(&mut self) {
        if let SessionState::Error(_) = self.state {
            self.retry_at = None;
            self.error_expires_at = None;
            self.last_error = None;
            self.transition(SessionState::Idle);
        }
    }

    /// Acquire devices and start connecting. Used for user starts and the automatic retry.
    fn begin_attempt(&mut self) {
        let settings = self.config.read().clone();
        let id = Uuid::new_v4();
        self.session_id = Some(id);
        self.transcript.reset();
        self.stats = SessionStats::default();
        self.last_error = None;
        self.transition(SessionState::AcquiringDevice);

        let mut capture_device = match self.backend.open_capture(settings.capture_format()) {
            Ok(device) => device,
            Err(err) => {
                self.fail(err.into());
                return;
            }
        };

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let sink = match self.backend.open_playback(settings.playback_format(), playback_tx) {
            Ok(sink) => sink,
            Err(err) => {
                if let Err(release_err) = capture_device.release() {
                    warn!(error = %release_err, "Failed to release capture device");
                }
                self.fail(err.into());
                return;
            }
        };
        debug!(session_id = %id, "Audio devices acquired");

        let setup = settings.session_setup();
        self.session = Some(ActiveSession {
            id,
            settings,
            capture_device: Some(capture_device),
            capture: None,
            playback: PlaybackScheduler::new(sink),
            transport: None,
            open_pending: false,
        });
        self.playback_events = Some(playback_rx);
        self.transition(SessionState::Connecting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.transport_events = Some(events_rx);
        self.pending_connect = Some(outcome_rx);

        let connector = self.connector.clone();
        tokio::spawn(async move {
            let result = connector.connect(&setup, events_tx).await;
            // The session was stopped while connecting.
            if let Err(Ok(handle)) = outcome_tx.send(result) {
                handle.close();
            }
        });
    }

    fn handle_connect_outcome(&mut self, outcome: Option<ConnectOutcome>) {
        let Some(session) = self.session.as_mut() else {
            if let Some(Ok(handle)) = outcome {
                handle.close();
            }
            return;
        };

        match outcome {
            Some(Ok(handle)) => {
                debug!("Agent channel established");
                session.transport = Some(handle);
                if session.open_pending {
                    self.activate();
                }
            }
            Some(Err(err)) => self.fail(err),
            None => self.fail(VoiceError::Transport(
                "connect task ended without a result".to_string(),
            )),
        }
    }

    /// `Connecting → Active(Listening)`: the channel is open, start the microphone.
    fn activate(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(transport) = session.transport.as_ref() else {
            return;
        };

        let (encoder, control) = CaptureEncoder::new(
            session.settings.capture_format(),
            session.settings.audio.chunk_size,
            transport.sender(),
        );
        let started = match session.capture_device.as_mut() {
            Some(device) => device.start(encoder),
            None => Err(DeviceError::Fault("capture device missing".to_string())),
        };
        session.capture = Some(control);

        match started {
            Ok(()) => {
                info!(session_id = %session.id, "Agent session open, listening");
                self.transition(SessionState::Active(ActiveMode::Listening));
            }
            Err(err) => self.fail(err.into()),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.session.is_none() {
            return;
        }
        let live = self.state == SessionState::Connecting || self.state.is_active();
        if event.is_terminal() && !live {
            trace!(state = %self.state, "Terminal transport event outside a live session ignored");
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::AudioDelta { mime_type, data } => {
                self.on_audio(mime_type.as_deref(), data)
            }
            TransportEvent::TranscriptDelta { speaker, text } => self.on_transcript(speaker, &text),
            TransportEvent::Interrupted => self.on_interrupted(),
            TransportEvent::TurnComplete => self.on_turn_complete(),
            TransportEvent::Error(reason) => self.fail(VoiceError::Transport(reason)),
            TransportEvent::Closed => self.on_closed(),
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.transport.is_none() {
            session.open_pending = true;
            return;
        }
        self.activate();
    }

    fn on_audio(&mut self, mime_type: Option<&str>, data: String) {
        if !self.state.is_active() {
            trace!(state = %self.state, "Agent audio outside an active session ignored");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        self.stats.frames_received += 1;

        let frame = match decode_agent_audio(mime_type, data, session.settings.playback_format()) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.decode_errors += 1;
                warn!(error = %err, "Dropping undecodable agent audio");
                return;
            }
        };

        match session.playback.admit(frame) {
            Ok(admission) => {
                trace!(
                    unit = %admission.unit.id,
                    ends_at = admission.unit.end(),
                    "Agent audio scheduled"
                );
                self.turn_grace_at = None;
                let listening = self.state == SessionState::Active(ActiveMode::Listening);
                if admission.speaking_started && listening {
                    self.transition(SessionState::Active(ActiveMode::Speaking));
                }
            }
            Err(err) => self.fail(err.into()),
        }
    }

    fn on_transcript(&mut self, speaker: Speaker, text: &str) {
        if !(self.state == SessionState::Connecting || self.state.is_active()) {
            return;
        }

        match speaker {
            // The user talking after the agent finished starts a new turn right away.
            Speaker::User if self.turn_grace_at.is_some() => {
                self.turn_grace_at = None;
                self.transcript.reset();
            }
            Speaker::Agent => self.turn_grace_at = None,
            Speaker::User => {}
        }

        self.transcript.push(speaker, text);
        self.emit(SessionEvent::TranscriptUpdated(self.transcript.snapshot()));
    }

    fn on_interrupted(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let flushed = session.playback.flush();
        self.transcript.interrupt();
        self.turn_grace_at = None;
        info!(flushed, "Agent interrupted by the user");

        if self.state == SessionState::Active(ActiveMode::Speaking) {
            self.transition(SessionState::Active(ActiveMode::Listening));
        }
        self.emit(SessionEvent::TranscriptUpdated(self.transcript.snapshot()));
    }

    fn on_turn_complete(&mut self) {
        let speaking = self
            .session
            .as_ref()
            .map(|session| session.playback.is_speaking())
            .unwrap_or(false);
        if self.state.is_active() && !speaking {
            self.arm_turn_grace();
        }
    }

    fn on_closed(&mut self) {
        match self.state {
            SessionState::Connecting => self.fail(VoiceError::TransportClosed),
            SessionState::Active(_) => {
                info!("Agent closed the session");
                self.transition(SessionState::Closing);
                self.teardown();
                self.transition(SessionState::Idle);
            }
            _ => {}
        }
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished(unit) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.playback.complete(unit) {
                    debug!("Agent audio drained");
                    self.arm_turn_grace();
                    if self.state == SessionState::Active(ActiveMode::Speaking) {
                        self.transition(SessionState::Active(ActiveMode::Listening));
                    }
                }
            }
            PlaybackEvent::DeviceFault(message) => {
                if self.state.is_running() {
                    self.fail(DeviceError::Fault(message).into());
                }
            }
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.turn_grace_at.is_some_and(|at| at <= now) {
            self.turn_grace_at = None;
            debug!("Turn ended");
            self.transcript.reset();
            self.emit(SessionEvent::TranscriptUpdated(self.transcript.snapshot()));
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            if let SessionState::Error(_) = self.state {
                info!("Retrying voice session");
                self.begin_attempt();
            }
        }

        if self.error_expires_at.is_some_and(|at| at <= now) {
            self.error_expires_at = None;
            if let SessionState::Error(_) = self.state {
                self.transition(SessionState::Idle);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.turn_grace_at, self.retry_at, self.error_expires_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn arm_turn_grace(&mut self) {
        let grace = self
            .session
            .as_ref()
            .map(|session| session.settings.session.turn_grace_ms)
            .unwrap_or_else(|| self.config.read().session.turn_grace_ms);
        self.turn_grace_at = Some(Instant::now() + Duration::from_millis(grace));
    }

    /// Run the closing sequence (when resources exist), then classify the error.
    fn fail(&mut self, err: VoiceError) {
        let reason = ErrorReason::from(&err);
        warn!(session_id = ?self.session_id, error = %err, "Voice session failed");

        if self.session.is_some() {
            self.transition(SessionState::Closing);
            self.teardown();
        }

        let retry = reason.retryable && self.retries_left > 0;
        self.last_error = Some(reason.clone());
        self.transition(SessionState::Error(reason));

        let timings = self.config.read().session.clone();
        if retry {
            self.retries_left -= 1;
            self.retry_at = Some(Instant::now() + Duration::from_millis(timings.retry_delay_ms));
            info!(delay_ms = timings.retry_delay_ms, "Automatic retry scheduled");
        } else {
            let display = Duration::from_millis(timings.error_display_ms);
            self.error_expires_at = Some(Instant::now() + display);
        }
    }

    /// Release everything the current session holds. Safe to call when nothing runs.
    fn teardown(&mut self) -> CleanupReport {
        self.refresh_stats();
        let Some(mut session) = self.session.take() else {
            return CleanupReport::default();
        };

        self.pending_connect = None;
        self.transport_events = None;
        self.playback_events = None;
        self.turn_grace_at = None;

        let mut report = CleanupReport {
            session_id: Some(session.id),
            steps: Vec::with_capacity(4),
        };

        let capture = session.capture.take();
        let stopped = match (&capture, session.capture_device.as_mut()) {
            (None, None) => Ok(StepOutcome::Skipped),
            (control, device) => {
                if let Some(control) = control {
                    control.deactivate();
                }
                match device {
                    Some(device) => device
                        .stop()
                        .map(|_| StepOutcome::Done)
                        .map_err(|e| e.to_string()),
                    None => Ok(StepOutcome::Done),
                }
            }
        };
        report.record(CleanupAction::StopCapture, stopped);

        let flushed = session.playback.flush();
        trace!(flushed, "Playback flushed for teardown");
        report.record(CleanupAction::FlushPlayback, Ok(StepOutcome::Done));

        let closed = match session.transport.take() {
            Some(handle) if handle.close() => StepOutcome::Done,
            _ => StepOutcome::Skipped,
        };
        report.record(CleanupAction::CloseTransport, Ok(closed));

        let mut failures = Vec::new();
        if let Some(mut device) = session.capture_device.take() {
            if let Err(err) = device.release() {
                failures.push(format!("capture: {}", err));
            }
        }
        if let Err(err) = session.playback.release() {
            failures.push(format!("playback: {}", err));
        }
        let released = if failures.is_empty() {
            Ok(StepOutcome::Done)
        } else {
            Err(failures.join("; "))
        };
        report.record(CleanupAction::ReleaseDevice, released);

        info!(session_id = %session.id, clean = report.is_clean(), "Session resources released");
        self.emit(SessionEvent::CleanupCompleted(report.clone()));
        report
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to.clone());
        info!(session_id = ?self.session_id, from = %from, to = %to, "Session state changed");
        self.publish();
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn refresh_stats(&mut self) {
        if let Some(session) = &self.session {
            if let Some(capture) = &session.capture {
                self.stats.frames_sent = capture.frames_sent();
            }
            if let Some(transport) = &session.transport {
                self.stats.frames_dropped = transport.frames_dropped();
            }
        }
    }

    fn publish(&mut self) {
        self.refresh_stats();
        let playback = self
            .session
            .as_ref()
            .map(|session| PlaybackStatus {
                active_units: session.playback.active_count(),
                clock: session.playback.clock(),
            })
            .unwrap_or_default();

        self.snapshots.send_replace(SessionSnapshot {
            session_id: self.session_id,
            state: self.state.clone(),
            is_speaking: self.state == SessionState::Active(ActiveMode::Speaking),
            transcript: self.transcript.snapshot(),
            last_error: self.last_error.clone(),
            playback,
            stats: self.stats,
        });
    }
}

/// Check the declared format, then decode. Agent audio must match the playback rate.
fn decode_agent_audio(
    mime_type: Option<&str>,
    data: String,
    format: FrameFormat,
) -> Result<AudioFrame, DecodeError> {
    if let Some(mime) = mime_type {
        if let Some(rate) = FrameFormat::rate_from_mime(mime)? {
            if rate != format.sample_rate {
                return Err(DecodeError::FormatMismatch {
                    expected: format.sample_rate,
                    actual: rate,
                });
            }
        }
    }
    FrameCodec::decode_inbound(&WireFrame::new(format, data), format.channels)
}

async fn next_event<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn connect_outcome(
    rx: &mut Option<oneshot::Receiver<ConnectOutcome>>,
) -> Option<ConnectOutcome> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::virtual_device::{VirtualBackend, VirtualRig};
    use crate::session::state::ErrorKind;
    use crate::transport::{SessionEndpoint, SessionSetup};
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    /// The agent side of one in-memory session.
    struct AgentLink {
        events: mpsc::UnboundedSender<TransportEvent>,
        endpoint: SessionEndpoint,
    }

    impl AgentLink {
        fn send(&self, event: TransportEvent) {
            self.events.send(event).expect("controller dropped the session");
        }
    }

    struct ScriptedConnector {
        connects: AtomicUsize,
        open_on_connect: AtomicBool,
        fail_next: Mutex<Option<VoiceError>>,
        link: Mutex<Option<AgentLink>>,
    }

    impl ScriptedConnector {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                open_on_connect: AtomicBool::new(true),
                fail_next: Mutex::new(None),
                link: Mutex::new(None),
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        async fn link(&self) -> AgentLink {
            timeout(WAIT, async {
                loop {
                    if let Some(link) = self.link.lock().take() {
                        return link;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("no connection was made")
        }
    }

    #[async_trait]
    impl AgentConnector for ScriptedConnector {
        async fn connect(
            &self,
            _setup: &SessionSetup,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<SessionHandle, VoiceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_next.lock().take() {
                return Err(err);
            }
            let (handle, endpoint) = SessionHandle::channel(64, Duration::from_secs(30));
            if self.open_on_connect.load(Ordering::SeqCst) {
                let _ = events.send(TransportEvent::Open);
            }
            *self.link.lock() = Some(AgentLink { events, endpoint });
            Ok(handle)
        }
    }

    struct Harness {
        handle: VoiceSessionHandle,
        rig: VirtualRig,
        connector: Arc<ScriptedConnector>,
        events: broadcast::Receiver<SessionEvent>,
        snapshots: watch::Receiver<SessionSnapshot>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.auto_retry = false;
        config.session.retry_delay_ms = 20;
        config.session.error_display_ms = 60_000;
        config.session.turn_grace_ms = 150;
        config
    }

    fn harness(config: AppConfig) -> Harness {
        let (backend, rig) = VirtualBackend::manual();
        let connector = Arc::new(ScriptedConnector::new());
        let handle = VoiceSessionController::spawn(
            Arc::new(RwLock::new(config)),
            Arc::new(backend),
            connector.clone(),
        );
        let events = handle.events();
        let snapshots = handle.subscribe();
        Harness {
            handle,
            rig,
            connector,
            events,
            snapshots,
        }
    }

    async fn wait_for_state(
        events: &mut broadcast::Receiver<SessionEvent>,
        want: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::StateChanged { to, .. }) if want(&to) => return to,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream failed: {}", e),
                }
            }
        })
        .await
        .expect("timed out waiting for state")
    }

    /// Every state entered until `last` matches, in order.
    async fn collect_states(
        events: &mut broadcast::Receiver<SessionEvent>,
        last: impl Fn(&SessionState) -> bool,
    ) -> Vec<SessionState> {
        timeout(WAIT, async {
            let mut states = Vec::new();
            loop {
                if let Ok(SessionEvent::StateChanged { to, .. }) = events.recv().await {
                    let done = last(&to);
                    states.push(to);
                    if done {
                        return states;
                    }
                }
            }
        })
        .await
        .expect("timed out collecting states")
    }

    async fn wait_for_cleanup(events: &mut broadcast::Receiver<SessionEvent>) -> CleanupReport {
        timeout(WAIT, async {
            loop {
                if let Ok(SessionEvent::CleanupCompleted(report)) = events.recv().await {
                    return report;
                }
            }
        })
        .await
        .expect("timed out waiting for cleanup")
    }

    async fn wait_for_snapshot(
        snapshots: &mut watch::Receiver<SessionSnapshot>,
        want: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        timeout(WAIT, async {
            loop {
                {
                    let snapshot = snapshots.borrow_and_update();
                    if want(&snapshot) {
                        return snapshot.clone();
                    }
                }
                snapshots.changed().await.expect("controller stopped");
            }
        })
        .await
        .expect("timed out waiting for snapshot")
    }

    fn agent_audio(secs: f64) -> TransportEvent {
        let samples = vec![0.1f32; (secs * 24000.0).round() as usize];
        let frame = FrameCodec::encode_outbound(&samples, FrameFormat::pcm16(24000, 1));
        TransportEvent::AudioDelta {
            mime_type: Some(frame.mime_type()),
            data: frame.data().to_string(),
        }
    }

    fn is_listening(state: &SessionState) -> bool {
        *state == SessionState::Active(ActiveMode::Listening)
    }

    #[tokio::test]
    async fn test_barge_in_during_second_unit() {
        let mut h = harness(test_config());
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let mut link = h.connector.link().await;

        let emitted = h.rig.feed(&vec![0.05f32; 4096 * 10]);
        assert_eq!(emitted, 10);
        for _ in 0..10 {
            let frame = timeout(WAIT, link.endpoint.next_frame()).await.unwrap().unwrap();
            assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        }

        link.send(TransportEvent::TranscriptDelta {
            speaker: Speaker::Agent,
            text: "Your shipment".into(),
        });
        for _ in 0..3 {
            link.send(agent_audio(0.1));
        }
        let speaking = wait_for_snapshot(&mut h.snapshots, |s| s.playback.active_units == 3).await;
        assert!(speaking.is_speaking);
        assert!((speaking.playback.clock - 0.3).abs() < 1e-6);
        assert_eq!(speaking.transcript.agent, "Your shipment");
        assert_eq!(speaking.stats.frames_sent, 10);

        h.rig.advance(0.15);
        wait_for_snapshot(&mut h.snapshots, |s| s.playback.active_units == 2).await;

        link.send(TransportEvent::Interrupted);
        let after = wait_for_snapshot(&mut h.snapshots, |s| s.playback.active_units == 0).await;
        assert_eq!(after.playback.clock, 0.0);
        assert!(after.transcript.agent.is_empty());
        assert_eq!(after.state, SessionState::Active(ActiveMode::Listening));
        assert!(!after.is_speaking);
    }

    #[tokio::test]
    async fn test_permission_denied_never_connects() {
        let mut h = harness(test_config());
        h.rig.fail_next_capture(DeviceError::PermissionDenied);
        h.handle.start().unwrap();

        let states = collect_states(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert_eq!(states[0], SessionState::AcquiringDevice);
        match &states[1] {
            SessionState::Error(reason) => {
                assert_eq!(reason.kind, ErrorKind::PermissionDenied);
                assert_eq!(reason.message, "Microphone access denied.");
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(states.len(), 2);
        assert_eq!(h.connector.connects(), 0);

        h.handle.acknowledge().unwrap();
        wait_for_state(&mut h.events, |s| *s == SessionState::Idle).await;
        assert!(h.handle.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_while_speaking_runs_full_cleanup() {
        let mut config = test_config();
        config.session.error_display_ms = 50;
        let mut h = harness(config);
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        link.send(agent_audio(0.2));
        wait_for_state(&mut h.events, |s| *s == SessionState::Active(ActiveMode::Speaking)).await;

        link.send(TransportEvent::Error("connection reset by peer".into()));
        let report = wait_for_cleanup(&mut h.events).await;
        assert_eq!(
            report.actions(),
            vec![
                CleanupAction::StopCapture,
                CleanupAction::FlushPlayback,
                CleanupAction::CloseTransport,
                CleanupAction::ReleaseDevice,
            ]
        );
        assert!(report.is_clean());
        assert!(report.steps.iter().all(|step| step.outcome == StepOutcome::Done));

        let error = wait_for_state(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert!(matches!(error, SessionState::Error(ref r) if r.kind == ErrorKind::Transport));
        wait_for_state(&mut h.events, |s| *s == SessionState::Idle).await;

        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.rig.playbacks_released(), 1);
        assert_eq!(h.connector.connects(), 1);
        timeout(WAIT, link.endpoint.close_signal().wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_playback_failure_releases_acquired_microphone() {
        let mut h = harness(test_config());
        h.rig.fail_next_playback(DeviceError::Unsupported("no output device".into()));
        h.handle.start().unwrap();

        let states = collect_states(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert_eq!(states[0], SessionState::AcquiringDevice);
        match &states[1] {
            SessionState::Error(reason) => {
                assert_eq!(reason.kind, ErrorKind::Unsupported);
                assert!(!reason.retryable);
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(states.len(), 2);

        assert_eq!(h.rig.captures_opened(), 1);
        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.rig.playbacks_released(), 0);
        assert_eq!(h.connector.connects(), 0);
    }

    #[tokio::test]
    async fn test_output_fault_mid_session_runs_full_cleanup() {
        let mut config = test_config();
        config.session.auto_retry = true;
        let mut h = harness(config);
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        link.send(agent_audio(0.2));
        wait_for_state(&mut h.events, |s| *s == SessionState::Active(ActiveMode::Speaking)).await;

        h.rig.fault_playback("stream invalidated");
        let report = wait_for_cleanup(&mut h.events).await;
        assert_eq!(
            report.actions(),
            vec![
                CleanupAction::StopCapture,
                CleanupAction::FlushPlayback,
                CleanupAction::CloseTransport,
                CleanupAction::ReleaseDevice,
            ]
        );
        assert!(report.is_clean());

        let error = wait_for_state(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert!(matches!(
            error,
            SessionState::Error(ref r) if r.kind == ErrorKind::DeviceFault && !r.retryable
        ));
        assert!(!h.rig.is_capturing());
        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.rig.playbacks_released(), 1);
        timeout(WAIT, link.endpoint.close_signal().wait()).await.unwrap();

        // Device faults are never retried.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.connector.connects(), 1);
        assert_eq!(h.rig.captures_opened(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_retries_exactly_once() {
        let mut config = test_config();
        config.session.auto_retry = true;
        config.session.error_display_ms = 50;
        let mut h = harness(config);
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;

        let first = h.connector.link().await;
        first.send(agent_audio(0.1));
        first.send(TransportEvent::Error("socket reset".into()));

        let states = collect_states(&mut h.events, is_listening).await;
        let acquisitions = states
            .iter()
            .filter(|s| **s == SessionState::AcquiringDevice)
            .count();
        assert_eq!(acquisitions, 1);
        assert!(states.iter().any(|s| matches!(s, SessionState::Error(_))));
        assert_eq!(h.connector.connects(), 2);

        let second = h.connector.link().await;
        second.send(TransportEvent::Error("socket reset again".into()));
        let states = collect_states(&mut h.events, |s| *s == SessionState::Idle).await;
        assert!(!states.contains(&SessionState::AcquiringDevice));
        assert_eq!(h.connector.connects(), 2);
        assert_eq!(h.rig.captures_released(), 2);
    }

    #[tokio::test]
    async fn test_user_stop_releases_everything_and_drops_stale_events() {
        let mut h = harness(test_config());
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        h.handle.stop().unwrap();
        let report = wait_for_cleanup(&mut h.events).await;
        assert_eq!(report.actions().len(), 4);
        wait_for_state(&mut h.events, |s| *s == SessionState::Idle).await;

        assert!(!h.rig.is_capturing());
        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.rig.playbacks_released(), 1);
        timeout(WAIT, link.endpoint.close_signal().wait()).await.unwrap();
        assert!(link.events.send(TransportEvent::Open).is_err());

        // A second stop is a no-op and a new start works.
        h.handle.stop().unwrap();
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_remote_close_is_graceful_and_not_retried() {
        let mut config = test_config();
        config.session.auto_retry = true;
        let mut h = harness(config);
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        link.send(TransportEvent::Closed);
        let states = collect_states(&mut h.events, |s| *s == SessionState::Idle).await;
        assert_eq!(states, vec![SessionState::Closing, SessionState::Idle]);
        assert!(h.handle.snapshot().last_error.is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_close_while_connecting_is_an_error() {
        let mut h = harness(test_config());
        h.connector.open_on_connect.store(false, Ordering::SeqCst);
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, |s| *s == SessionState::Connecting).await;
        let link = h.connector.link().await;

        link.send(TransportEvent::Closed);
        let error = wait_for_state(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert!(matches!(
            error,
            SessionState::Error(ref r) if r.kind == ErrorKind::TransportClosed && !r.retryable
        ));
        assert_eq!(h.rig.captures_released(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_transport_error() {
        let mut h = harness(test_config());
        *h.connector.fail_next.lock() = Some(VoiceError::Transport("dns lookup failed".into()));
        h.handle.start().unwrap();

        let error = wait_for_state(&mut h.events, |s| matches!(s, SessionState::Error(_))).await;
        assert!(matches!(error, SessionState::Error(ref r) if r.kind == ErrorKind::Transport));
        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.rig.playbacks_released(), 1);
    }

    #[tokio::test]
    async fn test_bad_agent_audio_is_dropped_and_session_continues() {
        let mut h = harness(test_config());
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        link.send(TransportEvent::AudioDelta {
            mime_type: Some("audio/pcm;rate=24000".into()),
            data: "AAAA".into(), // 3 bytes, not whole samples
        });
        let wrong_rate = FrameCodec::encode_outbound(&[0.1; 160], FrameFormat::pcm16(16000, 1));
        link.send(TransportEvent::AudioDelta {
            mime_type: Some(wrong_rate.mime_type()),
            data: wrong_rate.data().to_string(),
        });

        let snapshot = wait_for_snapshot(&mut h.snapshots, |s| s.stats.decode_errors == 2).await;
        assert_eq!(snapshot.stats.frames_received, 2);
        assert_eq!(snapshot.playback.active_units, 0);
        assert_eq!(snapshot.state, SessionState::Active(ActiveMode::Listening));
    }

    #[tokio::test]
    async fn test_transcript_resets_after_turn_grace() {
        let mut h = harness(test_config());
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;
        let link = h.connector.link().await;

        link.send(TransportEvent::TranscriptDelta {
            speaker: Speaker::User,
            text: "Any alerts?".into(),
        });
        link.send(TransportEvent::TranscriptDelta {
            speaker: Speaker::Agent,
            text: "One storm warning.".into(),
        });
        link.send(agent_audio(0.1));
        link.send(TransportEvent::TurnComplete);
        wait_for_state(&mut h.events, |s| *s == SessionState::Active(ActiveMode::Speaking)).await;

        h.rig.advance(0.1);
        wait_for_state(&mut h.events, is_listening).await;
        let populated = h.handle.snapshot();
        assert_eq!(populated.transcript.user, "Any alerts?");

        let cleared = wait_for_snapshot(&mut h.snapshots, |s| s.transcript.is_empty()).await;
        assert!(cleared.state.is_active());
    }

    #[tokio::test]
    async fn test_handle_reports_unavailable_after_shutdown() {
        let mut h = harness(test_config());
        h.handle.start().unwrap();
        wait_for_state(&mut h.events, is_listening).await;

        h.handle.shutdown().await.unwrap();
        assert_eq!(h.rig.captures_released(), 1);
        assert_eq!(h.handle.snapshot().state, SessionState::Idle);
        assert!(matches!(h.handle.start(), Err(VoiceError::ControllerUnavailable)));
    }
}
