//! # Session Transport
//!
//! The persistent bidirectional channel to the remote agent, seen from the session
//! controller's side.
//!
//! ## Key Components:
//! - **AgentConnector**: opens a channel and returns a `SessionHandle`
//! - **SessionHandle**: stored once by the controller; hands out `FrameSender`s and
//!   closes the channel
//! - **FrameSender**: fire-and-forget outbound path used from the capture callback
//! - **SessionEndpoint**: the connector's end of the outbound queue
//! - **TransportEvent**: everything the channel reports inbound
//!
//! ## Send semantics:
//! Outbound frames go through a bounded queue. `send` never blocks: a full queue
//! drops the frame, and the writer drops frames that waited longer than the send
//! horizon. Once the channel reported an error or close, nothing more is accepted.

pub mod live;
pub mod protocol;

use crate::audio::codec::WireFrame;
use crate::error::VoiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// Inbound events from the remote channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The agent accepted the session configuration.
    Open,
    /// A chunk of synthesized speech, still encoded.
    AudioDelta {
        mime_type: Option<String>,
        data: String,
    },
    TranscriptDelta { speaker: Speaker, text: String },
    /// The user barged in; queued agent audio must stop.
    Interrupted,
    /// The agent finished generating its turn.
    TurnComplete,
    Error(String),
    Closed,
}

impl TransportEvent {
    /// Error and Closed end the channel; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Error(_) | TransportEvent::Closed)
    }
}

/// The fixed configuration sent when the channel opens. The response modality is
/// always audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Opens channels to the remote agent.
///
/// Implementations deliver inbound events on `events` and must emit exactly one
/// terminal event (`Error` or `Closed`) unless the handle is closed locally first.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(
        &self,
        setup: &SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<SessionHandle, VoiceError>;
}

/// An outbound frame waiting for the socket.
#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: WireFrame,
    pub queued_at: Instant,
}

impl QueuedFrame {
    pub fn is_stale(&self, horizon: Duration) -> bool {
        self.queued_at.elapsed() > horizon
    }
}

/// What happened to a frame handed to `FrameSender::send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The queue was full.
    Dropped,
    /// The channel has ended.
    Closed,
}

struct Shared {
    closed: AtomicBool,
    dropped: AtomicU64,
    shutdown: Notify,
}

/// Cloneable, non-blocking outbound path.
#[derive(Clone)]
pub struct FrameSender {
    queue: mpsc::Sender<QueuedFrame>,
    shared: Arc<Shared>,
}

impl FrameSender {
    pub fn send(&self, frame: WireFrame) -> SendOutcome {
        if self.shared.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }

        let queued = QueuedFrame {
            frame,
            queued_at: Instant::now(),
        };
        match self.queue.try_send(queued) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Outbound queue full, frame dropped");
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// The controller's handle on one open channel.
pub struct SessionHandle {
    sender: FrameSender,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Create a handle and the connector-side endpoint of its outbound queue.
    pub fn channel(capacity: usize, horizon: Duration) -> (SessionHandle, SessionEndpoint) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            shutdown: Notify::new(),
        });

        let handle = SessionHandle {
            sender: FrameSender {
                queue: tx,
                shared: shared.clone(),
            },
            shared: shared.clone(),
        };
        let endpoint = SessionEndpoint {
            frames: rx,
            shared,
            horizon,
        };
        (handle, endpoint)
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let first = !self.shared.closed.swap(true, Ordering::AcqRel);
        if first {
            self.shared.shutdown.notify_one();
        }
        first
    }

    /// Frames dropped because the queue was full or they went stale.
    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// The connector's side: drains outbound frames and watches for a local close.
pub struct SessionEndpoint {
    frames: mpsc::Receiver<QueuedFrame>,
    shared: Arc<Shared>,
    horizon: Duration,
}

impl SessionEndpoint {
    /// Next frame young enough to send. `None` once every sender is gone.
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        while let Some(queued) = self.frames.recv().await {
            if queued.is_stale(self.horizon) {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Stale outbound frame dropped");
                continue;
            }
            return Some(queued.frame);
        }
        None
    }

    /// A signal that resolves when the controller closes the handle.
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            shared: self.shared.clone(),
        }
    }

    /// Stop accepting frames. Called by the connector before it reports `Error` or `Closed`.
    pub fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Waits for a local close without borrowing the endpoint.
pub struct CloseSignal {
    shared: Arc<Shared>,
}

impl CloseSignal {
    pub async fn wait(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        self.shared.shutdown.notified().await;
    }
}
