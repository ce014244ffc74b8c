//! # Capture Encoder
//!
//! Lives inside the input device callback. Raw samples arrive at whatever size the
//! device delivers them; the encoder re-chunks them into fixed-size blocks (4096
//! samples by default), encodes each block and hands it to the transport.
//!
//! ## Active flag:
//! The flag is shared with the controller through `CaptureControl`. It is checked
//! again right before each encoded frame is handed to the transport, so once it is
//! cleared nothing more goes out, even from a callback that was already running.

use crate::audio::codec::{FrameCodec, FrameFormat, WireFrame};
use crate::transport::{FrameSender, SendOutcome};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub struct CaptureEncoder {
    active: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    pending: Vec<f32>,
    chunk_len: usize,
    format: FrameFormat,
    sender: FrameSender,
}

/// The controller's grip on a running encoder.
#[derive(Clone)]
pub struct CaptureControl {
    active: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
}

impl CaptureEncoder {
    /// `chunk_size` is in frames; interleaved input is buffered per `format.channels`.
    pub fn new(
        format: FrameFormat,
        chunk_size: usize,
        sender: FrameSender,
    ) -> (Self, CaptureControl) {
        let active = Arc::new(AtomicBool::new(true));
        let frames_sent = Arc::new(AtomicU64::new(0));
        let chunk_len = chunk_size.max(1) * format.channels.max(1) as usize;

        let encoder = Self {
            active: active.clone(),
            frames_sent: frames_sent.clone(),
            pending: Vec::with_capacity(chunk_len),
            chunk_len,
            format,
            sender,
        };
        (encoder, CaptureControl { active, frames_sent })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Feed raw interleaved samples. Returns how many frames were handed to the transport.
    pub fn push_samples(&mut self, samples: &[f32]) -> usize {
        if !self.is_active() {
            self.pending.clear();
            return 0;
        }

        self.pending.extend_from_slice(samples);
        let mut emitted = 0;
        while self.pending.len() >= self.chunk_len {
            let frame = FrameCodec::encode_outbound(&self.pending[..self.chunk_len], self.format);
            self.pending.drain(..self.chunk_len);

            match self.dispatch(frame) {
                Some(SendOutcome::Queued) => emitted += 1,
                Some(SendOutcome::Dropped) => trace!("Capture frame dropped by transport"),
                Some(SendOutcome::Closed) | None => {
                    self.pending.clear();
                    break;
                }
            }
        }
        emitted
    }

    /// Hand one encoded frame to the transport. `None` when capture was deactivated
    /// while the frame was being encoded.
    fn dispatch(&self, frame: WireFrame) -> Option<SendOutcome> {
        if !self.is_active() {
            return None;
        }
        let outcome = self.sender.send(frame);
        if outcome == SendOutcome::Queued {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        Some(outcome)
    }
}

impl CaptureControl {
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
