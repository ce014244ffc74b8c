//! # Output Timeline
//!
//! A sample-accurate mixer that device sinks render from. Units are placed on an
//! absolute timeline measured in output frames; the render position only moves
//! forward, so `current_time()` is the output device clock.
//!
//! When a unit's last sample has been rendered it is retired and a
//! `PlaybackEvent::Finished` is sent to the scheduler. Cancelled units disappear
//! silently.

use crate::audio::codec::AudioFrame;
use crate::audio::playback::{PlaybackEvent, UnitId};
use tokio::sync::mpsc;
use tracing::trace;

struct Voice {
    id: UnitId,
    start: u64,
    frame: AudioFrame,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.frame.frame_count() as u64
    }
}

pub struct TimelineMixer {
    sample_rate: u32,
    position: u64,
    voices: Vec<Voice>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl TimelineMixer {
    pub fn new(sample_rate: u32, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            position: 0,
            voices: Vec::new(),
            events,
        }
    }

    /// Render position in seconds.
    pub fn current_time(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    #[cfg(test)]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.voices.len()
    }

    /// Place `frame` on the timeline at `start_at` seconds.
    ///
    /// A start time that rounds to a frame already rendered is moved to the
    /// current position rather than losing its head.
    pub fn schedule(&mut self, id: UnitId, start_at: f64, frame: AudioFrame) {
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        let start = requested.max(self.position);
        trace!(unit = %id, start, frames = frame.frame_count(), "Unit placed on timeline");
        self.voices.push(Voice { id, start, frame });
    }

    /// Remove a unit without reporting completion.
    pub fn cancel(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        before != self.voices.len()
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Mix the next `out.len() / channels` frames into `out` (interleaved) and
    /// advance the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        let window_start = self.position;
        let window_end = window_start + frames;

        for voice in &self.voices {
            let from = voice.start.max(window_start);
            let to = voice.end().min(window_end);
            for pos in from..to {
                let src = (pos - voice.start) as usize;
                let dst = (pos - window_start) as usize * channels;
                for ch in 0..channels {
                    out[dst + ch] += voice.frame.sample(ch, src);
                }
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.position = window_end;
        self.retire();
    }

    /// Advance the clock by `frames` without producing output.
    #[cfg(test)]
    pub fn advance(&mut self, frames: u64) {
        self.position += frames;
        self.retire();
    }

    fn retire(&mut self) {
        let position = self.position;
        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            let done = voice.end() <= position;
            if done {
                finished.push(voice.id);
            }
            !done
        });

        for id in finished {
            // The scheduler may already be gone during teardown.
            let _ = self.events.send(PlaybackEvent::Finished(id));
        }
    }
}
