//! # Playback Scheduler
//!
//! Owns the output timeline of one session. Decoded frames are admitted one at a
//! time and placed back-to-back:
//!
//! ```text
//! start_at = max(clock, device_time)
//! clock    = start_at + duration
//! ```
//!
//! When frames arrive ahead of consumption they play with zero gap; when the
//! producer falls behind, the next frame starts at the device clock and a small
//! gap is heard instead of an overlap.
//!
//! ## Ownership:
//! The scheduler is a plain struct with `&mut self` entry points, owned by the
//! session controller. Admission and flush can therefore never interleave: a flush
//! finishes (clock back at 0) before the next frame is looked at.

use crate::audio::codec::AudioFrame;
use crate::error::DeviceError;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Clock value meaning "nothing committed".
pub const NO_COMMITMENT: f64 = 0.0;

/// Identifies one scheduled playback unit within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Notifications from an output device back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// The unit's last sample has been played.
    Finished(UnitId),
    /// The output stream failed.
    DeviceFault(String),
}

/// The output device as seen by the scheduler.
///
/// Scheduling is fire-and-forget: the sink queues the unit and reports its
/// completion later through the `PlaybackEvent` channel it was opened with.
pub trait PlaybackSink: Send + Sync {
    /// Output device time in seconds.
    fn current_time(&self) -> f64;

    fn schedule(&self, unit: UnitId, start_at: f64, frame: AudioFrame) -> Result<(), DeviceError>;

    /// Stop a unit immediately. Unknown units are ignored.
    fn cancel(&self, unit: UnitId);

    fn release(&self) -> Result<(), DeviceError>;
}

/// A decoded frame bound to its place on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub start_at: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Result of admitting a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub unit: PlaybackUnit,
    /// The active set was empty before this frame: the agent started speaking.
    pub speaking_started: bool,
}

pub struct PlaybackScheduler {
    sink: Arc<dyn PlaybackSink>,
    clock: f64,
    active: HashMap<UnitId, PlaybackUnit>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            clock: NO_COMMITMENT,
            active: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedule a decoded frame right after everything already committed.
    ///
    /// If the sink refuses the unit, the clock and the active set are left untouched.
    pub fn admit(&mut self, frame: AudioFrame) -> Result<Admission, DeviceError> {
        let now = self.sink.current_time();
        let start_at = self.clock.max(now);
        let duration = frame.duration_secs();
        let id = UnitId(self.next_id);

        self.sink.schedule(id, start_at, frame)?;

        self.next_id += 1;
        self.clock = start_at + duration;
        let speaking_started = self.active.is_empty();
        let unit = PlaybackUnit {
            id,
            start_at,
            duration,
        };
        self.active.insert(id, unit);

        trace!(unit = %id, start_at, duration, clock = self.clock, "Frame admitted");
        Ok(Admission {
            unit,
            speaking_started,
        })
    }

    /// Record natural completion of a unit.
    ///
    /// Returns `true` when this completion emptied the active set ("speaking
    /// ended"). Units that were already flushed are ignored.
    pub fn complete(&mut self, id: UnitId) -> bool {
        if self.active.remove(&id).is_none() {
            trace!(unit = %id, "Completion for unknown unit ignored");
            return false;
        }
        self.active.is_empty()
    }

    /// Stop every active unit, clear the set and reset the clock.
    ///
    /// Returns how many units were cancelled.
    pub fn flush(&mut self) -> usize {
        let cancelled = self.active.len();
        for id in self.active.keys() {
            self.sink.cancel(*id);
        }
        self.active.clear();
        self.clock = NO_COMMITMENT;

        if cancelled > 0 {
            debug!(cancelled, "Playback flushed");
        }
        cancelled
    }

    /// Flush and hand the output device back.
    pub fn release(&mut self) -> Result<(), DeviceError> {
        self.flush();
        self.sink.release()
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    /// Active units ordered by start time.
    #[cfg(test)]
    pub fn active_units(&self) -> Vec<PlaybackUnit> {
        let mut units: Vec<_> = self.active.values().copied().collect();
        units.sort_by(|a, b| a.start_at.total_cmp(&b.start_at));
        units
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records calls and lets the test move the device clock.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub now: Mutex<f64>,
        pub scheduled: Mutex<Vec<(UnitId, f64)>>,
        pub cancelled: Mutex<Vec<UnitId>>,
        pub refuse: Mutex<bool>,
    }

    impl PlaybackSink for RecordingSink {
        fn current_time(&self) -> f64 {
            *self.now.lock()
        }

        fn schedule(
            &self,
            unit: UnitId,
            start_at: f64,
            _frame: AudioFrame,
        ) -> Result<(), DeviceError> {
            if *self.refuse.lock() {
                return Err(DeviceError::Fault("stream stopped".into()));
            }
            self.scheduled.lock().push((unit, start_at));
            Ok(())
        }

        fn cancel(&self, unit: UnitId) {
            self.cancelled.lock().push(unit);
        }

        fn release(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn frame_of(secs: f64) -> AudioFrame {
        AudioFrame::mono(24000, vec![0.0; (secs * 24000.0) as usize])
    }

    #[test]
    fn test_frames_ahead_of_device_play_back_to_back() {
        let sink = Arc::new(RecordingSink::default());
        *sink.now.lock() = 1.0;
        let mut scheduler = PlaybackScheduler::new(sink.clone());

        let d = 0.1;
        let n = 8;
        let first = scheduler.admit(frame_of(d)).unwrap();
        assert!(first.speaking_started);
        let start_clock = first.unit.start_at;
        for _ in 1..n {
            let admission = scheduler.admit(frame_of(d)).unwrap();
            assert!(!admission.speaking_started);
        }

        assert!((scheduler.clock() - (start_clock + n as f64 * d)).abs() < 1e-9);

        let units = scheduler.active_units();
        assert_eq!(units.len(), n);
        for pair in units.windows(2) {
            assert!(pair[0].end() <= pair[1].start_at + 1e-9, "units overlap");
            assert!((pair[1].start_at - pair[0].end()).abs() < 1e-9, "gap between units");
        }
    }

    #[test]
    fn test_producer_behind_device_leaves_gap_not_overlap() {
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = PlaybackScheduler::new(sink.clone());

        scheduler.admit(frame_of(0.1)).unwrap();
        *sink.now.lock() = 0.5;
        let late = scheduler.admit(frame_of(0.1)).unwrap();

        assert!((late.unit.start_at - 0.5).abs() < 1e-9);
        assert!((scheduler.clock() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_flush_resets_for_any_number_of_units() {
        for k in 0..4 {
            let sink = Arc::new(RecordingSink::default());
            *sink.now.lock() = 2.0;
            let mut scheduler = PlaybackScheduler::new(sink.clone());
            for _ in 0..k {
                scheduler.admit(frame_of(0.05)).unwrap();
            }

            assert_eq!(scheduler.flush(), k);
            assert_eq!(scheduler.active_count(), 0);
            assert_eq!(scheduler.clock(), NO_COMMITMENT);
            assert_eq!(sink.cancelled.lock().len(), k);
        }
    }

    #[test]
    fn test_admission_after_flush_ignores_old_clock() {
        let sink = Arc::new(RecordingSink::default());
        *sink.now.lock() = 3.0;
        let mut scheduler = PlaybackScheduler::new(sink.clone());
        for _ in 0..5 {
            scheduler.admit(frame_of(0.2)).unwrap();
        }
        scheduler.flush();

        let next = scheduler.admit(frame_of(0.2)).unwrap();
        assert!((next.unit.start_at - 3.0).abs() < 1e-9);
        assert!(next.speaking_started);
    }

    #[test]
    fn test_completion_reports_drain_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = PlaybackScheduler::new(sink);
        let a = scheduler.admit(frame_of(0.1)).unwrap().unit.id;
        let b = scheduler.admit(frame_of(0.1)).unwrap().unit.id;

        assert!(!scheduler.complete(a));
        assert!(scheduler.complete(b));
        assert!(!scheduler.complete(b));
        assert!(!scheduler.is_speaking());
    }

    #[test]
    fn test_refused_unit_leaves_state_unchanged() {
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = PlaybackScheduler::new(sink.clone());
        scheduler.admit(frame_of(0.1)).unwrap();
        let clock = scheduler.clock();

        *sink.refuse.lock() = true;
        assert!(scheduler.admit(frame_of(0.1)).is_err());
        assert_eq!(scheduler.clock(), clock);
        assert_eq!(scheduler.active_count(), 1);
    }
}
