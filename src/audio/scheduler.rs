//! # Playback Scheduler
//!
//! Schedules decoded speech segments for gap-free, non-overlapping playback and
//! tracks which segments are still playing so they can be cancelled.
//!
//! ## Scheduling Rule:
//! ```text
//! start_at        = max(next_start_time, now)
//! next_start_time = start_at + duration
//! ```
//! Segments that arrive while earlier ones are still queued are placed exactly
//! back-to-back; a segment that arrives after the queue drained starts "now".
//!
//! ## Interruption:
//! `stop_all()` empties the active set and resets `next_start_time` to zero, so
//! the next turn starts fresh instead of inheriting stale scheduling.

use crate::audio::codec::PlaybackSegment;
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

/// Identifier of a scheduled segment, unique within one session.
pub type SegmentId = u64;

/// Timing of a segment handed to the speaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    /// Start time on the output clock (seconds)
    pub start_at: f64,
    /// Duration (seconds)
    pub duration: f64,
}

impl ScheduledSegment {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Result of reporting that a segment finished playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEnd {
    /// The id was not active (already stopped or finished); nothing changed
    Unknown,
    /// Removed, other segments are still playing
    StillPlaying,
    /// Removed, and it was the last active segment
    Drained,
}

/// Output clock shared by the scheduler and the speaker.
///
/// Time is measured in seconds since the output was opened, like an audio
/// context's `currentTime`. Backed by tokio's clock so paused-time tests can
/// drive it.
#[derive(Debug, Clone, Copy)]
pub struct OutputClock {
    origin: Instant,
}

impl OutputClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed on the output clock.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Wall-clock instant corresponding to an output-clock time.
    pub fn instant_at(&self, at: f64) -> Instant {
        self.origin + Duration::from_secs_f64(at.max(0.0))
    }
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::start()
    }
}

struct ActiveSegment {
    timing: ScheduledSegment,
    segment: PlaybackSegment,
}

/// Gap-free sequential scheduler with an active-segment set.
///
/// Owns every segment from scheduling until its end is reported.
pub struct PlaybackScheduler {
    next_start_time: f64,
    next_id: SegmentId,
    active: BTreeMap<SegmentId, ActiveSegment>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            next_start_time: 0.0,
            next_id: 1,
            active: BTreeMap::new(),
        }
    }

    /// Schedule a segment at `max(next_start_time, now)` and add it to the active set.
    pub fn schedule(&mut self, segment: PlaybackSegment, now: f64) -> ScheduledSegment {
        let start_at = self.next_start_time.max(now);
        let timing = ScheduledSegment {
            id: self.next_id,
            start_at,
            duration: segment.duration(),
        };

        self.next_id += 1;
        self.next_start_time = timing.end_at();
        self.active.insert(timing.id, ActiveSegment { timing, segment });

        timing
    }

    /// Report that a segment finished playing.
    pub fn segment_ended(&mut self, id: SegmentId) -> SegmentEnd {
        if self.active.remove(&id).is_none() {
            return SegmentEnd::Unknown;
        }
        if self.active.is_empty() {
            SegmentEnd::Drained
        } else {
            SegmentEnd::StillPlaying
        }
    }

    /// Stop every active segment and reset the clock.
    ///
    /// Returns the timings of the segments that were stopped.
    pub fn stop_all(&mut self) -> Vec<ScheduledSegment> {
        let stopped = self.active.values().map(|a| a.timing).collect();
        self.active.clear();
        self.next_start_time = 0.0;
        stopped
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decoded audio of an active segment.
    pub fn segment(&self, id: SegmentId) -> Option<&PlaybackSegment> {
        self.active.get(&id).map(|a| &a.segment)
    }

    /// The `len` samples audible from output time `at`, zero-padded.
    ///
    /// Used by the visualizer tap; silence when nothing is playing at `at`.
    pub fn window_at(&self, at: f64, len: usize) -> Vec<f32> {
        let mut window = vec![0.0; len];
        let playing = self
            .active
            .values()
            .find(|a| a.timing.start_at <= at && at < a.timing.end_at());

        if let Some(active) = playing {
            let rate = active.segment.sample_rate() as f64;
            let offset = ((at - active.timing.start_at) * rate) as usize;
            let samples = active.segment.samples();
            let available = samples.len().saturating_sub(offset).min(len);
            window[..available].copy_from_slice(&samples[offset..offset + available]);
        }

        window
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}
