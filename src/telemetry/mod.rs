//! Rolling frame-rate and frame-size telemetry.
//!
//! Inter-frame intervals are buffered between reporting ticks. Each
//! [`Telemetry::tick`] turns the buffer into a frames-per-second figure and
//! empties it.

use std::time::Duration;
use tokio::time::Instant;

/// Intervals at or above this indicate a stalled or paused source, not
/// the real frame cadence, and are left out of the average.
pub const OUTLIER_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
pub struct Telemetry {
    last_frame_at: Option<Instant>,
    intervals: Vec<Duration>,
    last_frame_size: Option<usize>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the buffer and stamp `now` as the reference for the first
    /// interval of a new streaming session.
    pub fn begin(&mut self, now: Instant) {
        self.intervals.clear();
        self.last_frame_at = Some(now);
        self.last_frame_size = None;
    }

    /// Record a frame that was just handed to the transport
    pub fn on_frame_sent(&mut self, size: usize) {
        self.record(size, Instant::now());
    }

    pub fn record(&mut self, size: usize, at: Instant) {
        if let Some(prev) = self.last_frame_at {
            let interval = at.saturating_duration_since(prev);
            if interval > Duration::ZERO && interval < OUTLIER_INTERVAL {
                self.intervals.push(interval);
            }
        }
        self.last_frame_at = Some(at);
        self.last_frame_size = Some(size);
    }

    /// Frames per second over the buffered intervals, to one decimal place.
    /// An empty buffer reports 0.0: started, but nothing sent yet.
    pub fn tick(&mut self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let total: Duration = self.intervals.iter().sum();
        let mean_ms = total.as_secs_f64() * 1000.0 / self.intervals.len() as f64;
        self.intervals.clear();
        round_tenth(1000.0 / mean_ms)
    }

    /// Forget everything; callers report "no data" for both figures
    pub fn reset(&mut self) {
        self.last_frame_at = None;
        self.intervals.clear();
        self.last_frame_size = None;
    }

    pub fn last_frame_size(&self) -> Option<usize> {
        self.last_frame_size
    }

    pub fn buffered(&self) -> usize {
        self.intervals.len()
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
