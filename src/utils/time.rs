//! Time Utilities
//!
//! High-precision timing for tick pacing and frame timestamps.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Process-wide monotonic origin for frame timestamps
static CLOCK_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic timestamp in nanoseconds since process start.
///
/// Every frame's `timestamp_ns` comes from this clock so timestamps are
/// comparable across sources, transforms and sinks.
pub fn timestamp_ns() -> u64 {
    CLOCK_ORIGIN.elapsed().as_nanos() as u64
}

/// High-precision timer for measuring frame times
pub struct FrameTimer {
    start: Instant,
    last_frame: Instant,
    frame_count: u64,
    frame_times: Vec<Duration>,
}

impl FrameTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            frame_count: 0,
            frame_times: Vec::with_capacity(120),
        }
    }

    /// Mark a new frame and return delta time
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_frame;
        self.last_frame = now;
        self.frame_count += 1;

        // Keep last 120 frame times for FPS calculation
        self.frame_times.push(delta);
        if self.frame_times.len() > 120 {
            self.frame_times.remove(0);
        }

        delta
    }

    /// Get current FPS based on recent frame times
    pub fn fps(&self) -> f32 {
        if self.frame_times.is_empty() {
            return 0.0;
        }

        let total: Duration = self.frame_times.iter().sum();
        let avg = total.as_secs_f32() / self.frame_times.len() as f32;

        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }

    /// Get total elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get total frame count
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Get average frame time in milliseconds
    pub fn avg_frame_time_ms(&self) -> f32 {
        if self.frame_times.is_empty() {
            return 0.0;
        }

        let total: Duration = self.frame_times.iter().sum();
        total.as_secs_f32() * 1000.0 / self.frame_times.len() as f32
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ns_is_monotonic() {
        let a = timestamp_ns();
        let b = timestamp_ns();
        let c = timestamp_ns();
        assert!(a <= b && b <= c);
    }

    #[test]
    fn test_frame_timer_counts_ticks() {
        let mut timer = FrameTimer::new();
        assert_eq!(timer.frame_count(), 0);
        timer.tick();
        timer.tick();
        assert_eq!(timer.frame_count(), 2);
        assert!(timer.fps() > 0.0);
    }
}
