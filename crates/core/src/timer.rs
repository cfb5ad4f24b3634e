//! Frame timing for the main loop.

use std::time::{Duration, Instant};

/// Measures per-frame delta time and a rolling frames-per-second figure.
///
/// The rolling figure is recomputed once per `report_interval`; between
/// reports [`FrameTimer::fps`] keeps returning the last computed value.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    frames_in_window: u32,
    total_frames: u64,
    report_interval: Duration,
    fps: f32,
}

impl FrameTimer {
    /// Create a timer that recomputes the fps figure every second.
    pub fn new() -> Self {
        Self::with_report_interval(Duration::from_secs(1))
    }

    /// Create a timer with a custom fps reporting interval.
    pub fn with_report_interval(report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            frames_in_window: 0,
            total_frames: 0,
            report_interval,
            fps: 0.0,
        }
    }

    /// Total time since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the end of a frame and return the time since the previous one.
    ///
    /// Returns `Some(fps)` when this tick closed a reporting window, so the
    /// caller can log it without tracking time itself.
    pub fn tick(&mut self) -> (Duration, Option<f32>) {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.total_frames += 1;
        self.frames_in_window += 1;

        let window = now - self.window_start;
        if window >= self.report_interval {
            self.fps = self.frames_in_window as f32 / window.as_secs_f32();
            self.frames_in_window = 0;
            self.window_start = now;
            return (delta, Some(self.fps));
        }

        (delta, None)
    }

    /// Last computed frames-per-second value.
    pub fn fps(&self) -> f32 {
        self.fps
    }

    /// Number of frames ticked since creation or the last reset.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Reset all counters to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.window_start = now;
        self.frames_in_window = 0;
        self.total_frames = 0;
        self.fps = 0.0;
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
    fn test_tick_counts_frames() {
        let mut timer = FrameTimer::with_report_interval(Duration::from_secs(3600));
        for _ in 0..5 {
            let (_, report) = timer.tick();
            assert!(report.is_none());
        }
        assert_eq!(timer.total_frames(), 5);
        assert_eq!(timer.fps(), 0.0);
    }

    #[test]
    fn test_zero_interval_reports_every_tick() {
        let mut timer = FrameTimer::with_report_interval(Duration::ZERO);
        let (_, report) = timer.tick();
        assert!(report.is_some());
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut timer = FrameTimer::with_report_interval(Duration::ZERO);
        timer.tick();
        timer.tick();
        timer.reset();
        assert_eq!(timer.total_frames(), 0);
        assert_eq!(timer.fps(), 0.0);
    }
}
