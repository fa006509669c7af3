// src/time.rs
//! Frame timing.
//!
//! [`TimeManager::update`] is called once per frame and returns a cheap [`Time`]
//! snapshot that is passed to the scene, components and the postprocess chain.
//! Deltas are wall-clock based so eye adaptation is frame-rate independent.

use std::time::Instant;

/// Snapshot of timing data passed around each frame (Copy, cheap).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Time {
    delta: f32,
    total: f64,
    frame: u64,
}

impl Time {
    /// Builds a snapshot directly; used by offline drivers and tests.
    #[inline]
    pub fn new(delta_seconds: f32, total_seconds: f64, frame: u64) -> Self {
        Self {
            delta: delta_seconds.max(0.0),
            total: total_seconds.max(0.0),
            frame,
        }
    }

    /// Seconds elapsed since the previous frame.
    #[inline(always)]
    pub fn delta_seconds(&self) -> f32 {
        self.delta
    }

    /// Seconds elapsed since the manager was created.
    #[inline(always)]
    pub fn total_seconds(&self) -> f64 {
        self.total
    }

    #[inline(always)]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0)
    }
}

/// Wall-clock time manager.
#[derive(Debug)]
pub struct TimeManager {
    start: Instant,
    last_frame: Instant,
    frame: u64,
    max_delta: f32, // prevent spiral of death after a stall
}

impl Default for TimeManager {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            frame: 0,
            max_delta: 0.25,
        }
    }
}

impl TimeManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp applied to a single frame delta (seconds).
    pub fn with_max_delta(mut self, max_delta: f32) -> Self {
        self.max_delta = max_delta.max(f32::EPSILON);
        self
    }

    /// Update timing. Call once per frame at the very beginning.
    pub fn update(&mut self) -> Time {
        let now = Instant::now();
        let raw_delta = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame += 1;
        Time::new(
            raw_delta.min(self.max_delta),
            now.duration_since(self.start).as_secs_f64(),
            self.frame,
        )
    }

    #[inline(always)]
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counts_frames() {
        let mut manager = TimeManager::new();
        let first = manager.update();
        let second = manager.update();
        assert_eq!(first.frame(), 1);
        assert_eq!(second.frame(), 2);
        assert!(second.total_seconds() >= first.total_seconds());
        assert!(second.delta_seconds() >= 0.0);
    }

    #[test]
    fn test_delta_is_clamped() {
        let mut manager = TimeManager::new().with_max_delta(0.001);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let time = manager.update();
        assert!(time.delta_seconds() <= 0.001);
    }

    #[test]
    fn test_negative_snapshot_is_clamped() {
        let time = Time::new(-1.0, -2.0, 7);
        assert_eq!(time.delta_seconds(), 0.0);
        assert_eq!(time.total_seconds(), 0.0);
        assert_eq!(time.frame(), 7);
    }
}
