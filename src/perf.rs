//! Rolling processing statistics for a stream.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Sliding-window record of processing durations and detection counts.
#[derive(Debug)]
pub struct PerformanceMonitor {
    enabled: bool,
    window_size: usize,
    processing_times: VecDeque<Duration>,
    detection_counts: VecDeque<usize>,
    total_frames: u64,
    total_detections: u64,
    started: Instant,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceReport {
    /// Mean processing time over the window, in seconds.
    pub avg_processing_time: f64,
    /// Processing rate implied by `avg_processing_time`; 0 when it is 0.
    pub avg_fps: f64,
    pub avg_detections: f64,
    pub total_frames: u64,
    pub total_detections: u64,
    /// Seconds since creation or the last reset.
    pub runtime: f64,
}

impl PerformanceMonitor {
    pub fn new(enabled: bool, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            enabled,
            window_size,
            processing_times: VecDeque::with_capacity(window_size),
            detection_counts: VecDeque::with_capacity(window_size),
            total_frames: 0,
            total_detections: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, duration: Duration, detections: usize) {
        if !self.enabled {
            return;
        }
        if self.processing_times.len() == self.window_size {
            self.processing_times.pop_front();
            self.detection_counts.pop_front();
        }
        self.processing_times.push_back(duration);
        self.detection_counts.push_back(detections);
        self.total_frames += 1;
        self.total_detections += detections as u64;
    }

    /// Summary of the current window. `None` when disabled or nothing has
    /// been recorded yet.
    pub fn report(&self) -> Option<PerformanceReport> {
        if !self.enabled || self.processing_times.is_empty() {
            return None;
        }
        let samples = self.processing_times.len() as f64;
        let avg_processing_time =
            self.processing_times.iter().map(Duration::as_secs_f64).sum::<f64>() / samples;
        let avg_detections = self.detection_counts.iter().sum::<usize>() as f64 / samples;
        let avg_fps = if avg_processing_time > 0.0 {
            1.0 / avg_processing_time
        } else {
            0.0
        };
        Some(PerformanceReport {
            avg_processing_time,
            avg_fps,
            avg_detections,
            total_frames: self.total_frames,
            total_detections: self.total_detections,
            runtime: self.started.elapsed().as_secs_f64(),
        })
    }

    pub fn reset(&mut self) {
        self.processing_times.clear();
        self.detection_counts.clear();
        self.total_frames = 0;
        self.total_detections = 0;
        self.started = Instant::now();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(true, DEFAULT_WINDOW_SIZE)
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg {:.3}s/frame ({:.1} fps), {:.1} detections/frame, {} frames, {} detections, up {:.1}m",
            self.avg_processing_time,
            self.avg_fps,
            self.avg_detections,
            self.total_frames,
            self.total_detections,
            self.runtime / 60.0
        )
    }
}
