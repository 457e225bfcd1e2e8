use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::StopFlag;
use crate::detect::{Detector, ProcessingResult};
use crate::fence::FenceManager;
use crate::frame::Frame;
use crate::perf::PerformanceMonitor;
use crate::relay::{RelayReceiver, RelayRecv};

/// Receives the raw per-frame detections of a stream, keyed by stream id.
pub type ResultCallback = Box<dyn FnMut(&str, &[ProcessingResult]) -> Result<()> + Send>;

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessingSettings {
    /// Minimum spacing, in capture time, between processed frames.
    pub interval: Duration,
    pub confidence_threshold: f32,
    /// How long to block on an empty relay before re-checking the stop flag.
    pub relay_wait: Duration,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            confidence_threshold: 0.5,
            relay_wait: crate::relay::DEFAULT_WAIT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub frames_received: u64,
    pub frames_processed: u64,
    pub intrusions: u64,
}

/// Takes frames off the relay, rate-limits them by capture time, and runs
/// detection plus fence evaluation on the ones that pass.
pub struct ProcessingConsumer {
    stream_id: String,
    relay: RelayReceiver,
    detector: Box<dyn Detector>,
    fences: FenceManager,
    settings: ProcessingSettings,
    callback: Option<ResultCallback>,
    perf: Arc<Mutex<PerformanceMonitor>>,
    stop: StopFlag,
    last_process: Option<Instant>,
    stats: ConsumerStats,
}

impl ProcessingConsumer {
    pub fn new(
        stream_id: &str,
        relay: RelayReceiver,
        detector: Box<dyn Detector>,
        fences: FenceManager,
        stop: StopFlag,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            relay,
            detector,
            fences,
            settings: ProcessingSettings::default(),
            callback: None,
            perf: Arc::new(Mutex::new(PerformanceMonitor::default())),
            stop,
            last_process: None,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProcessingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_performance(mut self, perf: Arc<Mutex<PerformanceMonitor>>) -> Self {
        self.perf = perf;
        self
    }

    pub fn fences(&self) -> &FenceManager {
        &self.fences
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn run(mut self) -> ConsumerStats {
        log::info!(
            "[{}] processing starting (interval {:?}, confidence {:.2})",
            self.stream_id,
            self.settings.interval,
            self.settings.confidence_threshold
        );
        while self.stop.is_running() {
            match self.relay.recv_timeout(self.settings.relay_wait) {
                RelayRecv::Frame(captured_at, frame) => {
                    self.offer(captured_at, frame);
                }
                RelayRecv::Timeout => continue,
                RelayRecv::Closed => {
                    log::info!("[{}] relay closed", self.stream_id);
                    break;
                }
            }
        }
        log::info!(
            "[{}] processing stopped: received={} processed={} intrusions={}",
            self.stream_id,
            self.stats.frames_received,
            self.stats.frames_processed,
            self.stats.intrusions
        );
        self.stats
    }

    /// Process the frame if the interval has elapsed since the last processed
    /// capture. Returns whether it was processed.
    pub fn offer(&mut self, captured_at: Instant, frame: Frame) -> bool {
        self.stats.frames_received += 1;
        let due = match self.last_process {
            None => true,
            Some(last) => captured_at.saturating_duration_since(last) >= self.settings.interval,
        };
        if !due {
            return false;
        }
        self.process(&frame);
        self.last_process = Some(captured_at);
        true
    }

    fn process(&mut self, frame: &Frame) {
        let started = Instant::now();
        let detections = self
            .detector
            .detect(frame, self.settings.confidence_threshold);
        let events = self.fences.check_detections(&detections);
        self.stats.frames_processed += 1;
        self.stats.intrusions += events.len() as u64;

        if !detections.is_empty() {
            log::debug!(
                "[{}] frame #{}: {} detection(s)",
                self.stream_id,
                frame.sequence(),
                detections.len()
            );
            let timestamp_ms = crate::unix_millis();
            let results: Vec<ProcessingResult> = detections
                .iter()
                .cloned()
                .map(|detection| ProcessingResult {
                    timestamp_ms,
                    detection,
                })
                .collect();
            self.notify(&results);
        }

        if let Ok(mut perf) = self.perf.lock() {
            perf.record(started.elapsed(), detections.len());
        }
    }

    fn notify(&mut self, results: &[ProcessingResult]) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        let stream_id = self.stream_id.as_str();
        match panic::catch_unwind(AssertUnwindSafe(|| callback(stream_id, results))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("[{}] result callback failed: {:#}", stream_id, err),
            Err(_) => log::error!("[{}] result callback panicked", stream_id),
        }
    }
}
