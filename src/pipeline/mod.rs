//! Per-stream pipelines and their supervisor.
//!
//! Each stream runs two threads: a capture unit feeding the relay and a
//! processing unit draining it. They share nothing else but a [`StopFlag`].

mod consumer;

pub use consumer::{ConsumerStats, ProcessingConsumer, ProcessingSettings, ResultCallback};

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::Detector;
use crate::fence::FenceManager;
use crate::ingest::{CapturePolicy, CaptureProducer, CaptureStats, CaptureStatsSnapshot, FrameSource};
use crate::perf::{PerformanceMonitor, PerformanceReport};
use crate::relay::{self, DEFAULT_CAPACITY};

/// Default wait for worker threads to exit after a stop request.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation signal shared by the threads of a pipeline.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.is_raised()
    }

    /// Sleep for `duration`, waking early if the flag is raised. Returns
    /// false if the flag was raised.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub relay_capacity: usize,
    pub capture: CapturePolicy,
    pub processing: ProcessingSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            relay_capacity: DEFAULT_CAPACITY,
            capture: CapturePolicy::default(),
            processing: ProcessingSettings::default(),
        }
    }
}

/// Everything one stream needs before its threads are started.
pub struct StreamPipeline {
    stream_id: String,
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    fences: FenceManager,
    settings: PipelineSettings,
    callback: Option<ResultCallback>,
    perf: PerformanceMonitor,
}

impl StreamPipeline {
    pub fn new(
        stream_id: &str,
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        fences: FenceManager,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            source,
            detector,
            fences,
            settings: PipelineSettings::default(),
            callback: None,
            perf: PerformanceMonitor::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_performance(mut self, perf: PerformanceMonitor) -> Self {
        self.perf = perf;
        self
    }

    /// Start the capture and processing threads.
    pub fn spawn(self) -> Result<PipelineHandle> {
        let stop = StopFlag::new();
        let (tx, rx) = relay::relay(self.settings.relay_capacity);
        let perf = Arc::new(Mutex::new(self.perf));

        let producer = CaptureProducer::new(&self.stream_id, self.source, tx, stop.clone())
            .with_policy(self.settings.capture);
        let capture_stats = producer.stats();

        let mut consumer =
            ProcessingConsumer::new(&self.stream_id, rx, self.detector, self.fences, stop.clone())
                .with_settings(self.settings.processing)
                .with_performance(perf.clone());
        if let Some(callback) = self.callback {
            consumer = consumer.with_callback(callback);
        }

        let processing = thread::Builder::new()
            .name(format!("{}-process", self.stream_id))
            .spawn(move || consumer.run())
            .with_context(|| format!("spawn processing thread for {}", self.stream_id))?;
        let capture = match thread::Builder::new()
            .name(format!("{}-capture", self.stream_id))
            .spawn(move || producer.run())
        {
            Ok(handle) => handle,
            Err(err) => {
                stop.raise();
                return Err(err)
                    .with_context(|| format!("spawn capture thread for {}", self.stream_id));
            }
        };

        log::info!("[{}] pipeline started", self.stream_id);
        Ok(PipelineHandle {
            stream_id: self.stream_id,
            stop,
            capture: Some(capture),
            processing: Some(processing),
            capture_stats,
            perf,
        })
    }
}

/// Outcome of stopping a pipeline. A `None` means the thread panicked or was
/// still running at the join deadline and has been detached.
#[derive(Clone, Debug, Default)]
pub struct PipelineExit {
    pub stream_id: String,
    pub capture: Option<CaptureStatsSnapshot>,
    pub processing: Option<ConsumerStats>,
}

impl PipelineExit {
    pub fn is_clean(&self) -> bool {
        self.capture.is_some() && self.processing.is_some()
    }
}

#[derive(Debug)]
pub struct PipelineHandle {
    stream_id: String,
    stop: StopFlag,
    capture: Option<JoinHandle<CaptureStatsSnapshot>>,
    processing: Option<JoinHandle<ConsumerStats>>,
    capture_stats: Arc<CaptureStats>,
    perf: Arc<Mutex<PerformanceMonitor>>,
}

impl PipelineHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn capture_stats(&self) -> CaptureStatsSnapshot {
        self.capture_stats.snapshot()
    }

    pub fn performance_report(&self) -> Option<PerformanceReport> {
        self.perf.lock().ok().and_then(|perf| perf.report())
    }

    /// Both worker threads have exited.
    pub fn is_finished(&self) -> bool {
        finished(&self.capture) && finished(&self.processing)
    }

    /// Raise the stop flag and wait up to `join_timeout` for both threads.
    pub fn stop(mut self, join_timeout: Duration) -> PipelineExit {
        self.stop.raise();
        let deadline = Instant::now() + join_timeout;
        let capture = join_until(&self.stream_id, "capture", self.capture.take(), deadline);
        let processing =
            join_until(&self.stream_id, "processing", self.processing.take(), deadline);
        log::info!("[{}] pipeline stopped", self.stream_id);
        PipelineExit {
            stream_id: self.stream_id,
            capture,
            processing,
        }
    }
}

fn finished<T>(handle: &Option<JoinHandle<T>>) -> bool {
    handle.as_ref().map_or(true, JoinHandle::is_finished)
}

fn join_until<T>(
    stream_id: &str,
    role: &str,
    handle: Option<JoinHandle<T>>,
    deadline: Instant,
) -> Option<T> {
    let handle = handle?;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "[{}] {} thread did not stop in time, detaching",
                stream_id,
                role
            );
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("[{}] {} thread panicked", stream_id, role);
            None
        }
    }
}

/// Watches running pipelines, reports on them periodically, and stops them
/// all when the stop flag is raised.
#[derive(Clone, Debug)]
pub struct Supervisor {
    report_interval: Duration,
    join_timeout: Duration,
    tick: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            report_interval: DEFAULT_REPORT_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            tick: Duration::from_secs(1),
        }
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// How often the supervisor wakes up.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Block until `stop` is raised or every pipeline has exited on its own,
    /// then stop all pipelines.
    pub fn run(&self, pipelines: Vec<PipelineHandle>, stop: &StopFlag) -> Vec<PipelineExit> {
        log::info!("supervising {} pipeline(s)", pipelines.len());
        let mut last_report = Instant::now();
        while stop.sleep(self.tick) {
            if pipelines.iter().all(PipelineHandle::is_finished) {
                log::warn!("all pipelines exited");
                break;
            }
            if last_report.elapsed() >= self.report_interval {
                last_report = Instant::now();
                for pipeline in &pipelines {
                    report(pipeline);
                }
            }
        }

        log::info!("stopping {} pipeline(s)", pipelines.len());
        pipelines
            .into_iter()
            .map(|p| p.stop(self.join_timeout))
            .collect()
    }
}

fn report(pipeline: &PipelineHandle) {
    let capture = pipeline.capture_stats();
    match pipeline.performance_report() {
        Some(perf) => log::info!("[{}] {}", pipeline.stream_id(), perf),
        None => log::info!("[{}] no frames processed yet", pipeline.stream_id()),
    }
    log::info!(
        "[{}] capture: {} frames, {} dropped, {} failures, {} reconnects",
        pipeline.stream_id(),
        capture.frames_captured,
        capture.frames_dropped,
        capture.read_failures,
        capture.reconnects
    );
}
