use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::pipeline::StopFlag;
use crate::relay::RelaySender;

/// Retry and reconnect timing for a capture unit.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturePolicy {
    /// Consecutive read failures that trigger a reconnect.
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    pub reconnect_cooldown: Duration,
    /// Pause after each successful read (~30 reads/s by default).
    pub read_interval: Duration,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            retry_delay: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(5),
            read_interval: Duration::from_millis(33),
        }
    }
}

/// Live counters for one capture unit, shared with whoever reports on it.
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_failures: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub read_failures: u64,
    pub reconnects: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Reads frames from a source into the relay until stopped, recovering from
/// transient failures locally.
pub struct CaptureProducer<S: FrameSource> {
    stream_id: String,
    source: S,
    relay: RelaySender,
    policy: CapturePolicy,
    stats: Arc<CaptureStats>,
    stop: StopFlag,
}

impl<S: FrameSource> CaptureProducer<S> {
    pub fn new(stream_id: &str, source: S, relay: RelaySender, stop: StopFlag) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            source,
            relay,
            policy: CapturePolicy::default(),
            stats: Arc::new(CaptureStats::default()),
            stop,
        }
    }

    pub fn with_policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    /// Run until the stop flag is raised or the consumer goes away. The
    /// source is always released on exit.
    pub fn run(mut self) -> CaptureStatsSnapshot {
        log::info!(
            "[{}] capture starting on {}",
            self.stream_id,
            self.source.describe()
        );
        if let Err(err) = self.source.open() {
            log::error!(
                "[{}] failed to open {}: {:#}",
                self.stream_id,
                self.source.describe(),
                err
            );
        }

        let mut consecutive_failures = 0u32;
        while self.stop.is_running() {
            match self.source.read_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                    match self.relay.push(Instant::now(), frame) {
                        Ok(outcome) => {
                            self.stats
                                .frames_dropped
                                .fetch_add(outcome.evicted as u64, Ordering::Relaxed);
                        }
                        Err(err) => {
                            log::warn!("[{}] capture stopping: {:#}", self.stream_id, err);
                            break;
                        }
                    }
                    self.stop.sleep(self.policy.read_interval);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "[{}] frame read failed ({}/{}): {:#}",
                        self.stream_id,
                        consecutive_failures,
                        self.policy.max_consecutive_failures,
                        err
                    );
                    if consecutive_failures >= self.policy.max_consecutive_failures {
                        self.reconnect();
                        consecutive_failures = 0;
                    } else {
                        self.stop.sleep(self.policy.retry_delay);
                    }
                }
            }
        }

        self.source.release();
        let stats = self.stats.snapshot();
        log::info!(
            "[{}] capture stopped: captured={} dropped={} failures={} reconnects={}",
            self.stream_id,
            stats.frames_captured,
            stats.frames_dropped,
            stats.read_failures,
            stats.reconnects
        );
        stats
    }

    fn reconnect(&mut self) {
        log::warn!(
            "[{}] too many read failures, reconnecting in {:?}",
            self.stream_id,
            self.policy.reconnect_cooldown
        );
        self.source.release();
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        if !self.stop.sleep(self.policy.reconnect_cooldown) {
            return;
        }
        match self.source.open() {
            Ok(()) => log::info!("[{}] reconnected to {}", self.stream_id, self.source.describe()),
            // Reads keep failing until the next cycle retries.
            Err(err) => log::error!("[{}] reconnect failed: {:#}", self.stream_id, err),
        }
    }
}
