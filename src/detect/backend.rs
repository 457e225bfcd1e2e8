use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detection capability as seen by the processing pipeline.
///
/// Implementations must not fail across this boundary: a detector that
/// cannot produce results for a frame returns an empty list and reports
/// the problem itself.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Vec<Detection>;
}

/// Fallible detector backend (model runtime, remote service, script).
///
/// Wrap a backend in [`GuardedDetector`] to use it in a pipeline.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Only detections at or above
    /// `confidence_threshold` should be returned.
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Result<Vec<Detection>>;
}

/// Adapts a [`DetectorBackend`] into a [`Detector`]: backend errors are
/// logged and become "no detections this cycle".
pub struct GuardedDetector<B> {
    backend: B,
    failures: u64,
}

impl<B: DetectorBackend> GuardedDetector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            failures: 0,
        }
    }

    /// Number of detection calls that failed so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl<B: DetectorBackend> Detector for GuardedDetector<B> {
    fn detect(&mut self, frame: &Frame, confidence_threshold: f32) -> Vec<Detection> {
        match self.backend.detect(frame, confidence_threshold) {
            Ok(detections) => detections,
            Err(err) => {
                self.failures += 1;
                log::error!(
                    "detector backend {} failed on frame #{}: {:#}",
                    self.backend.name(),
                    frame.sequence(),
                    err
                );
                Vec::new()
            }
        }
    }
}
