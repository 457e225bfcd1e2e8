//! Fencewatch: geofence dwell-time watcher for camera streams.
//!
//! Detections from an external detector are checked against polygonal
//! fences. An object that stays inside a fence for at least the fence's
//! dwell threshold produces exactly one intrusion event per continuous stay.
//!
//! # Module Structure
//!
//! - `geometry`: points, boxes, polygon containment
//! - `fence`: fences, per-track dwell state, the per-stream fence manager
//! - `detect`: detection types and the detector seam
//! - `frame`: single-owner decoded frames
//! - `relay`: bounded drop-oldest handoff between capture and processing
//! - `ingest`: frame sources and the capture producer
//! - `pipeline`: per-stream threads, stop flag, supervisor
//! - `perf`: rolling processing statistics
//! - `config`: daemon configuration

use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod fence;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod perf;
pub mod pipeline;
pub mod relay;

pub use config::{CameraConfig, FencewatchConfig};
pub use detect::{
    Detection, DetectionScript, Detector, DetectorBackend, GuardedDetector, ProcessingResult,
    ScriptedBackend, Track,
};
pub use fence::{Fence, FenceError, FenceManager, FenceSpec, IntrusionEvent, IntrusionObserver};
pub use frame::Frame;
pub use geometry::{BBox, Point, Polygon};
pub use ingest::{CapturePolicy, CaptureProducer, FrameSource, RtspConfig, RtspSource};
pub use perf::{PerformanceMonitor, PerformanceReport};
pub use pipeline::{PipelineHandle, StopFlag, StreamPipeline, Supervisor};
pub use relay::{relay, RelayReceiver, RelaySender};

/// Wall-clock milliseconds since the Unix epoch, for event timestamps.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
