//! Geofences and dwell-time tracking.
//!
//! A `Fence` is a polygon with detection filters and a dwell threshold. It
//! owns the occupancy state of every track it has seen inside its polygon
//! and decides, detection by detection, when an intrusion event is due.
//!
//! Detections without a track id cannot be followed across frames, so they
//! trigger immediately (dwell 0) on every qualifying sighting.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::detect::{Detection, Track};
use crate::geometry::{BBox, Point, Polygon, FUZZY_THRESHOLD_CUTOFF};

mod manager;
mod state;

pub use manager::{FenceManager, IntrusionObserver, DEFAULT_STALE_TIMEOUT};
pub use state::{DwellPhase, TrackedObjectState};

const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Configuration errors. These are the only errors that stop setup.
#[derive(Debug, Error, PartialEq)]
pub enum FenceError {
    #[error("fence id must not be empty")]
    EmptyId,
    #[error("fence polygon needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),
    #[error("fence polygon has a non-finite vertex")]
    NonFiniteVertex,
    #[error("min_confidence must be within 0..=1, got {0}")]
    InvalidConfidence(f32),
    #[error("dwell_time_threshold must be a non-negative number of seconds, got {0}")]
    InvalidDwellThreshold(f64),
    #[error("overlap threshold must be within 0..=1, got {0}")]
    InvalidOverlapThreshold(f32),
    #[error("fence {id}: {source}")]
    InSpec {
        id: String,
        #[source]
        source: Box<FenceError>,
    },
}

fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

fn default_enabled() -> bool {
    true
}

/// Declarative fence record, as stored in configuration files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FenceSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub points: Vec<[f32; 2]>,
    /// Empty means every class.
    #[serde(default)]
    pub target_classes: Vec<String>,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// Seconds.
    #[serde(default)]
    pub dwell_time_threshold: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl FenceSpec {
    pub fn new(id: &str, name: &str, points: &[[f32; 2]]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            points: points.to_vec(),
            target_classes: Vec::new(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            dwell_time_threshold: 0.0,
            enabled: true,
        }
    }

    pub fn target_classes(mut self, classes: &[&str]) -> Self {
        self.target_classes = classes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn dwell_time_threshold(mut self, seconds: f64) -> Self {
        self.dwell_time_threshold = seconds;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Intrusion alert. Emitted once per continuous dwell interval for tracked
/// objects, and on every qualifying sighting for untracked ones.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IntrusionEvent {
    pub stream_id: String,
    pub fence_id: String,
    pub fence_name: String,
    pub object_class: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub track_id: Option<u64>,
    /// Wall clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Seconds spent inside the fence when the event fired.
    pub dwell_time: f64,
    pub dwell_time_threshold: f64,
}

#[derive(Debug)]
pub struct Fence {
    id: String,
    name: String,
    polygon: Polygon,
    target_classes: HashSet<String>,
    min_confidence: f32,
    dwell_threshold: Duration,
    overlap_threshold: f32,
    tracks: HashMap<u64, TrackedObjectState>,
}

impl Fence {
    pub fn from_spec(spec: &FenceSpec) -> Result<Self, FenceError> {
        Self::build(spec).map_err(|source| FenceError::InSpec {
            id: spec.id.clone(),
            source: Box::new(source),
        })
    }

    fn build(spec: &FenceSpec) -> Result<Self, FenceError> {
        if spec.id.trim().is_empty() {
            return Err(FenceError::EmptyId);
        }
        let polygon = Polygon::new(spec.points.iter().copied().map(Point::from).collect())?;
        if !(0.0..=1.0).contains(&spec.min_confidence) {
            return Err(FenceError::InvalidConfidence(spec.min_confidence));
        }
        let dwell_threshold = Duration::try_from_secs_f64(spec.dwell_time_threshold)
            .map_err(|_| FenceError::InvalidDwellThreshold(spec.dwell_time_threshold))?;
        let name = if spec.name.trim().is_empty() {
            spec.id.clone()
        } else {
            spec.name.clone()
        };

        Ok(Self {
            id: spec.id.clone(),
            name,
            polygon,
            target_classes: spec.target_classes.iter().cloned().collect(),
            min_confidence: spec.min_confidence,
            dwell_threshold,
            overlap_threshold: FUZZY_THRESHOLD_CUTOFF,
            tracks: HashMap::new(),
        })
    }

    /// Enable corner-overlap containment for thresholds below 0.5.
    pub fn with_overlap_threshold(mut self, threshold: f32) -> Result<Self, FenceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(FenceError::InvalidOverlapThreshold(threshold));
        }
        self.overlap_threshold = threshold;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn polygon(&self) -> &Polygon {
        &self.polygon
    }

    pub fn dwell_threshold(&self) -> Duration {
        self.dwell_threshold
    }

    /// Class filter and confidence floor.
    pub fn accepts(&self, detection: &Detection) -> bool {
        let class_ok =
            self.target_classes.is_empty() || self.target_classes.contains(&detection.class_label);
        class_ok && detection.confidence >= self.min_confidence
    }

    pub fn contains(&self, bbox: &BBox) -> bool {
        self.polygon.contains_bbox(bbox, self.overlap_threshold)
    }

    /// Run one detection through the fence at time `now`.
    pub fn evaluate(
        &mut self,
        detection: &Detection,
        now: Instant,
        stream_id: &str,
    ) -> Option<IntrusionEvent> {
        if !self.accepts(detection) {
            return None;
        }
        let inside = self.contains(&detection.bbox);

        match detection.track {
            Track::Untracked => inside.then(|| self.event(stream_id, detection, Duration::ZERO)),
            Track::Tracked(track_id) => {
                let class = detection.class_label.as_str();
                let bbox = detection.bbox;
                if !inside {
                    // Never-seen-inside objects get no state.
                    if let Some(state) = self.tracks.get_mut(&track_id) {
                        state.observe_outside(now, bbox);
                    }
                    return None;
                }
                let state = self
                    .tracks
                    .entry(track_id)
                    .and_modify(|state| state.observe_inside(now, bbox, class))
                    .or_insert_with(|| TrackedObjectState::entered(now, bbox, class));

                if !state.latch_if_due(self.dwell_threshold) {
                    return None;
                }
                let dwell = state.dwell_time;
                log::debug!(
                    "fence {} latched track {} after {:.2}s",
                    self.id,
                    track_id,
                    dwell.as_secs_f64()
                );
                Some(self.event(stream_id, detection, dwell))
            }
        }
    }

    fn event(&self, stream_id: &str, detection: &Detection, dwell: Duration) -> IntrusionEvent {
        IntrusionEvent {
            stream_id: stream_id.to_string(),
            fence_id: self.id.clone(),
            fence_name: self.name.clone(),
            object_class: detection.class_label.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
            track_id: detection.track.id(),
            timestamp_ms: crate::unix_millis(),
            dwell_time: dwell.as_secs_f64(),
            dwell_time_threshold: self.dwell_threshold.as_secs_f64(),
        }
    }

    /// Drop every track not seen for longer than `timeout`. Returns how
    /// many were removed.
    pub fn reap_stale(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.tracks.len();
        self.tracks.retain(|_, state| !state.is_stale(now, timeout));
        before - self.tracks.len()
    }

    /// Current dwell of a track, if the fence is tracking it.
    pub fn dwell_time(&self, track_id: u64) -> Option<Duration> {
        self.tracks.get(&track_id).map(|state| state.dwell_time)
    }

    pub fn tracked_state(&self, track_id: u64) -> Option<&TrackedObjectState> {
        self.tracks.get(&track_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: [[f32; 2]; 4] = [[100.0, 100.0], [400.0, 100.0], [400.0, 400.0], [100.0, 400.0]];

    fn fence(threshold: f64) -> Fence {
        Fence::from_spec(
            &FenceSpec::new("f1", "loading bay", &SQUARE)
                .target_classes(&["person"])
                .dwell_time_threshold(threshold),
        )
        .unwrap()
    }

    fn person(track: Option<u64>) -> Detection {
        let d = Detection::new("person", 0.8, BBox::new(200.0, 200.0, 300.0, 350.0));
        match track {
            Some(id) => d.tracked(id),
            None => d,
        }
    }

    fn at(t0: Instant, secs: f64) -> Instant {
        t0 + Duration::from_secs_f64(secs)
    }

    #[test]
    fn invalid_records_report_fence_id() {
        let err = Fence::from_spec(&FenceSpec::new("bad", "", &SQUARE[..2])).unwrap_err();
        assert_eq!(
            err,
            FenceError::InSpec {
                id: "bad".to_string(),
                source: Box::new(FenceError::TooFewVertices(2)),
            }
        );
        assert!(err.to_string().contains("at least 3 vertices"));

        let bad_conf = FenceSpec::new("c", "", &SQUARE).min_confidence(1.5);
        assert!(Fence::from_spec(&bad_conf).is_err());
        let bad_dwell = FenceSpec::new("d", "", &SQUARE).dwell_time_threshold(-1.0);
        assert!(Fence::from_spec(&bad_dwell).is_err());
        let nan_dwell = FenceSpec::new("e", "", &SQUARE).dwell_time_threshold(f64::NAN);
        assert!(Fence::from_spec(&nan_dwell).is_err());
        assert!(Fence::from_spec(&FenceSpec::new(" ", "", &SQUARE)).is_err());
    }

    #[test]
    fn oversized_dwell_threshold_is_an_error() {
        let huge = FenceSpec::new("h", "", &SQUARE).dwell_time_threshold(1e20);
        let err = Fence::from_spec(&huge).unwrap_err();
        assert_eq!(
            err,
            FenceError::InSpec {
                id: "h".to_string(),
                source: Box::new(FenceError::InvalidDwellThreshold(1e20)),
            }
        );
        let inf = FenceSpec::new("i", "", &SQUARE).dwell_time_threshold(f64::INFINITY);
        assert!(Fence::from_spec(&inf).is_err());
    }

    #[test]
    fn name_falls_back_to_id() {
        let f = Fence::from_spec(&FenceSpec::new("gate", "", &SQUARE)).unwrap();
        assert_eq!(f.name(), "gate");
    }

    #[test]
    fn filters_class_and_confidence() {
        let t0 = Instant::now();
        let mut f = fence(0.0);
        let mut car = person(None);
        car.class_label = "car".to_string();
        assert!(f.evaluate(&car, t0, "cam").is_none());

        let mut faint = person(None);
        faint.confidence = 0.49;
        assert!(f.evaluate(&faint, t0, "cam").is_none());

        let mut exact = person(None);
        exact.confidence = 0.5;
        assert!(f.evaluate(&exact, t0, "cam").is_some());
    }

    #[test]
    fn empty_class_filter_accepts_everything() {
        let mut f = Fence::from_spec(&FenceSpec::new("any", "", &SQUARE)).unwrap();
        let mut cat = person(None);
        cat.class_label = "cat".to_string();
        assert!(f.evaluate(&cat, Instant::now(), "cam").is_some());
    }

    #[test]
    fn untracked_detections_trigger_every_time() {
        let t0 = Instant::now();
        let mut f = fence(3.0);
        for i in 0..3 {
            let ev = f.evaluate(&person(None), at(t0, i as f64), "cam").unwrap();
            assert_eq!(ev.dwell_time, 0.0);
            assert_eq!(ev.track_id, None);
            assert_eq!(ev.dwell_time_threshold, 3.0);
        }
        assert_eq!(f.tracked_count(), 0);
    }

    #[test]
    fn tracked_object_triggers_once_at_threshold() {
        let t0 = Instant::now();
        let mut f = fence(3.0);
        let mut events = Vec::new();
        for i in 0..5 {
            if let Some(ev) = f.evaluate(&person(Some(1)), at(t0, i as f64), "cam") {
                events.push((i, ev));
            }
        }
        assert_eq!(events.len(), 1);
        let (i, ev) = &events[0];
        assert_eq!(*i, 3);
        assert_eq!(ev.dwell_time, 3.0);
        assert_eq!(ev.track_id, Some(1));
        assert_eq!(ev.fence_name, "loading bay");
        assert_eq!(ev.stream_id, "cam");
    }

    #[test]
    fn zero_threshold_triggers_on_entry() {
        let mut f = fence(0.0);
        let ev = f.evaluate(&person(Some(4)), Instant::now(), "cam").unwrap();
        assert_eq!(ev.dwell_time, 0.0);
        assert_eq!(
            f.tracked_state(4).map(|s| s.phase()),
            Some(DwellPhase::Latched)
        );
    }

    #[test]
    fn objects_seen_only_outside_are_not_tracked() {
        let mut f = fence(1.0);
        let outside = Detection::new("person", 0.9, BBox::new(500.0, 500.0, 600.0, 650.0)).tracked(9);
        assert!(f.evaluate(&outside, Instant::now(), "cam").is_none());
        assert_eq!(f.tracked_count(), 0);
    }

    #[test]
    fn leaving_marks_absent_and_reentry_restarts() {
        let t0 = Instant::now();
        let mut f = fence(2.0);
        let outside = Detection::new("person", 0.9, BBox::new(500.0, 500.0, 600.0, 650.0)).tracked(2);

        assert!(f.evaluate(&person(Some(2)), at(t0, 0.0), "cam").is_none());
        assert!(f.evaluate(&person(Some(2)), at(t0, 1.0), "cam").is_none());
        assert!(f.evaluate(&outside, at(t0, 1.5), "cam").is_none());
        assert_eq!(f.tracked_state(2).unwrap().phase(), DwellPhase::Absent);

        assert!(f.evaluate(&person(Some(2)), at(t0, 2.0), "cam").is_none());
        assert_eq!(f.dwell_time(2), Some(Duration::ZERO));
        assert!(f.evaluate(&person(Some(2)), at(t0, 3.0), "cam").is_none());
        let ev = f.evaluate(&person(Some(2)), at(t0, 4.0), "cam").unwrap();
        assert_eq!(ev.dwell_time, 2.0);
    }

    #[test]
    fn reaper_removes_stale_tracks() {
        let t0 = Instant::now();
        let mut f = fence(10.0);
        f.evaluate(&person(Some(1)), t0, "cam");
        f.evaluate(&person(Some(2)), at(t0, 1.0), "cam");

        assert_eq!(f.reap_stale(at(t0, 2.5), Duration::from_secs(2)), 1);
        assert!(f.dwell_time(1).is_none());
        assert_eq!(f.reap_stale(at(t0, 3.5), Duration::from_secs(2)), 1);
        assert_eq!(f.tracked_count(), 0);
    }

    #[test]
    fn fuzzy_overlap_is_opt_in() {
        let t0 = Instant::now();
        let straddling = Detection::new("person", 0.9, BBox::new(200.0, 200.0, 300.0, 450.0));

        let mut strict = fence(0.0);
        assert!(strict.evaluate(&straddling, t0, "cam").is_none());

        let mut fuzzy = fence(0.0).with_overlap_threshold(0.4).unwrap();
        assert!(fuzzy.evaluate(&straddling, t0, "cam").is_some());

        assert!(fence(0.0).with_overlap_threshold(1.2).is_err());
    }

    #[test]
    fn record_defaults_from_json() {
        let spec: FenceSpec =
            serde_json::from_str(r#"{"id":"f","points":[[0,0],[10,0],[10,10]]}"#).unwrap();
        assert_eq!(spec.min_confidence, 0.5);
        assert_eq!(spec.dwell_time_threshold, 0.0);
        assert!(spec.enabled);
        assert!(spec.target_classes.is_empty());
    }
}
