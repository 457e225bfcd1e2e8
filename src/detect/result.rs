use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// Track identity attached to a detection by an external tracker.
///
/// `Untracked` detections bypass dwell-time bookkeeping and trigger on sight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Track {
    Tracked(u64),
    Untracked,
}

impl Track {
    pub fn id(self) -> Option<u64> {
        match self {
            Track::Tracked(id) => Some(id),
            Track::Untracked => None,
        }
    }
}

impl From<Option<u64>> for Track {
    fn from(id: Option<u64>) -> Self {
        id.map_or(Track::Untracked, Track::Tracked)
    }
}

/// One detected object in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "DetectionRecord", into = "DetectionRecord")]
pub struct Detection {
    pub class_label: String,
    /// 0..=1
    pub confidence: f32,
    pub bbox: BBox,
    pub track: Track,
}

impl Detection {
    pub fn new(class_label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_label: class_label.into(),
            confidence,
            bbox,
            track: Track::Untracked,
        }
    }

    pub fn tracked(mut self, track_id: u64) -> Self {
        self.track = Track::Tracked(track_id);
        self
    }
}

/// Wire shape of a detection: `track_id` is simply absent for untracked objects.
#[derive(Serialize, Deserialize)]
struct DetectionRecord {
    class: String,
    confidence: f32,
    bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    track_id: Option<u64>,
}

impl From<DetectionRecord> for Detection {
    fn from(r: DetectionRecord) -> Self {
        Self {
            class_label: r.class,
            confidence: r.confidence,
            bbox: r.bbox,
            track: r.track_id.into(),
        }
    }
}

impl From<Detection> for DetectionRecord {
    fn from(d: Detection) -> Self {
        Self {
            class: d.class_label,
            confidence: d.confidence,
            bbox: d.bbox,
            track_id: d.track.id(),
        }
    }
}

/// Raw per-detection result handed to the result callback.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessingResult {
    /// Wall-clock processing time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub detection: Detection,
}
