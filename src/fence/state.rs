use std::time::{Duration, Instant};

use crate::geometry::BBox;

/// Where a tracked object stands in its dwell cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DwellPhase {
    /// Last observed outside the zone.
    Absent,
    /// Inside, threshold not yet reached.
    Accumulating,
    /// Inside, event already emitted for this interval.
    Latched,
}

/// Occupancy record for one track inside one fence.
#[derive(Clone, Debug)]
pub struct TrackedObjectState {
    pub in_zone: bool,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub dwell_time: Duration,
    pub triggered: bool,
    pub last_bbox: BBox,
    pub object_class: String,
}

impl TrackedObjectState {
    /// First sighting inside the zone.
    pub fn entered(now: Instant, bbox: BBox, object_class: &str) -> Self {
        Self {
            in_zone: true,
            first_seen: now,
            last_seen: now,
            dwell_time: Duration::ZERO,
            triggered: false,
            last_bbox: bbox,
            object_class: object_class.to_string(),
        }
    }

    /// Subsequent sighting inside the zone.
    ///
    /// A sighting after an observed exit starts a new interval: the dwell
    /// clock restarts and the latch is released.
    pub fn observe_inside(&mut self, now: Instant, bbox: BBox, object_class: &str) {
        if self.in_zone {
            self.dwell_time = now.saturating_duration_since(self.first_seen);
        } else {
            self.in_zone = true;
            self.first_seen = now;
            self.dwell_time = Duration::ZERO;
            self.triggered = false;
        }
        self.last_seen = now;
        self.last_bbox = bbox;
        if self.object_class != object_class {
            self.object_class = object_class.to_string();
        }
    }

    pub fn observe_outside(&mut self, now: Instant, bbox: BBox) {
        self.in_zone = false;
        self.last_seen = now;
        self.last_bbox = bbox;
    }

    /// Set the latch if the threshold has been reached in this interval.
    /// Returns true only on the transition.
    pub fn latch_if_due(&mut self, threshold: Duration) -> bool {
        if self.in_zone && !self.triggered && self.dwell_time >= threshold {
            self.triggered = true;
            return true;
        }
        false
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn phase(&self) -> DwellPhase {
        match (self.in_zone, self.triggered) {
            (false, _) => DwellPhase::Absent,
            (true, false) => DwellPhase::Accumulating,
            (true, true) => DwellPhase::Latched,
        }
    }
}
