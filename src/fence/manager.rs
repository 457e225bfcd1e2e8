use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use super::{Fence, FenceError, FenceSpec, IntrusionEvent};
use crate::detect::Detection;

/// Tracks unseen for longer than this are reaped.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives intrusion events from a [`FenceManager`].
///
/// Any `FnMut(&IntrusionEvent) -> anyhow::Result<()>` closure is an observer.
pub trait IntrusionObserver: Send {
    fn on_intrusion(&mut self, event: &IntrusionEvent) -> Result<()>;

    /// Label used when logging observer failures.
    fn name(&self) -> &str {
        "observer"
    }
}

impl<F> IntrusionObserver for F
where
    F: FnMut(&IntrusionEvent) -> Result<()> + Send,
{
    fn on_intrusion(&mut self, event: &IntrusionEvent) -> Result<()> {
        self(event)
    }
}

/// All fences of one stream, plus the observers that hear about intrusions.
///
/// A manager is owned by exactly one processing unit; dwell bookkeeping is
/// stream-local and is never shared between streams.
pub struct FenceManager {
    stream_id: String,
    fences: Vec<Fence>,
    observers: Vec<Box<dyn IntrusionObserver>>,
    stale_timeout: Duration,
}

impl FenceManager {
    pub fn new(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            fences: Vec::new(),
            observers: Vec::new(),
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Admit a fence. A fence with the same id is replaced, dropping its
    /// tracked state.
    pub fn add_fence(&mut self, fence: Fence) {
        log::info!(
            "[{}] fence added: {} (id={}, dwell={:.1}s)",
            self.stream_id,
            fence.name(),
            fence.id(),
            fence.dwell_threshold().as_secs_f64()
        );
        if let Some(existing) = self.fences.iter_mut().find(|f| f.id() == fence.id()) {
            log::warn!(
                "[{}] fence {} replaced an existing definition",
                self.stream_id,
                fence.id()
            );
            *existing = fence;
        } else {
            self.fences.push(fence);
        }
    }

    /// Remove a fence by id. Removing an unknown id is a no-op.
    pub fn remove_fence(&mut self, fence_id: &str) -> bool {
        let Some(pos) = self.fences.iter().position(|f| f.id() == fence_id) else {
            return false;
        };
        let removed = self.fences.remove(pos);
        log::info!("[{}] fence removed: {}", self.stream_id, removed.name());
        true
    }

    /// Build and admit fences from declarative records.
    ///
    /// Every enabled record is validated before any is admitted, so a bad
    /// record leaves the manager unchanged. Disabled records are skipped.
    pub fn load_specs(&mut self, specs: &[FenceSpec]) -> Result<usize, FenceError> {
        let mut built = Vec::with_capacity(specs.len());
        for spec in specs {
            if !spec.enabled {
                log::info!("[{}] fence {} is disabled, skipping", self.stream_id, spec.id);
                continue;
            }
            built.push(Fence::from_spec(spec)?);
        }
        let count = built.len();
        for fence in built {
            self.add_fence(fence);
        }
        log::info!("[{}] loaded {} fence(s)", self.stream_id, count);
        Ok(count)
    }

    pub fn register_observer<O: IntrusionObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    pub fn fence(&self, fence_id: &str) -> Option<&Fence> {
        self.fences.iter().find(|f| f.id() == fence_id)
    }

    pub fn fences(&self) -> impl Iterator<Item = &Fence> {
        self.fences.iter()
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Tracked states across all fences.
    pub fn tracked_count(&self) -> usize {
        self.fences.iter().map(Fence::tracked_count).sum()
    }

    pub fn check_detections(&mut self, detections: &[Detection]) -> Vec<IntrusionEvent> {
        self.check_detections_at(detections, Instant::now())
    }

    /// Evaluate one batch against every fence, notify observers of each
    /// event, then reap stale tracks.
    pub fn check_detections_at(
        &mut self,
        detections: &[Detection],
        now: Instant,
    ) -> Vec<IntrusionEvent> {
        let mut events = Vec::new();
        for detection in detections {
            for fence in self.fences.iter_mut() {
                if let Some(event) = fence.evaluate(detection, now, &self.stream_id) {
                    log::info!(
                        "[{}] intrusion: fence={} class={} track={:?} dwell={:.2}s conf={:.2}",
                        self.stream_id,
                        event.fence_name,
                        event.object_class,
                        event.track_id,
                        event.dwell_time,
                        event.confidence
                    );
                    dispatch(&self.stream_id, &mut self.observers, &event);
                    events.push(event);
                }
            }
        }

        let reaped: usize = self
            .fences
            .iter_mut()
            .map(|f| f.reap_stale(now, self.stale_timeout))
            .sum();
        if reaped > 0 {
            log::debug!("[{}] reaped {} stale track(s)", self.stream_id, reaped);
        }
        events
    }
}

/// Deliver an event to every observer. A failing or panicking observer is
/// logged and skipped; the rest still hear about the event.
fn dispatch(stream_id: &str, observers: &mut [Box<dyn IntrusionObserver>], event: &IntrusionEvent) {
    for observer in observers.iter_mut() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| observer.on_intrusion(event)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!(
                "[{}] intrusion observer {} failed: {:#}",
                stream_id,
                observer.name(),
                err
            ),
            Err(_) => log::error!(
                "[{}] intrusion observer {} panicked",
                stream_id,
                observer.name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    const LEFT: [[f32; 2]; 4] = [[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]];
    const RIGHT: [[f32; 2]; 4] = [[200.0, 0.0], [300.0, 0.0], [300.0, 100.0], [200.0, 100.0]];

    fn manager() -> FenceManager {
        let mut m = FenceManager::new("cam-1");
        m.load_specs(&[
            FenceSpec::new("f1", "left", &LEFT).dwell_time_threshold(2.0),
            FenceSpec::new("f2", "right", &RIGHT).dwell_time_threshold(5.0),
        ])
        .unwrap();
        m
    }

    fn in_left(track: u64) -> Detection {
        Detection::new("person", 0.8, BBox::new(50.0, 50.0, 80.0, 90.0)).tracked(track)
    }

    #[test]
    fn add_replace_and_remove_fences() {
        let mut m = manager();
        assert_eq!(m.len(), 2);

        let replacement = Fence::from_spec(&FenceSpec::new("f1", "left v2", &LEFT)).unwrap();
        m.add_fence(replacement);
        assert_eq!(m.len(), 2);
        assert_eq!(m.fence("f1").unwrap().name(), "left v2");

        assert!(m.remove_fence("f2"));
        assert!(!m.remove_fence("f2"));
        assert!(!m.remove_fence("missing"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn load_is_all_or_nothing() {
        let mut m = FenceManager::new("cam-1");
        let err = m
            .load_specs(&[
                FenceSpec::new("ok", "", &LEFT),
                FenceSpec::new("broken", "", &LEFT[..2]),
            ])
            .unwrap_err();
        assert!(matches!(err, FenceError::InSpec { ref id, .. } if id == "broken"));
        assert!(m.is_empty());
    }

    #[test]
    fn unrepresentable_dwell_threshold_rejects_the_load() {
        let mut m = FenceManager::new("cam-1");
        let err = m
            .load_specs(&[
                FenceSpec::new("ok", "", &LEFT),
                FenceSpec::new("forever", "", &RIGHT).dwell_time_threshold(1e20),
            ])
            .unwrap_err();
        assert!(matches!(err, FenceError::InSpec { ref id, .. } if id == "forever"));
        assert!(m.is_empty());
    }

    #[test]
    fn disabled_fences_are_skipped() {
        let mut m = FenceManager::new("cam-1");
        let loaded = m
            .load_specs(&[
                FenceSpec::new("on", "", &LEFT),
                // Invalid but disabled: never validated.
                FenceSpec::new("off", "", &LEFT[..1]).enabled(false),
            ])
            .unwrap();
        assert_eq!(loaded, 1);
        assert!(m.fence("off").is_none());
    }

    #[test]
    fn observers_receive_events_for_matching_fence_only() {
        let t0 = Instant::now();
        let mut m = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.register_observer(move |ev: &IntrusionEvent| {
            sink.lock().unwrap().push(ev.fence_id.clone());
            Ok(())
        });

        for i in 0..3 {
            m.check_detections_at(&[in_left(1)], t0 + Duration::from_secs(i));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["f1".to_string()]);
        assert!(m.fence("f2").unwrap().tracked_count() == 0);
    }

    #[test]
    fn failing_observers_do_not_block_others() {
        let mut m = FenceManager::new("cam-1");
        m.load_specs(&[FenceSpec::new("f", "", &LEFT)]).unwrap();

        let delivered = Arc::new(Mutex::new(0));
        m.register_observer(|_: &IntrusionEvent| Err(anyhow!("database offline")));
        m.register_observer(|_: &IntrusionEvent| -> Result<()> { panic!("observer bug") });
        let counter = delivered.clone();
        m.register_observer(move |_: &IntrusionEvent| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let untracked = Detection::new("person", 0.8, BBox::new(50.0, 50.0, 80.0, 90.0));
        let events = m.check_detections(&[untracked.clone(), untracked]);
        assert_eq!(events.len(), 2);
        assert_eq!(*delivered.lock().unwrap(), 2);
    }

    #[test]
    fn empty_batches_still_reap() {
        let t0 = Instant::now();
        let mut m = manager();
        m.check_detections_at(&[in_left(1), in_left(2)], t0);
        assert_eq!(m.tracked_count(), 2);

        m.check_detections_at(&[], t0 + Duration::from_millis(2001));
        assert_eq!(m.tracked_count(), 0);
    }

    #[test]
    fn custom_stale_timeout() {
        let t0 = Instant::now();
        let mut m = manager().with_stale_timeout(Duration::from_secs(10));
        m.check_detections_at(&[in_left(1)], t0);
        m.check_detections_at(&[], t0 + Duration::from_secs(5));
        assert_eq!(m.tracked_count(), 1);
    }

    struct NamedObserver;

    impl IntrusionObserver for NamedObserver {
        fn on_intrusion(&mut self, _event: &IntrusionEvent) -> Result<()> {
            Err(anyhow!("always fails"))
        }

        fn name(&self) -> &str {
            "named"
        }
    }

    #[test]
    fn trait_observers_can_be_registered() {
        let mut m = FenceManager::new("cam-1");
        m.load_specs(&[FenceSpec::new("f", "", &LEFT)]).unwrap();
        m.register_observer(NamedObserver);
        let untracked = Detection::new("person", 0.8, BBox::new(50.0, 50.0, 80.0, 90.0));
        assert_eq!(m.check_detections(&[untracked]).len(), 1);
    }
}
