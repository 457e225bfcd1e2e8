use std::time::{Duration, Instant};

use fencewatch::{BBox, Detection, FenceManager, FenceSpec, IntrusionEvent};

const SQUARE: [[f32; 2]; 4] = [[100.0, 100.0], [400.0, 100.0], [400.0, 400.0], [100.0, 400.0]];

fn manager(threshold: f64) -> FenceManager {
    let mut manager = FenceManager::new("cam-test");
    manager
        .load_specs(&[FenceSpec::new("test_001", "test fence", &SQUARE)
            .target_classes(&["person"])
            .min_confidence(0.5)
            .dwell_time_threshold(threshold)])
        .expect("valid fence");
    manager
}

fn person(track: u64, bbox: [f32; 4]) -> Detection {
    Detection::new("person", 0.8, bbox.into()).tracked(track)
}

fn at(t0: Instant, secs: f64) -> Instant {
    t0 + Duration::from_secs_f64(secs)
}

const INSIDE: [f32; 4] = [200.0, 200.0, 300.0, 350.0];
const OUTSIDE: [f32; 4] = [500.0, 500.0, 600.0, 650.0];

#[test]
fn object_dwelling_past_threshold_triggers_once() {
    let t0 = Instant::now();
    let mut m = manager(3.0);

    let mut fired_at = Vec::new();
    for i in 0..5 {
        let events = m.check_detections_at(&[person(1, INSIDE)], at(t0, i as f64));
        if !events.is_empty() {
            fired_at.push(i);
            assert_eq!(events[0].dwell_time, 3.0);
            assert_eq!(events[0].dwell_time_threshold, 3.0);
            assert_eq!(events[0].track_id, Some(1));
            assert_eq!(events[0].stream_id, "cam-test");
        }
    }
    assert_eq!(fired_at, vec![3]);
    let fence = m.fence("test_001").unwrap();
    assert_eq!(fence.dwell_time(1), Some(Duration::from_secs(4)));
}

#[test]
fn leaving_before_threshold_never_triggers() {
    let t0 = Instant::now();
    let mut m = manager(3.0);

    let mut events = Vec::new();
    events.extend(m.check_detections_at(&[person(2, INSIDE)], at(t0, 0.0)));
    events.extend(m.check_detections_at(&[person(2, INSIDE)], at(t0, 1.0)));
    events.extend(m.check_detections_at(&[person(2, OUTSIDE)], at(t0, 2.0)));
    // Back inside: the clock starts over.
    events.extend(m.check_detections_at(&[person(2, INSIDE)], at(t0, 2.5)));
    events.extend(m.check_detections_at(&[person(2, INSIDE)], at(t0, 4.0)));
    assert!(events.is_empty());
    assert_eq!(
        m.fence("test_001").unwrap().dwell_time(2),
        Some(Duration::from_millis(1500))
    );

    let late = m.check_detections_at(&[person(2, INSIDE)], at(t0, 5.5));
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].dwell_time, 3.0);
}

#[test]
fn tracks_accrue_dwell_independently() {
    let t0 = Instant::now();
    let mut m = manager(3.0);
    let bbox_a = [150.0, 150.0, 250.0, 300.0];
    let bbox_b = [250.0, 150.0, 350.0, 300.0];

    let mut triggered: Vec<IntrusionEvent> = Vec::new();
    for i in 0..5 {
        let mut batch = vec![person(4, bbox_b)];
        if i < 2 {
            batch.push(person(3, bbox_a));
        }
        triggered.extend(m.check_detections_at(&batch, at(t0, i as f64)));
    }
    let tracks: Vec<_> = triggered.iter().map(|e| e.track_id).collect();
    assert_eq!(tracks, vec![Some(4)]);
}

#[test]
fn stale_tracks_are_reaped() {
    let t0 = Instant::now();
    let mut m = manager(3.0);
    m.check_detections_at(&[person(5, INSIDE), person(6, INSIDE)], t0);
    assert_eq!(m.tracked_count(), 2);

    m.check_detections_at(&[], at(t0, 2.0));
    assert_eq!(m.tracked_count(), 2);
    m.check_detections_at(&[], at(t0, 2.001));
    assert_eq!(m.tracked_count(), 0);
    assert_eq!(m.fence("test_001").unwrap().dwell_time(5), None);
}

#[test]
fn reaped_track_starts_over_on_return() {
    let t0 = Instant::now();
    let mut m = manager(3.0);
    m.check_detections_at(&[person(7, INSIDE)], at(t0, 0.0));
    m.check_detections_at(&[person(7, INSIDE)], at(t0, 2.0));
    // Gone long enough to be forgotten.
    m.check_detections_at(&[], at(t0, 5.0));
    let events = m.check_detections_at(&[person(7, INSIDE)], at(t0, 6.0));
    assert!(events.is_empty());
    assert_eq!(
        m.fence("test_001").unwrap().dwell_time(7),
        Some(Duration::ZERO)
    );
}

#[test]
fn untracked_detections_trigger_on_every_sample() {
    let t0 = Instant::now();
    let mut m = manager(3.0);
    let untracked = Detection::new("person", 0.9, BBox::new(200.0, 200.0, 300.0, 350.0));

    for i in 0..3 {
        let events = m.check_detections_at(&[untracked.clone()], at(t0, i as f64));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].dwell_time, 0.0);
        assert_eq!(events[0].track_id, None);
    }
    assert_eq!(m.tracked_count(), 0);
}

#[test]
fn filtered_detections_leave_no_state() {
    let t0 = Instant::now();
    let mut m = manager(0.0);
    let dog = Detection::new("dog", 0.9, INSIDE.into()).tracked(8);
    let faint = Detection::new("person", 0.49, INSIDE.into()).tracked(9);

    assert!(m.check_detections_at(&[dog, faint], t0).is_empty());
    assert_eq!(m.tracked_count(), 0);
}

#[test]
fn zero_threshold_triggers_on_entry() {
    let t0 = Instant::now();
    let mut m = manager(0.0);
    let events = m.check_detections_at(&[person(10, INSIDE)], t0);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].dwell_time, 0.0);
    assert!(m
        .check_detections_at(&[person(10, INSIDE)], at(t0, 1.0))
        .is_empty());
}
