//! Bounded, drop-oldest frame relay between a capture unit and a processing unit.
//!
//! The relay never blocks the producer: when it is full the oldest queued frame
//! is evicted to make room, so the consumer always sees the freshest frames in
//! capture order.

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub const DEFAULT_CAPACITY: usize = 5;
/// How long the consumer blocks on an empty relay before re-checking the stop flag.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(1);

type Item = (Instant, Frame);

/// Create a relay holding at most `capacity` frames. A zero capacity is raised to 1.
pub fn relay(capacity: usize) -> (RelaySender, RelayReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let receiver_dropped = Arc::new(AtomicBool::new(false));
    (
        RelaySender {
            tx,
            evict: rx.clone(),
            receiver_dropped: receiver_dropped.clone(),
        },
        RelayReceiver {
            rx,
            receiver_dropped,
        },
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Frames discarded to make room for this one.
    pub evicted: usize,
}

pub enum RelayRecv {
    Frame(Instant, Frame),
    Timeout,
    /// Every sender is gone and the queue is drained.
    Closed,
}

pub struct RelaySender {
    tx: Sender<Item>,
    evict: Receiver<Item>,
    receiver_dropped: Arc<AtomicBool>,
}

impl RelaySender {
    pub fn push(&self, captured_at: Instant, frame: Frame) -> Result<PushOutcome> {
        if self.receiver_dropped.load(Ordering::SeqCst) {
            bail!("relay receiver dropped");
        }
        let mut outcome = PushOutcome::default();
        let mut item = (captured_at, frame);
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(outcome),
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // The consumer may have drained a slot in the meantime.
                    match self.evict.try_recv() {
                        Ok(_stale) => outcome.evicted += 1,
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => bail!("relay closed"),
                    }
                }
                Err(TrySendError::Disconnected(_)) => bail!("relay closed"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(DEFAULT_CAPACITY)
    }
}

pub struct RelayReceiver {
    rx: Receiver<Item>,
    receiver_dropped: Arc<AtomicBool>,
}

impl RelayReceiver {
    pub fn recv_timeout(&self, wait: Duration) -> RelayRecv {
        match self.rx.recv_timeout(wait) {
            Ok((captured_at, frame)) => RelayRecv::Frame(captured_at, frame),
            Err(RecvTimeoutError::Timeout) => RelayRecv::Timeout,
            Err(RecvTimeoutError::Disconnected) => RelayRecv::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for RelayReceiver {
    fn drop(&mut self) {
        self.receiver_dropped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0u8; 4], 1, 1, seq)
    }

    fn take(rx: &RelayReceiver) -> Option<u64> {
        match rx.recv_timeout(Duration::from_millis(10)) {
            RelayRecv::Frame(_, f) => Some(f.sequence()),
            _ => None,
        }
    }

    #[test]
    fn overflow_keeps_newest_in_order() {
        let (tx, rx) = relay(3);
        let now = Instant::now();
        let mut evicted = 0;
        for seq in 1..=4 {
            evicted += tx.push(now, frame(seq)).unwrap().evicted;
        }
        assert_eq!(evicted, 1);
        assert_eq!(rx.len(), 3);
        assert_eq!(take(&rx), Some(2));
        assert_eq!(take(&rx), Some(3));
        assert_eq!(take(&rx), Some(4));
        assert_eq!(take(&rx), None);
    }

    #[test]
    fn push_below_capacity_evicts_nothing() {
        let (tx, _rx) = relay(DEFAULT_CAPACITY);
        let outcome = tx.push(Instant::now(), frame(1)).unwrap();
        assert_eq!(outcome, PushOutcome::default());
        assert_eq!(tx.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (tx, rx) = relay(0);
        tx.push(Instant::now(), frame(1)).unwrap();
        assert_eq!(tx.push(Instant::now(), frame(2)).unwrap().evicted, 1);
        assert_eq!(take(&rx), Some(2));
    }

    #[test]
    fn captured_at_travels_with_frame() {
        let (tx, rx) = relay(2);
        let stamp = Instant::now() - Duration::from_secs(3);
        tx.push(stamp, frame(9)).unwrap();
        match rx.recv_timeout(Duration::from_millis(10)) {
            RelayRecv::Frame(at, f) => {
                assert_eq!(at, stamp);
                assert_eq!(f.sequence(), 9);
            }
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn empty_relay_times_out_and_closes_after_senders_drop() {
        let (tx, rx) = relay(2);
        assert!(matches!(rx.recv_timeout(Duration::from_millis(5)), RelayRecv::Timeout));
        tx.push(Instant::now(), frame(1)).unwrap();
        drop(tx);
        assert_eq!(take(&rx), Some(1));
        assert!(matches!(rx.recv_timeout(Duration::from_millis(5)), RelayRecv::Closed));
    }

    #[test]
    fn push_fails_once_receiver_is_gone() {
        let (tx, rx) = relay(2);
        drop(rx);
        assert!(tx.push(Instant::now(), frame(1)).is_err());
    }
}
