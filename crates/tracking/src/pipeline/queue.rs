//! Bounded single-producer queues linking the pipeline stages.
//!
//! Both policies keep the producer non-blocking. `DropOldest` evicts whatever
//! is pending so the consumer always sees the freshest item; `DropNewest`
//! rejects the incoming item and leaves the queued ones untouched. Drops are
//! counted, never raised.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use thiserror::Error;

/// Metric label of the acquisition → processing queue.
pub const CAPTURE_QUEUE: &str = "capture";
/// Metric label of the processing → orchestrator queue.
pub const RESULT_QUEUE: &str = "result";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Inserted after evicting this many stale items.
    Replaced(usize),
    /// Rejected because the queue was full.
    Dropped,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{queue} queue has no receiver")]
pub struct QueueClosed {
    pub queue: &'static str,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl QueueStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct QueueSender<T> {
    name: &'static str,
    tx: Sender<T>,
    evict: Option<Receiver<T>>,
    receiver_alive: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
}

pub struct QueueReceiver<T> {
    name: &'static str,
    rx: Receiver<T>,
    alive: Arc<AtomicBool>,
}

/// Create a queue holding at most `capacity` items (minimum one).
pub fn bounded_queue<T>(
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let alive = Arc::new(AtomicBool::new(true));
    let evict = match policy {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        OverflowPolicy::DropNewest => None,
    };
    (
        QueueSender {
            name,
            tx,
            evict,
            receiver_alive: alive.clone(),
            stats: Arc::new(QueueStats::default()),
        },
        QueueReceiver { name, rx, alive },
    )
}

impl<T> QueueSender<T> {
    pub fn push(&self, item: T) -> Result<PushOutcome, QueueClosed> {
        if !self.receiver_alive.load(Ordering::Acquire) {
            return Err(QueueClosed { queue: self.name });
        }

        let mut item = item;
        let mut evicted = 0usize;
        let outcome = loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    break if evicted == 0 {
                        PushOutcome::Queued
                    } else {
                        PushOutcome::Replaced(evicted)
                    };
                }
                Err(TrySendError::Full(rejected)) => match &self.evict {
                    Some(evict) => {
                        if evict.try_recv().is_ok() {
                            evicted += 1;
                        }
                        item = rejected;
                    }
                    None => break PushOutcome::Dropped,
                },
                Err(TrySendError::Disconnected(_)) => {
                    return Err(QueueClosed { queue: self.name });
                }
            }
        };

        let dropped = match outcome {
            PushOutcome::Queued => 0,
            PushOutcome::Replaced(count) => count as u64,
            PushOutcome::Dropped => 1,
        };
        if outcome != PushOutcome::Dropped {
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        if dropped > 0 {
            self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
            metrics::counter!("tracker_queue_dropped_total", "queue" => self.name)
                .increment(dropped);
        }
        metrics::gauge!("tracker_queue_depth", "queue" => self.name).set(self.tx.len() as f64);
        Ok(outcome)
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> QueueReceiver<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest_keeps_only_the_latest() {
        let (tx, rx) = bounded_queue(CAPTURE_QUEUE, 1, OverflowPolicy::DropOldest);
        assert_eq!(tx.push(1), Ok(PushOutcome::Queued));
        for n in 2..=10 {
            assert_eq!(tx.push(n), Ok(PushOutcome::Replaced(1)));
        }
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv(), Ok(10));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(tx.stats().dropped(), 9);
        assert_eq!(tx.stats().pushed(), 10);
    }

    #[test]
    fn drop_newest_preserves_existing_contents() {
        let (tx, rx) = bounded_queue(RESULT_QUEUE, 3, OverflowPolicy::DropNewest);
        for n in 0..3 {
            assert_eq!(tx.push(n), Ok(PushOutcome::Queued));
        }
        for n in 3..20 {
            assert_eq!(tx.push(n), Ok(PushOutcome::Dropped));
            assert!(rx.len() <= 3);
        }
        let drained: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(tx.stats().dropped(), 17);
    }

    #[test]
    fn push_fails_once_receiver_is_gone() {
        for policy in [OverflowPolicy::DropOldest, OverflowPolicy::DropNewest] {
            let (tx, rx) = bounded_queue::<u8>(CAPTURE_QUEUE, 1, policy);
            drop(rx);
            assert_eq!(tx.push(1), Err(QueueClosed { queue: CAPTURE_QUEUE }));
        }
    }

    #[test]
    fn receiver_sees_disconnect_after_sender_drops() {
        let (tx, rx) = bounded_queue(RESULT_QUEUE, 2, OverflowPolicy::DropNewest);
        tx.push(5).unwrap();
        drop(tx);
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Ok(5));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let (tx, rx) = bounded_queue(CAPTURE_QUEUE, 0, OverflowPolicy::DropOldest);
        tx.push('a').unwrap();
        tx.push('b').unwrap();
        assert_eq!(rx.try_recv(), Ok('b'));
    }

    #[test]
    fn stage_queues_report_their_metric_labels() {
        let (capture, _capture_rx) = bounded_queue::<u8>(CAPTURE_QUEUE, 1, OverflowPolicy::DropOldest);
        let (result, result_rx) = bounded_queue::<u8>(RESULT_QUEUE, 1, OverflowPolicy::DropNewest);
        assert_eq!(capture.name(), "capture");
        assert_eq!(result.name(), "result");
        assert_eq!(result_rx.name(), result.name());
    }
}
