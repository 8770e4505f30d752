//! Delay queue for scheduled retries.
//!
//! All pending retries live in one min-heap owned by a single timer task,
//! instead of one timer per failed job. The number of outstanding entries is
//! capped; callers get the record back when the queue is full.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use crate::JobRecord;

struct RetryEntry {
    fire_at: Instant,
    /// Breaks ties between equal deadlines in scheduling order.
    seq: u64,
    record: JobRecord,
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

/// Producer side: hands records to the timer task.
pub(crate) struct RetryScheduler {
    tx: mpsc::UnboundedSender<RetryEntry>,
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
    next_seq: AtomicU64,
}

/// Consumer side: owns the heap and fires due entries.
pub(crate) struct RetryTimer {
    rx: mpsc::UnboundedReceiver<RetryEntry>,
    heap: BinaryHeap<Reverse<RetryEntry>>,
    outstanding: Arc<AtomicUsize>,
}

impl RetryScheduler {
    pub(crate) fn new(capacity: usize) -> (Self, RetryTimer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let scheduler = Self {
            tx,
            outstanding: Arc::clone(&outstanding),
            capacity,
            next_seq: AtomicU64::new(0),
        };
        let timer = RetryTimer {
            rx,
            heap: BinaryHeap::new(),
            outstanding,
        };
        (scheduler, timer)
    }

    /// Queue `record` to be handed back after `delay`.
    ///
    /// Returns the record if the queue is full or the timer has stopped.
    pub(crate) fn schedule(&self, record: JobRecord, delay: Duration) -> Result<(), JobRecord> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(record);
        }

        let entry = RetryEntry {
            fire_at: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            record,
        };

        self.tx.send(entry).map_err(|mpsc::error::SendError(entry)| {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            entry.record
        })
    }

    /// Retries scheduled but not yet fired.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl RetryTimer {
    /// Run until shutdown, calling `on_due` for each record whose delay
    /// has elapsed, earliest deadline first.
    pub(crate) async fn run<F, Fut>(mut self, mut shutdown_rx: watch::Receiver<bool>, mut on_due: F)
    where
        F: FnMut(JobRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        debug!("retry timer starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next_deadline = self.heap.peek().map(|Reverse(entry)| entry.fire_at);

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                entry = self.rx.recv() => match entry {
                    Some(entry) => self.heap.push(Reverse(entry)),
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.fire_due(&mut on_due).await;
                }
            }
        }

        if !self.heap.is_empty() {
            info!(
                pending = self.heap.len(),
                "retry timer stopping; remaining retries will be replayed on next resume"
            );
        }
        debug!("retry timer shut down");
    }

    async fn fire_due<F, Fut>(&mut self, on_due: &mut F)
    where
        F: FnMut(JobRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        let now = Instant::now();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.fire_at <= now)
        {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            on_due(entry.record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobId, JobKind};
    use serde_json::json;

    fn record(ts: u64) -> JobRecord {
        JobRecord::new(JobId::new(ts, 0), JobKind::MessageSend, json!({}))
    }

    fn spawn_timer(
        timer: RetryTimer,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (mpsc::UnboundedReceiver<(JobId, Instant)>, tokio::task::JoinHandle<()>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(timer.run(shutdown_rx, move |record| {
            let fired_tx = fired_tx.clone();
            async move {
                let _ = fired_tx.send((record.id, Instant::now()));
            }
        }));
        (fired_rx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_deadline_order() {
        let (scheduler, timer) = RetryScheduler::new(10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let start = Instant::now();
        let (mut fired_rx, _handle) = spawn_timer(timer, shutdown_rx);

        scheduler.schedule(record(3), Duration::from_millis(300)).unwrap();
        scheduler.schedule(record(1), Duration::from_millis(100)).unwrap();
        scheduler.schedule(record(2), Duration::from_millis(200)).unwrap();
        assert_eq!(scheduler.outstanding(), 3);

        let mut order = Vec::new();
        for _ in 0..3 {
            let (id, at) = fired_rx.recv().await.unwrap();
            assert!(at - start >= Duration::from_millis(100));
            order.push(id.timestamp_ms());
        }

        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_deadlines_fire_in_schedule_order() {
        let (scheduler, timer) = RetryScheduler::new(10);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut fired_rx, _handle) = spawn_timer(timer, shutdown_rx);

        for ts in [7, 3, 5] {
            scheduler.schedule(record(ts), Duration::from_millis(50)).unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(fired_rx.recv().await.unwrap().0.timestamp_ms());
        }
        assert_eq!(order, vec![7, 3, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_returns_record() {
        let (scheduler, _timer) = RetryScheduler::new(1);

        scheduler.schedule(record(1), Duration::from_secs(1)).unwrap();
        let rejected = scheduler
            .schedule(record(2), Duration::from_secs(1))
            .unwrap_err();

        assert_eq!(rejected.id, JobId::new(2, 0));
        assert_eq!(scheduler.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_timer_dropped_returns_record() {
        let (scheduler, timer) = RetryScheduler::new(5);
        drop(timer);

        let rejected = scheduler
            .schedule(record(1), Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(rejected.id, JobId::new(1, 0));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timer_without_firing() {
        let (scheduler, timer) = RetryScheduler::new(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (mut fired_rx, handle) = spawn_timer(timer, shutdown_rx);

        scheduler.schedule(record(1), Duration::from_secs(60)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(fired_rx.try_recv().is_err());
    }
}
