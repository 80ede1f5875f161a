use crate::dispatch::policy::{DispatchJob, Dispatcher};
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Guarantees strict one-at-a-time, push-ordered execution of delegates
/// sharing a key. Delegates under distinct keys do not coordinate.
///
/// Each key owns a FIFO buffer and a single drain task that awaits the head
/// delegate to full completion before dequeuing the next one. The buffer and
/// its drain task exist only while there is work: both are torn down when the
/// buffer empties, and recreated by the next push.
pub struct SerialDispatcher {
    entries: Arc<SyncMutex<HashMap<String, VecDeque<DispatchJob>>>>,
}

impl SerialDispatcher {
    /// Creates a new, empty [`SerialDispatcher`].
    pub fn new() -> Self {
        Self {
            entries: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    /// Enqueues the delegate under the given effective key. Invariant: an
    /// entry is present in the map iff its drain task is alive, so a missing
    /// entry means a new drain task has to be started.
    pub(crate) fn enqueue(&self, key: String, job: DispatchJob) {
        let mut entries = self.entries.lock();

        match entries.get_mut(&key) {
            Some(buffer) => buffer.push_back(job),
            None => {
                entries.insert(key.clone(), VecDeque::new());
                tokio::spawn(Self::drain(Arc::clone(&self.entries), key, job));
            }
        }
    }

    /// Runs delegates for one key, strictly one at a time, until the buffer
    /// is found empty, at which point the entry is removed and the task ends.
    async fn drain(
        entries: Arc<SyncMutex<HashMap<String, VecDeque<DispatchJob>>>>,
        key: String,
        first: DispatchJob,
    ) {
        let mut job = first;

        loop {
            run_contained(job).await;

            job = {
                let mut entries = entries.lock();

                let Some(buffer) = entries.get_mut(&key) else {
                    return;
                };

                match buffer.pop_front() {
                    Some(next) => next,
                    None => {
                        entries.remove(&key);
                        return;
                    }
                }
            };
        }
    }

    #[cfg(test)]
    fn active_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SerialDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for SerialDispatcher {
    fn push(&self, key: &str, _payload: Option<&Value>, job: DispatchJob) {
        self.enqueue(key.to_string(), job);
    }
}

/// Awaits the given delegate, containing any panic so the drain task (and
/// with it the ordering guarantee for the remaining delegates) survives.
pub(crate) async fn run_contained(job: DispatchJob) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        warn!(alert = true, "Swallowed a panic from a dispatched delegate");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;
    use std::time::Duration;

    async fn drained(log: &Arc<SyncMutex<Vec<(String, usize)>>>, expected: usize) {
        for _ in 0..400 {
            if log.lock().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("delegates did not finish in time");
    }

    fn recording_job(
        log: &Arc<SyncMutex<Vec<(String, usize)>>>,
        key: &str,
        index: usize,
        delay: Duration,
    ) -> DispatchJob {
        let log = Arc::clone(log);
        let key = key.to_string();

        Box::pin(async move {
            tokio::time::sleep(delay).await;
            log.lock().push((key, index));
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executes_in_push_order_under_randomized_latency() {
        // Given
        let dispatcher = SerialDispatcher::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When: delegates with random latency share one key
        let mut rng = rand::rng();
        for index in 0..20 {
            let delay = Duration::from_millis(rng.random_range(1..8));
            dispatcher.push("queue", None, recording_job(&log, "queue", index, delay));
        }
        drained(&log, 20).await;

        // Then: completion order is exactly push order
        let completed = log.lock().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert_eq!(completed, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keys_do_not_coordinate() {
        // Given
        let dispatcher = SerialDispatcher::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When: a slow delegate on one key, quick ones on another
        dispatcher.push(
            "slow",
            None,
            recording_job(&log, "slow", 0, Duration::from_millis(60)),
        );
        for index in 0..3 {
            dispatcher.push(
                "quick",
                None,
                recording_job(&log, "quick", index, Duration::from_millis(1)),
            );
        }
        drained(&log, 4).await;

        // Then: the quick key finished before the slow one, in order
        let completed = log.lock().clone();
        assert_eq!(completed[..3].iter().map(|(_, i)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(completed[..3].iter().all(|(key, _)| key == "quick"));
        assert_eq!(completed[3], ("slow".to_string(), 0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_entries_are_torn_down_and_revived() {
        // Given
        let dispatcher = SerialDispatcher::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When: a first batch drains completely
        dispatcher.push(
            "queue",
            None,
            recording_job(&log, "queue", 0, Duration::from_millis(1)),
        );
        drained(&log, 1).await;

        // Then: the entry is gone
        for _ in 0..100 {
            if dispatcher.active_keys() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(dispatcher.active_keys(), 0);

        // When: a later push revives the key
        dispatcher.push(
            "queue",
            None,
            recording_job(&log, "queue", 1, Duration::from_millis(1)),
        );
        drained(&log, 2).await;

        // Then
        let completed = log.lock().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert_eq!(completed, vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_panicking_delegate_does_not_break_the_chain() {
        // Given
        let dispatcher = SerialDispatcher::new();
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When
        dispatcher.push("queue", None, Box::pin(async { panic!("boom") }));
        dispatcher.push(
            "queue",
            None,
            recording_job(&log, "queue", 1, Duration::from_millis(1)),
        );
        drained(&log, 1).await;

        // Then
        let completed = log.lock().iter().map(|(_, i)| *i).collect::<Vec<_>>();
        assert_eq!(completed, vec![1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_temporal_overlap_within_a_key() {
        // Given
        let dispatcher = SerialDispatcher::new();
        let running = Arc::new(SyncMutex::new(0usize));
        let max_running = Arc::new(SyncMutex::new(0usize));
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When
        for index in 0..10 {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            let log = Arc::clone(&log);

            dispatcher.push(
                "queue",
                None,
                Box::pin(async move {
                    {
                        let mut running = running.lock();
                        *running += 1;
                        let mut max_running = max_running.lock();
                        *max_running = (*max_running).max(*running);
                    }
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    *running.lock() -= 1;
                    log.lock().push(("queue".to_string(), index));
                }),
            );
        }
        drained(&log, 10).await;

        // Then
        assert_eq!(*max_running.lock(), 1);
    }
}
