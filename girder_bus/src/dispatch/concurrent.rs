use crate::dispatch::policy::{DispatchJob, Dispatcher};
use serde_json::Value;

/// Schedules every delegate immediately, with no cross-key coordination: many
/// delegates for one key may run simultaneously, and completion order is
/// unrelated to push order.
///
/// This is the default policy; use it when ordering is irrelevant and
/// throughput dominates.
pub struct ConcurrentDispatcher;

impl Dispatcher for ConcurrentDispatcher {
    fn push(&self, _key: &str, _payload: Option<&Value>, job: DispatchJob) {
        // The spawned task isolates panics from the caller
        tokio::spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    async fn drained(log: &Arc<SyncMutex<Vec<usize>>>, expected: usize) {
        for _ in 0..200 {
            if log.lock().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("delegates did not finish in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_delegate_runs_exactly_once() {
        // Given
        let dispatcher = ConcurrentDispatcher;
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When
        for index in 0..10 {
            let log = Arc::clone(&log);
            dispatcher.push(
                "key",
                None,
                Box::pin(async move {
                    log.lock().push(index);
                }),
            );
        }
        drained(&log, 10).await;

        // Then
        let mut completed = log.lock().clone();
        completed.sort_unstable();
        assert_eq!(completed, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completion_order_is_not_guaranteed() {
        // Given: the first delegate is the slowest by a wide margin
        let dispatcher = ConcurrentDispatcher;
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When
        for index in 0..4usize {
            let log = Arc::clone(&log);
            let delay = Duration::from_millis(80 - 20 * index as u64);
            dispatcher.push(
                "key",
                None,
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    log.lock().push(index);
                }),
            );
        }
        drained(&log, 4).await;

        // Then: at least one completion is out of push order
        let completed = log.lock().clone();
        assert_ne!(completed, (0..4).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panics_are_contained() {
        // Given
        let dispatcher = ConcurrentDispatcher;
        let log = Arc::new(SyncMutex::new(Vec::new()));

        // When: a panicking delegate is followed by a normal one
        dispatcher.push("key", None, Box::pin(async { panic!("boom") }));
        {
            let log = Arc::clone(&log);
            dispatcher.push(
                "key",
                None,
                Box::pin(async move {
                    log.lock().push(1);
                }),
            );
        }
        drained(&log, 1).await;

        // Then
        assert_eq!(log.lock().clone(), vec![1]);
    }
}
