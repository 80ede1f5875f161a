use crate::dispatch::policy::{DispatchJob, Dispatcher};
use crate::dispatch::serial::SerialDispatcher;
use serde_json::Value;

/// The partition value used when no selector yields one.
pub const DEFAULT_PARTITION: &str = "default";

/// Generalizes the [`SerialDispatcher`](crate::SerialDispatcher): the
/// effective ordering key is `key:partition`, where the partition is derived
/// from the message payload by the first configured selector that yields a
/// non-empty value, else `default`.
///
/// Unrelated partitions execute concurrently with each other while each
/// partition stays strictly ordered internally — a tunable middle ground
/// between global ordering and full concurrency.
///
/// A selector is a dot-separated path into the JSON payload, e.g.
/// `"order.customerId"`.
pub struct PartitionSerialDispatcher {
    selectors: Vec<String>,
    inner: SerialDispatcher,
}

impl PartitionSerialDispatcher {
    /// Creates a new dispatcher with the given partition key selectors.
    pub fn new(selectors: Vec<String>) -> Self {
        Self {
            selectors,
            inner: SerialDispatcher::new(),
        }
    }

    /// Derives the partition value for the given payload.
    fn partition_of(&self, payload: Option<&Value>) -> String {
        payload
            .and_then(|value| {
                self.selectors
                    .iter()
                    .find_map(|selector| select_path(value, selector))
            })
            .unwrap_or_else(|| DEFAULT_PARTITION.to_string())
    }
}

impl Dispatcher for PartitionSerialDispatcher {
    fn push(&self, key: &str, payload: Option<&Value>, job: DispatchJob) {
        let effective_key = format!("{}:{}", key, self.partition_of(payload));

        self.inner.enqueue(effective_key, job);
    }
}

/// Follows a dot-separated path into the given JSON value and renders the
/// found leaf as a partition value. Empty strings and non-scalar leaves don't
/// count, so the next selector gets a chance.
fn select_path(value: &Value, path: &str) -> Option<String> {
    let mut cursor = value;

    for part in path.split('.') {
        cursor = cursor.get(part)?;
    }

    match cursor {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher(selectors: &[&str]) -> PartitionSerialDispatcher {
        PartitionSerialDispatcher::new(selectors.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn first_yielding_selector_wins() {
        // Given
        let dispatcher = dispatcher(&["missing.path", "order.customerId", "order.region"]);

        // When
        let partition = dispatcher.partition_of(Some(&json!({
            "order": {"customerId": "c-42", "region": "eu"},
        })));

        // Then
        assert_eq!(partition, "c-42");
    }

    #[test]
    fn empty_strings_fall_through() {
        // Given
        let dispatcher = dispatcher(&["order.customerId", "order.region"]);

        // When
        let partition = dispatcher.partition_of(Some(&json!({
            "order": {"customerId": "", "region": "eu"},
        })));

        // Then
        assert_eq!(partition, "eu");
    }

    #[test]
    fn scalar_leaves_are_rendered() {
        // Given
        let dispatcher = dispatcher(&["shard"]);

        // Then
        assert_eq!(dispatcher.partition_of(Some(&json!({"shard": 7}))), "7");
        assert_eq!(dispatcher.partition_of(Some(&json!({"shard": true}))), "true");
    }

    #[test]
    fn defaults_when_nothing_yields() {
        // Given
        let dispatcher = dispatcher(&["order.customerId"]);

        // Then
        assert_eq!(dispatcher.partition_of(None), DEFAULT_PARTITION);
        assert_eq!(
            dispatcher.partition_of(Some(&json!({"order": {}}))),
            DEFAULT_PARTITION,
        );
        assert_eq!(
            dispatcher.partition_of(Some(&json!({"order": {"customerId": {"nested": 1}}}))),
            DEFAULT_PARTITION,
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partitions_are_ordered_internally_and_concurrent_externally() {
        // Given
        let dispatcher = dispatcher(&["customer"]);
        let log: Arc<SyncMutex<Vec<(String, usize)>>> = Arc::new(SyncMutex::new(Vec::new()));

        // When: one slow partition, one quick partition, interleaved pushes
        for index in 0..3usize {
            for (customer, delay) in [("slow", 30u64), ("quick", 1u64)] {
                let log = Arc::clone(&log);
                let payload = json!({"customer": customer});
                let customer = customer.to_string();

                dispatcher.push(
                    "queue",
                    Some(&payload),
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        log.lock().push((customer, index));
                    }),
                );
            }
        }
        for _ in 0..400 {
            if log.lock().len() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Then: no cross-partition leakage, counts match pushes
        let completed = log.lock().clone();
        assert_eq!(completed.len(), 6);

        let mut per_partition: HashMap<String, Vec<usize>> = HashMap::new();
        for (partition, index) in &completed {
            per_partition.entry(partition.clone()).or_default().push(*index);
        }

        // Then: each partition observed strictly its own push order
        assert_eq!(per_partition["slow"], vec![0, 1, 2]);
        assert_eq!(per_partition["quick"], vec![0, 1, 2]);

        // Then: the quick partition overtook the slow one
        let first_finisher = &completed.first().unwrap().0;
        assert_eq!(first_finisher, "quick");
    }
}
