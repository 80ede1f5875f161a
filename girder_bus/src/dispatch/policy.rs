use crate::dispatch::concurrent::ConcurrentDispatcher;
use crate::dispatch::partition::PartitionSerialDispatcher;
use crate::dispatch::serial::SerialDispatcher;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A nullary asynchronous delegate as accepted by a [`Dispatcher`].
pub type DispatchJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Decides the execution ordering of delegates sharing a key.
///
/// `push` never blocks the caller: the delegate is enqueued (or spawned) and
/// the call returns. Errors and panics inside a delegate are swallowed at the
/// scheduler boundary; a delegate must signal failure through its own side
/// channel.
pub trait Dispatcher: Send + Sync {
    /// Enqueues the delegate under the ordering policy for `key`. The
    /// partitioned policy additionally derives a sub-key from `payload`;
    /// other policies ignore it.
    fn push(&self, key: &str, payload: Option<&Value>, job: DispatchJob);
}

/// Selects the [`Dispatcher`] implementation for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DispatchType {
    /// Strict one-at-a-time, push-ordered execution per key.
    #[serde(rename = "serial")]
    Serial,

    /// Serial within a partition derived from the message payload,
    /// concurrent across partitions.
    #[serde(rename = "partitionSerial", alias = "partition_serial")]
    PartitionSerial,

    /// No coordination; every delegate is scheduled immediately.
    #[default]
    #[serde(rename = "concurrent")]
    Concurrent,
}

impl DispatchType {
    /// Builds the dispatcher implementing this policy. The
    /// `partition_key_selectors` feed the partitioned variant and are ignored
    /// by the others.
    pub fn build(self, partition_key_selectors: &[String]) -> Arc<dyn Dispatcher> {
        match self {
            Self::Serial => Arc::new(SerialDispatcher::new()),
            Self::PartitionSerial => Arc::new(PartitionSerialDispatcher::new(
                partition_key_selectors.to_vec(),
            )),
            Self::Concurrent => Arc::new(ConcurrentDispatcher),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_the_documented_names() {
        // Then
        assert_eq!(
            serde_yml::from_str::<DispatchType>("serial").unwrap(),
            DispatchType::Serial,
        );
        assert_eq!(
            serde_yml::from_str::<DispatchType>("partitionSerial").unwrap(),
            DispatchType::PartitionSerial,
        );
        assert_eq!(
            serde_yml::from_str::<DispatchType>("concurrent").unwrap(),
            DispatchType::Concurrent,
        );
    }

    #[test]
    fn defaults_to_concurrent() {
        // Then
        assert_eq!(DispatchType::default(), DispatchType::Concurrent);
    }
}
