use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Signals that a future bounded by [`within`] did not settle in time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timed out after {}", humantime::format_duration(*limit))]
pub struct TimeoutError {
    limit: Duration,
}

impl TimeoutError {
    /// Reports the deadline that was exceeded.
    pub fn limit(&self) -> Duration {
        self.limit
    }
}

/// Drives the given `future` to completion, unless it takes longer than
/// `limit`, in which case the future is dropped and a [`TimeoutError`] is
/// returned.
///
/// The typical use is bounding a transport call (connect, channel open) that
/// may otherwise hang for as long as the network lets it.
pub async fn within<F>(limit: Duration, future: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TimeoutError { limit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn settles_in_time() {
        // When
        let outcome = within(Duration::from_millis(50), async { 42 }).await;

        // Then
        assert_eq!(outcome, Ok(42));
    }

    #[tokio::test]
    async fn rejects_on_deadline() {
        // When
        let outcome = within(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .await;

        // Then
        let error = outcome.unwrap_err();
        assert_eq!(error.limit(), Duration::from_millis(5));
        assert_eq!(error.to_string(), "timed out after 5ms");
    }
}
