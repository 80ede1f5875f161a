use crate::BackoffConfig;
use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;

/// Thin wrapper around [`ExponentialBackoff`] that provides light-weight
/// synchronization for interior mutability, convenience methods, and
/// opinionated defaults.
pub struct Backoff {
    inner: SyncMutex<ExponentialBackoff>,
}

impl Backoff {
    /// Builds a new [`Backoff`] based on the given [`BackoffConfig`].
    pub fn new(config: impl AsRef<BackoffConfig>) -> Self {
        let config = config.as_ref();
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval())
            .with_max_interval(config.max_interval())
            .with_randomization_factor(config.randomization_factor())
            .with_multiplier(config.multiplier())
            .with_max_elapsed_time(config.max_elapsed_time())
            .build();

        Self {
            inner: SyncMutex::new(inner),
        }
    }

    /// Returns the next backoff interval, or [`None`] once the configured
    /// max elapsed time is spent.
    pub fn next(&self) -> Option<Duration> {
        self.inner.lock().next_backoff()
    }

    /// Sleeps for the next backoff interval. Once the backoff is spent, this
    /// degrades into yielding to the runtime.
    pub async fn sleep_next(&self) {
        let next_duration = self.next();

        if let Some(duration) = next_duration {
            tokio::time::sleep(duration).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    /// Resets this backoff to the initial interval.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_grow() {
        // Given: no randomization, so intervals are predictable
        let config = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
        };
        let backoff = Backoff::new(&config);

        // When
        let first = backoff.next().unwrap();
        let second = backoff.next().unwrap();

        // Then
        assert!(second > first);
    }

    #[test]
    fn reset_restores_initial_interval() {
        // Given
        let config = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_elapsed_time: None,
        };
        let backoff = Backoff::new(&config);

        // When
        let first = backoff.next().unwrap();
        let _ = backoff.next().unwrap();
        backoff.reset();
        let after_reset = backoff.next().unwrap();

        // Then
        assert_eq!(first, after_reset);
    }
}
