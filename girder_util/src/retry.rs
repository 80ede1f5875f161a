use crate::Backoff;
use std::error::Error;
use std::future::Future;
use thiserror::Error;

/// Represents the failure of a [`retry`] call.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: Error + 'static,
{
    /// Every allowed attempt failed with a retryable error.
    #[error("exceeded maximum attempts of retries of {attempts}")]
    Exhausted {
        /// How many attempts were made before giving up.
        attempts: usize,
        /// The error produced by the last attempt.
        #[source]
        source: E,
    },

    /// An attempt failed with an error that the caller's predicate judged
    /// non-retryable, so the remaining retry budget was not consumed.
    #[error("refused to retry a non-retryable error")]
    Aborted {
        /// The non-retryable error.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: Error + 'static,
{
    /// Unwraps the underlying error of the final attempt.
    pub fn into_source(self) -> E {
        match self {
            Self::Exhausted { source, .. } => source,
            Self::Aborted { source } => source,
        }
    }
}

/// Re-runs the given fallible asynchronous `operation` until it succeeds, up
/// to `max_attempts` times (at least once), sleeping the next interval of the
/// given [`Backoff`] between attempts.
///
/// Before sleeping, every error is shown to the `should_retry` predicate: a
/// `false` verdict aborts immediately, without consuming the remaining retry
/// budget. This is the escape hatch for errors that no amount of retrying can
/// fix (e.g., an unresolvable host name).
///
/// On success, the backoff is [reset](Backoff::reset), so that a shared
/// backoff starts from the initial interval on the next incident.
pub async fn retry<T, E, F, Fut, P>(
    max_attempts: usize,
    backoff: &Backoff,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => {
                backoff.reset();

                return Ok(value);
            }
            Err(error) => {
                if !should_retry(&error) {
                    return Err(RetryError::Aborted { source: error });
                }

                if attempt == max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: max_attempts,
                        source: error,
                    });
                }

                backoff.sleep_next().await;
            }
        }
    }

    unreachable!("the retry loop returns on the last attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackoffConfig;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug, PartialEq)]
    #[error("flaky failure")]
    struct FlakyError {
        fatal: bool,
    }

    fn quick_backoff() -> Backoff {
        Backoff::new(
            BackoffConfig::default()
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(2)),
        )
    }

    async fn fail_until(counter: &AtomicUsize, successful_attempt: usize) -> Result<usize, FlakyError> {
        let attempt = counter.fetch_add(1, Ordering::Relaxed) + 1;

        if attempt < successful_attempt {
            Err(FlakyError { fatal: false })
        } else {
            Ok(attempt)
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        // Given
        let counter = AtomicUsize::new(0);

        // When
        let outcome = retry(5, &quick_backoff(), |_| true, || {
            fail_until(&counter, 3)
        })
        .await;

        // Then
        assert_eq!(outcome.unwrap(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausts_the_attempt_budget() {
        // Given
        let counter = AtomicUsize::new(0);

        // When
        let outcome = retry(3, &quick_backoff(), |_| true, || {
            fail_until(&counter, 10)
        })
        .await;

        // Then
        let error = outcome.unwrap_err();
        assert_eq!(
            error.to_string(),
            "exceeded maximum attempts of retries of 3",
        );
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn aborts_on_non_retryable_error() {
        // Given
        let counter = AtomicUsize::new(0);

        // When: the predicate refuses fatal errors
        let outcome: Result<usize, _> = retry(
            5,
            &quick_backoff(),
            |error: &FlakyError| !error.fatal,
            || {
                counter.fetch_add(1, Ordering::Relaxed);
                async { Err(FlakyError { fatal: true }) }
            },
        )
        .await;

        // Then: the budget is not consumed
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(matches!(
            outcome.unwrap_err(),
            RetryError::Aborted {
                source: FlakyError { fatal: true },
            },
        ));
    }

    #[tokio::test]
    async fn runs_at_least_once() {
        // Given
        let counter = AtomicUsize::new(0);

        // When: a zero budget is still one attempt
        let outcome = retry(0, &quick_backoff(), |_| true, || {
            fail_until(&counter, 1)
        })
        .await;

        // Then
        assert_eq!(outcome.unwrap(), 1);
    }
}
