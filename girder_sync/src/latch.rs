use tokio_util::sync::CancellationToken;

/// A one-shot notification that can be opened exactly once, waking every task
/// that awaits one of its [`Gate`]s.
///
/// The intended use is guarding an in-flight creation of a shared resource:
/// the task that performs the creation holds the latch, every task that finds
/// the creation already in progress derives a gate and awaits it. When the
/// creation settles (successfully or not), the creating task opens the latch,
/// and all waiters wake immediately to re-check the outcome.
///
/// ```
/// use girder_sync::Latch;
///
/// # tokio_test::block_on(async {
/// let latch = Latch::new();
/// let gate = latch.gate();
///
/// tokio::spawn(async move {
///     // ... establish the shared resource ...
///     latch.open();
/// });
///
/// // Wakes as soon as the latch is opened
/// gate.passed().await;
/// # })
/// ```
#[derive(Debug, Default, Clone)]
pub struct Latch {
    token: CancellationToken,
}

/// An awaitable handle onto a [`Latch`]. Cheap to clone; any number of tasks
/// may await the same gate, before or after the latch is opened.
#[derive(Debug, Clone)]
pub struct Gate {
    token: CancellationToken,
}

impl Latch {
    /// Returns a brand new, unopened [`Latch`].
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derives a new [`Gate`] tied to this [`Latch`].
    pub fn gate(&self) -> Gate {
        Gate {
            token: self.token.clone(),
        }
    }

    /// Permanently opens this [`Latch`], waking all tasks awaiting any of the
    /// derived [`Gate`]s. Subsequent calls have no additional effect.
    pub fn open(&self) {
        self.token.cancel();
    }
}

impl Gate {
    /// Waits until the originating [`Latch`] is [opened](Latch::open).
    /// Resolves immediately if the latch has already been opened.
    pub async fn passed(&self) {
        self.token.cancelled().await;
    }

    /// Reports whether the originating [`Latch`] has been opened.
    pub fn is_open(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_wake_on_open() {
        // Given
        let latch = Latch::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // Given: several tasks awaiting gates of the same latch
        let mut tasks = vec![];
        for _ in 0..3 {
            let gate = latch.gate();
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                gate.passed().await;
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }

        // When: the tasks had a chance to start waiting
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        // When
        latch.open();
        for task in tasks {
            task.await.unwrap();
        }

        // Then
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn gate_after_open_resolves_immediately() {
        // Given
        let latch = Latch::new();
        latch.open();

        // When
        let gate = latch.gate();
        gate.passed().await;

        // Then
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn repeated_open_is_harmless() {
        // Given
        let latch = Latch::new();
        let gate = latch.gate();

        // When
        latch.open();
        latch.open();

        // Then
        gate.passed().await;
        assert!(gate.is_open());
    }

    #[test]
    fn starts_closed() {
        // Given
        let latch = Latch::new();

        // Then
        assert!(!latch.gate().is_open());
    }
}
