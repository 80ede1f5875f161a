use crate::config::SubscribeOptions;
use crate::handler::HandlerTable;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

/// The per-queue consumption state of a [`Bus`](crate::Bus).
///
/// A subscription record is created by `subscribe`, tagged when a broker
/// consumer is registered, cleared (tag dropped, record and handlers
/// retained for a later resubscribe) by `unsubscribe`, and removed for good
/// by `remove`/`stop`. Orthogonally, a queue name can be administratively
/// blocked: a blocked queue keeps its record but must not be consuming —
/// the facade stops the broker consumer when blocking.
///
/// Every mutation emits a [`SubscriptionEvent`].
pub struct SubscriptionManager {
    state: SyncMutex<State>,
    events: broadcast::Sender<SubscriptionEvent>,
}

struct State {
    subscriptions: HashMap<String, Arc<Subscription>>,
    blocked: HashSet<String>,
}

/// A single queue subscription: the registered handlers, the options, and
/// the broker consumer identity (present iff actively consuming).
pub struct Subscription {
    queue: Arc<str>,
    handlers: HandlerTable,
    options: SubscribeOptions,
    consumer_tag: SyncMutex<Option<String>>,
}

/// Announces a mutation of the subscription state.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A subscription record was created.
    Created {
        /// The subscribed queue.
        queue: Arc<str>,
    },
    /// A broker consumer was registered for the queue.
    Tagged {
        /// The subscribed queue.
        queue: Arc<str>,
        /// The broker consumer tag.
        tag: String,
    },
    /// The broker consumer was dropped; the record is retained.
    Cleared {
        /// The subscribed queue.
        queue: Arc<str>,
    },
    /// The subscription record was removed.
    Removed {
        /// The formerly subscribed queue.
        queue: Arc<str>,
    },
    /// The queue was administratively blocked.
    Blocked {
        /// The blocked queue.
        queue: Arc<str>,
    },
    /// The queue was administratively unblocked.
    Unblocked {
        /// The unblocked queue.
        queue: Arc<str>,
    },
}

impl Subscription {
    /// Reports the queue of this subscription.
    pub fn queue(&self) -> &Arc<str> {
        &self.queue
    }

    /// Exposes the registered handlers.
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Exposes the subscription options.
    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// Reports the current broker consumer tag, if consuming.
    pub fn consumer_tag(&self) -> Option<String> {
        self.consumer_tag.lock().clone()
    }

    /// Reports whether a broker consumer is currently registered.
    pub fn is_consuming(&self) -> bool {
        self.consumer_tag.lock().is_some()
    }
}

impl SubscriptionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            state: SyncMutex::new(State {
                subscriptions: HashMap::new(),
                blocked: HashSet::new(),
            }),
            events,
        }
    }

    /// Returns a receiver of [`SubscriptionEvent`]s.
    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// Creates a subscription record for the given queue. Returns `false`
    /// without touching the existing record if one is already present.
    pub fn create(&self, queue: &str, handlers: HandlerTable, options: SubscribeOptions) -> bool {
        let mut state = self.state.lock();

        if state.subscriptions.contains_key(queue) {
            return false;
        }

        let queue: Arc<str> = Arc::from(queue);
        state.subscriptions.insert(
            queue.to_string(),
            Arc::new(Subscription {
                queue: queue.clone(),
                handlers,
                options,
                consumer_tag: SyncMutex::new(None),
            }),
        );
        drop(state);

        debug!(queue = queue.as_ref(), "Created a subscription record");
        let _ = self.events.send(SubscriptionEvent::Created { queue });

        true
    }

    /// Retrieves the subscription record for the given queue, if present.
    pub fn get(&self, queue: &str) -> Option<Arc<Subscription>> {
        self.state.lock().subscriptions.get(queue).cloned()
    }

    /// Records the broker consumer tag on the given queue's subscription.
    /// Returns `false` if no record exists.
    pub fn tag(&self, queue: &str, tag: impl Into<String>) -> bool {
        let Some(subscription) = self.get(queue) else {
            return false;
        };

        let tag = tag.into();
        *subscription.consumer_tag.lock() = Some(tag.clone());

        let _ = self.events.send(SubscriptionEvent::Tagged {
            queue: subscription.queue.clone(),
            tag,
        });

        true
    }

    /// Drops the broker consumer tag of the given queue's subscription while
    /// retaining the record (and its handlers) for a later resubscribe.
    /// Returns `false` if no record exists.
    pub fn clear(&self, queue: &str) -> bool {
        let Some(subscription) = self.get(queue) else {
            return false;
        };

        *subscription.consumer_tag.lock() = None;

        let _ = self.events.send(SubscriptionEvent::Cleared {
            queue: subscription.queue.clone(),
        });

        true
    }

    /// Removes the subscription record of the given queue entirely.
    pub fn remove(&self, queue: &str) -> Option<Arc<Subscription>> {
        let removed = self.state.lock().subscriptions.remove(queue);

        if let Some(ref subscription) = removed {
            *subscription.consumer_tag.lock() = None;

            let _ = self.events.send(SubscriptionEvent::Removed {
                queue: subscription.queue.clone(),
            });
        }

        removed
    }

    /// Reports whether the given queue has a subscription record, and — with
    /// `require_consumer_tag` — whether it is also actively consuming.
    pub fn contains(&self, queue: &str, require_consumer_tag: bool) -> bool {
        match self.get(queue) {
            Some(subscription) => !require_consumer_tag || subscription.is_consuming(),
            None => false,
        }
    }

    /// Administratively blocks the given queue name. Returns `false` if the
    /// queue is already blocked.
    ///
    /// Blocking does not by itself stop an active consumer; the facade is
    /// responsible for cancelling it, keeping "blocked" and "actively
    /// consuming" mutually exclusive.
    pub fn block(&self, queue: &str) -> bool {
        let inserted = self.state.lock().blocked.insert(queue.to_string());

        if inserted {
            let _ = self.events.send(SubscriptionEvent::Blocked {
                queue: Arc::from(queue),
            });
        }

        inserted
    }

    /// Lifts the administrative block from the given queue name. Returns
    /// `false` if the queue is not blocked.
    pub fn unblock(&self, queue: &str) -> bool {
        let removed = self.state.lock().blocked.remove(queue);

        if removed {
            let _ = self.events.send(SubscriptionEvent::Unblocked {
                queue: Arc::from(queue),
            });
        }

        removed
    }

    /// Reports whether the given queue name is administratively blocked.
    pub fn is_blocked(&self, queue: &str) -> bool {
        self.state.lock().blocked.contains(queue)
    }

    /// Lists the queues that currently have a subscription record.
    pub fn queues(&self) -> Vec<String> {
        self.state.lock().subscriptions.keys().cloned().collect()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Finalization, handler_fn};
    use pretty_assertions::assert_eq;

    fn ack_handlers(patterns: &[&str]) -> HandlerTable {
        let mut handlers = HandlerTable::new();
        for pattern in patterns {
            handlers.insert(*pattern, handler_fn(|_| async { Finalization::Ack }));
        }
        handlers
    }

    #[test]
    fn create_is_first_writer_wins() {
        // Given
        let manager = SubscriptionManager::new();
        assert!(manager.create("billing", ack_handlers(&["a.#"]), SubscribeOptions::default()));

        // When: a second create arrives with different handlers
        let accepted = manager.create(
            "billing",
            ack_handlers(&["a.#", "b.#"]),
            SubscribeOptions::default(),
        );

        // Then: refused, and the original handlers are untouched
        assert!(!accepted);
        assert_eq!(manager.get("billing").unwrap().handlers().len(), 1);
    }

    #[test]
    fn contains_distinguishes_record_from_consuming() {
        // Given
        let manager = SubscriptionManager::new();
        manager.create("billing", ack_handlers(&["a.#"]), SubscribeOptions::default());

        // Then: a record exists, but nothing is consuming
        assert!(manager.contains("billing", false));
        assert!(!manager.contains("billing", true));

        // When
        assert!(manager.tag("billing", "consumer-1"));

        // Then
        assert!(manager.contains("billing", true));
        assert_eq!(
            manager.get("billing").unwrap().consumer_tag().as_deref(),
            Some("consumer-1"),
        );
    }

    #[test]
    fn clear_retains_the_record() {
        // Given
        let manager = SubscriptionManager::new();
        manager.create("billing", ack_handlers(&["a.#"]), SubscribeOptions::default());
        manager.tag("billing", "consumer-1");

        // When
        assert!(manager.clear("billing"));

        // Then
        assert!(manager.contains("billing", false));
        assert!(!manager.contains("billing", true));
        assert_eq!(manager.get("billing").unwrap().handlers().len(), 1);
    }

    #[test]
    fn remove_forgets_the_record() {
        // Given
        let manager = SubscriptionManager::new();
        manager.create("billing", ack_handlers(&["a.#"]), SubscribeOptions::default());

        // When
        assert!(manager.remove("billing").is_some());

        // Then
        assert!(!manager.contains("billing", false));
        assert!(manager.remove("billing").is_none());
    }

    #[test]
    fn block_and_unblock_refuse_the_current_state() {
        // Given
        let manager = SubscriptionManager::new();

        // Then
        assert!(!manager.unblock("billing"));
        assert!(manager.block("billing"));
        assert!(!manager.block("billing"));
        assert!(manager.is_blocked("billing"));
        assert!(manager.unblock("billing"));
        assert!(!manager.is_blocked("billing"));
    }

    #[test]
    fn tag_and_clear_require_a_record() {
        // Given
        let manager = SubscriptionManager::new();

        // Then
        assert!(!manager.tag("billing", "consumer-1"));
        assert!(!manager.clear("billing"));
    }

    #[tokio::test]
    async fn mutations_emit_events() {
        // Given
        let manager = SubscriptionManager::new();
        let mut events = manager.events();

        // When
        manager.create("billing", ack_handlers(&["a.#"]), SubscribeOptions::default());
        manager.tag("billing", "consumer-1");
        manager.block("billing");

        // Then
        assert!(matches!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Created { queue } if queue.as_ref() == "billing",
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Tagged { queue, tag } if queue.as_ref() == "billing" && tag == "consumer-1",
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Blocked { queue } if queue.as_ref() == "billing",
        ));
    }
}
