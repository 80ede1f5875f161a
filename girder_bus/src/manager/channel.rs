use crate::manager::connection::{
    ConnectionContext, ConnectionEvent, ConnectionManager, OpenChannelError,
};
use girder_sync::Latch;
use girder_util::{Backoff, RetryError, TimeoutError, retry, within};
use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use lapin::{Channel, Error as LapinError};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Owns the named channels of a bus, each scoped to one connection context.
///
/// Mirrors the [`ConnectionManager`] state machine, keyed per channel:
/// lazy creation behind a one-shot gate, publisher-confirm mode, prefetch
/// application. A channel cannot outlive its connection: the manager
/// subscribes to connection events at construction, and a parent connection's
/// close or removal cascades into close+removal of every channel bound to it.
///
/// Must be created inside a Tokio runtime: the cascade runs on a background
/// task.
pub struct ChannelManager {
    contexts: SyncMutex<HashMap<String, Arc<ChannelContext>>>,
    events: broadcast::Sender<ChannelEvent>,
}

/// The per-name channel state: the exclusively owned channel plus the
/// non-owning back-reference to the connection context it was opened on.
pub struct ChannelContext {
    name: Arc<str>,
    connection_name: Arc<str>,
    options: ChannelOptions,
    channel: AsyncMutex<Option<Channel>>,
    lock: AtomicBool,
    latch: SyncMutex<Latch>,
}

/// The knobs applied to a freshly opened channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    prefetch: Option<u16>,
}

impl ChannelOptions {
    /// Reports the prefetch limit applied to the channel.
    pub fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    /// Re-creates these options with the given prefetch limit.
    pub fn with_prefetch(self, prefetch: u16) -> Self {
        Self {
            prefetch: Some(prefetch),
        }
    }
}

/// Announces a channel lifecycle transition.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A channel was opened and configured.
    Created {
        /// The channel context name.
        name: Arc<str>,
    },
    /// The channel was explicitly closed; the context is retained.
    Closed {
        /// The channel context name.
        name: Arc<str>,
    },
    /// The channel context was removed, either explicitly or by the parent
    /// connection going away.
    Removed {
        /// The channel context name.
        name: Arc<str>,
    },
}

/// Represents the failure of a single channel acquisition attempt.
#[derive(Error, Debug)]
pub enum AcquireError {
    /// The attempt did not settle within the connection handle's timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Opening or configuring the channel failed.
    #[error(transparent)]
    Open(#[from] OpenChannelError),
}

/// Represents a failure to produce a live channel context.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Channel options were not provided.
    #[error("channel options are required to create a channel")]
    Configuration,

    /// The targeted connection context holds no live connection.
    #[error("no live connection on context '{name}'")]
    NoConnection {
        /// The connection context name.
        name: String,
    },

    /// The bounded retrying of channel acquisition failed.
    #[error(transparent)]
    Retry(#[from] RetryError<AcquireError>),

    /// An in-flight creation by another caller did not settle within the
    /// connection handle's recovery window.
    #[error("creation of channel '{name}' did not settle within its recovery window")]
    CreationStalled {
        /// The channel context name.
        name: String,
    },
}

impl ChannelContext {
    fn new(name: &str, connection_name: Arc<str>, options: ChannelOptions) -> Self {
        // The creator starts out holding the lock
        Self {
            name: Arc::from(name),
            connection_name,
            options,
            channel: AsyncMutex::new(None),
            lock: AtomicBool::new(true),
            latch: SyncMutex::new(Latch::new()),
        }
    }

    /// Reports the context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the name of the connection context this channel is bound to.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    /// Exposes the options this channel was configured with.
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Reports whether a creation is currently in flight.
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire)
    }

    /// Reports whether the context currently holds a live channel.
    pub async fn is_open(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|channel| channel.status().connected())
    }

    /// Clones out the live channel, if any.
    pub async fn channel(&self) -> Option<Channel> {
        self.channel
            .lock()
            .await
            .as_ref()
            .filter(|channel| channel.status().connected())
            .cloned()
    }

    fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    fn try_acquire_lock(&self) -> bool {
        let acquired = self
            .lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if acquired {
            *self.latch.lock() = Latch::new();
        }

        acquired
    }

    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
        self.latch.lock().open();
    }

    fn gate(&self) -> girder_sync::Gate {
        self.latch.lock().gate()
    }
}

/// The role a `create` call assumes after inspecting the context map.
enum CreateRole {
    Establisher(Arc<ChannelContext>),
    Waiter(Arc<ChannelContext>),
    Inspector(Arc<ChannelContext>),
}

impl ChannelManager {
    /// Creates a manager that cascades from the given
    /// [`ConnectionManager`]'s events.
    pub fn new(connections: &Arc<ConnectionManager>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let manager = Arc::new(Self {
            contexts: SyncMutex::new(HashMap::new()),
            events,
        });

        tokio::spawn(Self::cascade(
            Arc::downgrade(&manager),
            connections.events(),
        ));

        manager
    }

    /// Returns a receiver of [`ChannelEvent`]s.
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Produces the channel context for the given name, opening and
    /// configuring a channel on the given connection context if necessary.
    ///
    /// Fails synchronously with a configuration error when `options` is
    /// omitted, and with a no-connection error when the connection context
    /// holds no live connection. Channel acquisition is bounded by the
    /// connection handle's timeout and retry budget.
    pub async fn create(
        &self,
        name: &str,
        connection: &Arc<ConnectionContext>,
        options: Option<ChannelOptions>,
    ) -> Result<Arc<ChannelContext>, ChannelError> {
        let Some(options) = options else {
            return Err(ChannelError::Configuration);
        };

        loop {
            let role = {
                let mut contexts = self.contexts.lock();

                match contexts.get(name) {
                    Some(context) if context.is_locked() => CreateRole::Waiter(context.clone()),
                    Some(context) => CreateRole::Inspector(context.clone()),
                    None => {
                        let context = Arc::new(ChannelContext::new(
                            name,
                            Arc::from(connection.name()),
                            options.clone(),
                        ));
                        contexts.insert(name.to_string(), context.clone());

                        CreateRole::Establisher(context)
                    }
                }
            };

            match role {
                CreateRole::Establisher(context) => {
                    self.establish(&context, connection).await?;

                    return Ok(context);
                }

                CreateRole::Waiter(context) => {
                    let gate = context.gate();
                    let window = connection.handle().recovery_window();

                    if within(window, gate.passed()).await.is_err() {
                        return Err(ChannelError::CreationStalled {
                            name: name.to_string(),
                        });
                    }
                }

                CreateRole::Inspector(context) => {
                    if context.is_open().await {
                        return Ok(context);
                    }

                    if context.try_acquire_lock() {
                        self.establish(&context, connection).await?;

                        return Ok(context);
                    }
                }
            }
        }
    }

    /// Closes the live channel of the given context, retaining the context.
    /// No-op if the name is unknown.
    pub async fn close(&self, name: &str) {
        let Some(context) = self.get(name) else {
            return;
        };

        let channel = context.channel.lock().await.take();
        if let Some(channel) = channel {
            Self::close_channel(&context.name, channel).await;
        }

        let _ = self.events.send(ChannelEvent::Closed {
            name: context.name_arc(),
        });
    }

    /// Closes and deletes the given context, emitting
    /// [`Removed`](ChannelEvent::Removed) so dependents (e.g., consumer
    /// recovery) can react. No-op if the name is unknown.
    pub async fn remove(&self, name: &str) {
        let Some(context) = self.contexts.lock().remove(name) else {
            return;
        };

        let channel = context.channel.lock().await.take();
        if let Some(channel) = channel {
            Self::close_channel(&context.name, channel).await;
        }

        let _ = self.events.send(ChannelEvent::Removed {
            name: context.name_arc(),
        });
    }

    /// Removes every channel context bound to the given connection context.
    pub async fn remove_for_connection(&self, connection_name: &str) {
        let names: Vec<String> = self
            .contexts
            .lock()
            .values()
            .filter(|context| context.connection_name() == connection_name)
            .map(|context| context.name().to_string())
            .collect();

        for name in names {
            debug!(
                channel = name.as_str(),
                connection = connection_name,
                "Cascading a connection loss into channel removal",
            );

            self.remove(&name).await;
        }
    }

    /// Retrieves the context under the given name, if present.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelContext>> {
        self.contexts.lock().get(name).cloned()
    }

    /// Reports whether a context exists under the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.contexts.lock().contains_key(name)
    }

    /// Lists the names of all current contexts.
    pub fn names(&self) -> Vec<String> {
        self.contexts.lock().keys().cloned().collect()
    }

    /// Clones out the live channel under the given name, if any.
    pub async fn channel(&self, name: &str) -> Option<Channel> {
        match self.get(name) {
            Some(context) => context.channel().await,
            None => None,
        }
    }
}

impl ChannelManager {
    /// Runs the bounded retrying of channel acquisition for a context whose
    /// lock this caller holds. On failure, the context is discarded so a
    /// later `create` starts clean.
    async fn establish(
        &self,
        context: &Arc<ChannelContext>,
        connection: &Arc<ConnectionContext>,
    ) -> Result<(), ChannelError> {
        let handle = connection.handle();
        let backoff = Backoff::new(handle.backoff());

        let result = retry(
            handle.retry_count(),
            &backoff,
            // A missing connection is not fixed by retrying here; recovery
            // of the connection is the ConnectionManager's business
            |error| {
                !matches!(
                    error,
                    AcquireError::Open(OpenChannelError::NoConnection { .. }),
                )
            },
            || async {
                let channel = within(handle.timeout(), Self::acquire(context, connection)).await??;

                Ok::<Channel, AcquireError>(channel)
            },
        )
        .await;

        match result {
            Ok(channel) => {
                *context.channel.lock().await = Some(channel);
                context.release_lock();

                info!(
                    name = context.name(),
                    connection = connection.name(),
                    "Opened a broker channel",
                );

                let _ = self.events.send(ChannelEvent::Created {
                    name: context.name_arc(),
                });

                Ok(())
            }
            Err(error) => {
                warn!(
                    name = context.name(),
                    connection = connection.name(),
                    ?error,
                    error_message = %error,
                    "Failed to open a broker channel",
                );

                self.contexts.lock().remove(context.name());
                context.release_lock();

                Err(match error {
                    RetryError::Aborted {
                        source: AcquireError::Open(OpenChannelError::NoConnection { name }),
                    } => ChannelError::NoConnection { name },
                    other => ChannelError::Retry(other),
                })
            }
        }
    }

    /// Opens one channel on the connection, puts it in publisher-confirm
    /// mode, and applies the prefetch limit.
    async fn acquire(
        context: &Arc<ChannelContext>,
        connection: &Arc<ConnectionContext>,
    ) -> Result<Channel, OpenChannelError> {
        let channel = connection.open_channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(OpenChannelError::from)?;

        if let Some(prefetch) = context.options().prefetch() {
            channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(OpenChannelError::from)?;
        }

        Ok(channel)
    }

    /// Reacts to connection lifecycle events for as long as the manager
    /// lives: a connection going away takes its channels with it.
    async fn cascade(
        manager: Weak<ChannelManager>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(
                    ConnectionEvent::Closed { name }
                    | ConnectionEvent::Removed { name }
                    | ConnectionEvent::RecoveryFailed { name },
                ) => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };

                    manager.remove_for_connection(&name).await;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Works on closing the given channel, logging the outcome.
    async fn close_channel(name: &str, channel: Channel) {
        let result = channel.close(200, "Closed channel").await;

        match result {
            Ok(_) => info!(name, "Closed a broker channel"),
            Err(LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_)) => {
                info!(name, "Discarded a previously lost broker channel")
            }
            Err(error) => warn!(
                name,
                ?error,
                error_message = %error,
                "Failed to cleanly close a broker channel",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;
    use pretty_assertions::assert_eq;

    fn bare_connection_context() -> Arc<ConnectionContext> {
        // A context that never held a live connection
        Arc::new(ConnectionContext::new("conn", Handle::default()))
    }

    #[tokio::test]
    async fn create_requires_options() {
        // Given
        let connections = ConnectionManager::new();
        let manager = ChannelManager::new(&connections);

        // When
        let outcome = manager
            .create("publish", &bare_connection_context(), None)
            .await;

        // Then
        assert!(matches!(outcome.unwrap_err(), ChannelError::Configuration));
        assert!(!manager.contains("publish"));
    }

    #[tokio::test]
    async fn create_requires_a_live_connection() {
        // Given
        let connections = ConnectionManager::new();
        let manager = ChannelManager::new(&connections);

        // When
        let outcome = manager
            .create(
                "publish",
                &bare_connection_context(),
                Some(ChannelOptions::default()),
            )
            .await;

        // Then: fails without consuming the retry budget
        assert!(matches!(
            outcome.unwrap_err(),
            ChannelError::NoConnection { name } if name == "conn",
        ));
        assert!(!manager.contains("publish"));
    }

    #[tokio::test]
    async fn channel_of_unknown_name_is_none() {
        // Given
        let connections = ConnectionManager::new();
        let manager = ChannelManager::new(&connections);

        // Then
        assert!(manager.channel("ghost").await.is_none());
        assert_eq!(manager.names(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn remove_of_unknown_name_is_a_no_op() {
        // Given
        let connections = ConnectionManager::new();
        let manager = ChannelManager::new(&connections);

        // When
        manager.remove("ghost").await;
        manager.close("ghost").await;

        // Then
        assert!(!manager.contains("ghost"));
    }
}
